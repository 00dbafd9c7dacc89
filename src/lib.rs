//! xdna-timeline library
//!
//! Record-timer timestamp capture for AMD XDNA NPUs: build a transaction,
//! run it through the XDP kernel, and decode the `(id, cycle)` records the
//! device writes back.

pub mod config;
pub mod device;
pub mod error;
pub mod plugin;
pub mod timeline;
pub mod txn;
pub mod xrt;

pub use error::{Result, TimelineError};
