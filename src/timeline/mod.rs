//! Record-timer timeline capture.
//!
//! - [`capture`]: single-shot timer reads through a short-lived result buffer
//! - [`recorder`]: the attach/detach capture window
//! - [`decode`]: the `(id, high, low)` record stream
//! - [`report`]: sinks for decoded records

pub mod capture;
pub mod decode;
pub mod recorder;
pub mod report;

pub use capture::CaptureSession;
pub use decode::{decode_records, RecordCursor, RecordSet, TimerRecord};
pub use recorder::{ClientTimeline, RecorderSettings, TimelineDevice};
pub use report::{write_latency, JsonReport, RecordSink};
