//! Accelerator runtime seam.
//!
//! The capture core talks to the device only through these traits: a
//! hardware context that hands out kernels and buffer objects, buffer objects
//! with explicit host/device synchronisation, and run handles that can be
//! waited on once. [`sim`] provides an in-process device behind the same
//! traits.
//!
//! ```text
//!   HwContext ──kernel()──────▶ Kernel ──run()──▶ RunHandle ──wait()──▶ RunState
//!       │
//!       ├──alloc_bo()─────────▶ BufferObject (command buffer)
//!       └──create_debug_bo()──▶ BufferObject (result buffer)
//! ```

pub mod result_buffer;
pub mod sim;
pub mod submitter;

pub use result_buffer::ResultBuffer;
pub use sim::SimContext;
pub use submitter::{LatencyBracket, SubmitterState, TransactionSubmitter};

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Errors reported by a runtime backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XrtError {
    /// No kernel with this name in the context.
    #[error("Kernel '{0}' not found")]
    KernelNotFound(String),

    /// Buffer allocation failed.
    #[error("Out of device memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// A buffer access was out of range or the buffer is gone.
    #[error("Invalid buffer access: {0}")]
    InvalidBuffer(String),

    /// Host/device synchronisation failed.
    #[error("Buffer sync failed: {0}")]
    Sync(String),

    /// Kernel launch or execution failed.
    #[error("Run failed: {0}")]
    Run(String),

    /// A bounded wait expired.
    #[error("Run did not complete within {0:?}")]
    Timeout(Duration),
}

/// Direction of a buffer synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Host writes become visible to the device.
    ToDevice,
    /// Device writes become visible to the host.
    FromDevice,
}

/// Buffer object allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoFlags(u32);

impl BoFlags {
    pub const NORMAL: Self = Self(0);
    /// Host-cached buffer, used for instruction buffers.
    pub const CACHEABLE: Self = Self(1 << 24);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Final state of a kernel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Completed,
    Error,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Completed => write!(f, "completed"),
            RunState::Error => write!(f, "error"),
            RunState::Aborted => write!(f, "aborted"),
        }
    }
}

/// A device-visible buffer with a host-side view.
pub trait BufferObject: Send {
    /// Size in bytes.
    fn size(&self) -> usize;

    /// Copy `data` into the host view at `offset`.
    fn write(&mut self, data: &[u8], offset: usize) -> Result<(), XrtError>;

    /// Host view of the buffer contents.
    fn host_bytes(&self) -> &[u8];

    /// Synchronise the host view with device memory.
    fn sync(&mut self, direction: SyncDirection) -> Result<(), XrtError>;

    /// Offset of this buffer inside the device's debug reservation.
    ///
    /// Zero for ordinary buffers and for the only live debug buffer.
    fn host_offset(&self) -> u64;

    /// Address the device uses to reach this buffer.
    fn device_address(&self) -> u64;
}

/// A pending kernel execution.
pub trait RunHandle: Send {
    /// Block until the run finishes, or until `timeout` expires.
    fn wait(self: Box<Self>, timeout: Option<Duration>) -> Result<RunState, XrtError>;
}

/// A kernel resolved from a hardware context.
pub trait Kernel: Send {
    fn name(&self) -> &str;

    /// Memory group for the given argument index.
    fn group_id(&self, arg: u32) -> u32;

    /// Launch the kernel with `(opcode, instruction buffer, size in words)`.
    fn run(
        &self,
        opcode: u64,
        instructions: &dyn BufferObject,
        size_in_words: u32,
    ) -> Result<Box<dyn RunHandle>, XrtError>;
}

/// A hardware context bound to a device image.
pub trait HwContext: Send + Sync {
    /// Stable identifier, used to match flush requests to an attached context.
    fn id(&self) -> u64;

    fn kernel(&self, name: &str) -> Result<Box<dyn Kernel>, XrtError>;

    fn alloc_bo(&self, size: usize, flags: BoFlags, group: u32) -> Result<Box<dyn BufferObject>, XrtError>;

    /// Allocate a buffer inside the device's debug reservation.
    fn create_debug_bo(&self, size: usize) -> Result<Box<dyn BufferObject>, XrtError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bo_flags() {
        assert!(BoFlags::CACHEABLE.contains(BoFlags::NORMAL));
        assert!(!BoFlags::NORMAL.contains(BoFlags::CACHEABLE));
        assert_eq!(BoFlags::default(), BoFlags::NORMAL);
        assert_eq!(BoFlags::CACHEABLE.bits(), 0x0100_0000);
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Completed.to_string(), "completed");
        assert_eq!(RunState::Aborted.to_string(), "aborted");
    }
}
