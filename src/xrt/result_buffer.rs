//! Device-written scratch buffer for timer records.
//!
//! A [`ResultBuffer`] owns a debug buffer object for its whole life. Dropping
//! it releases the device reservation, so the next buffer created on the same
//! context starts at host offset zero.

use byteorder::{ByteOrder, LittleEndian};

use super::{BufferObject, HwContext, SyncDirection};
use crate::error::{Result, TimelineError};

/// Debug buffer receiving `(id, high, low)` records from the device.
pub struct ResultBuffer {
    bo: Box<dyn BufferObject>,
    size: usize,
    synced: bool,
}

impl ResultBuffer {
    /// Default size, 128 KiB.
    pub const DEFAULT_SIZE: usize = 0x20000;

    /// Allocate a result buffer of `size` bytes.
    ///
    /// Fails if the buffer does not start at host offset zero, which means an
    /// earlier buffer on this context was never destroyed.
    pub fn create(context: &dyn HwContext, size: usize) -> Result<Self> {
        let bo = context
            .create_debug_bo(size)
            .map_err(|e| TimelineError::BufferAllocationFailed {
                size,
                reason: e.to_string(),
            })?;

        let offset = bo.host_offset();
        if offset != 0 {
            return Err(TimelineError::BufferAllocationFailed {
                size,
                reason: format!(
                    "host offset is 0x{:x}, a previous result buffer is still live",
                    offset
                ),
            });
        }

        log::debug!("Created {} byte result buffer", size);
        Ok(Self {
            bo,
            size,
            synced: false,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn host_offset(&self) -> u64 {
        self.bo.host_offset()
    }

    /// Clear the buffer on both sides.
    pub fn zero(&mut self) -> Result<()> {
        let zeros = vec![0u8; self.size];
        self.bo.write(&zeros, 0)?;
        self.bo.sync(SyncDirection::ToDevice)?;
        self.synced = false;
        Ok(())
    }

    /// Pull device writes into the host view.
    pub fn sync_from_device(&mut self) -> Result<()> {
        self.bo.sync(SyncDirection::FromDevice)?;
        self.synced = true;
        Ok(())
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Host view as little-endian 32-bit words.
    pub fn words(&self) -> Vec<u32> {
        if !self.synced {
            log::warn!("Reading result buffer before it was synced from the device");
        }
        let bytes = self.bo.host_bytes();
        let mut words = vec![0u32; bytes.len() / 4];
        LittleEndian::read_u32_into(&bytes[..words.len() * 4], &mut words);
        words
    }
}

impl Drop for ResultBuffer {
    fn drop(&mut self) {
        log::debug!("Destroying {} byte result buffer", self.size);
    }
}
