//! Op-buffer encoding.
//!
//! The XDP kernel does not accept a bare transaction. It expects an op-buffer:
//!
//! ```text
//! +----------------+----------------+------------------------------+
//! | op type: u32   | size: u32      | transaction bytes (padded)   |
//! | TRANSACTION_OP | header+payload |                              |
//! +----------------+----------------+------------------------------+
//! ```
//!
//! The buffer is position independent: nothing in it refers to its own
//! device address, so it can be copied verbatim into any command buffer.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Result, TimelineError};

/// Op type of a configuration transaction inside an op-buffer.
pub const TRANSACTION_OP: u32 = 0;

/// Kernel opcode that tells the firmware to replay an op-buffer.
pub const CONFIGURE_OPCODE: u64 = 2;

/// Size of the op-buffer header.
pub const OP_BUFFER_HEADER_SIZE: usize = 8;

/// An encoded, self-contained instruction buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBuffer {
    bytes: Vec<u8>,
}

impl InstructionBuffer {
    /// Wrap already-encoded op-buffer bytes, validating the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        split(&bytes)?;
        Ok(Self { bytes })
    }

    /// The encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false for a successfully encoded buffer.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Size in 32-bit words, as passed to the kernel.
    pub fn size_in_words(&self) -> usize {
        self.bytes.len() / 4
    }

    /// Op type and payload (transaction bytes plus padding).
    pub fn split(&self) -> Result<(u32, &[u8])> {
        split(&self.bytes)
    }
}

/// Split raw op-buffer bytes into op type and payload.
pub fn split(bytes: &[u8]) -> Result<(u32, &[u8])> {
    if bytes.len() < OP_BUFFER_HEADER_SIZE {
        return Err(TimelineError::EncodingError(format!(
            "op-buffer of {} bytes has no header",
            bytes.len()
        )));
    }
    let op_type = LittleEndian::read_u32(&bytes[0..4]);
    let size = LittleEndian::read_u32(&bytes[4..8]) as usize;
    if size < OP_BUFFER_HEADER_SIZE || size > bytes.len() {
        return Err(TimelineError::EncodingError(format!(
            "op-buffer size field {} invalid for {} bytes",
            size,
            bytes.len()
        )));
    }
    Ok((op_type, &bytes[OP_BUFFER_HEADER_SIZE..size]))
}

/// Encode a raw exported transaction into an op-buffer.
pub fn encode(raw: &[u8]) -> Result<InstructionBuffer> {
    if raw.is_empty() {
        return Err(TimelineError::EncodingError(
            "raw transaction is empty".to_string(),
        ));
    }

    let padded = (raw.len() + 3) & !3;
    let total = OP_BUFFER_HEADER_SIZE + padded;
    let size = u32::try_from(total).map_err(|_| {
        TimelineError::EncodingError(format!("transaction of {} bytes too large", raw.len()))
    })?;

    let mut bytes = vec![0u8; total];
    LittleEndian::write_u32(&mut bytes[0..4], TRANSACTION_OP);
    LittleEndian::write_u32(&mut bytes[4..8], size);
    bytes[OP_BUFFER_HEADER_SIZE..OP_BUFFER_HEADER_SIZE + raw.len()].copy_from_slice(raw);

    log::debug!("Encoded {} byte transaction into {} byte op-buffer", raw.len(), total);
    Ok(InstructionBuffer { bytes })
}
