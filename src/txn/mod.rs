//! Serialized AIE transactions.
//!
//! A transaction is the flat byte stream the NPU firmware replays against the
//! tile array. It is recorded through a [`DriverInstance`], exported into an
//! [`ExportedTransaction`], wrapped into an op-buffer by [`encode`] and then
//! handed to the XDP kernel.
//!
//! # Format Overview
//!
//! ```text
//! +------------------------------------------+
//! | Header (16 bytes)                        |
//! |   Major, Minor, DevGen, NumRows          |
//! |   NumCols, NumMemTileRows, pad[2]        |
//! |   NumOps: u32                            |
//! |   TxnSize: u32 (bytes, incl. header)     |
//! +------------------------------------------+
//! | Standard ops (opcode < 128)              |
//! |   [op:8|col:8|row:8|pad:8] [pad:32] ...  |
//! | Custom ops (opcode >= 128)               |
//! |   [op:8|col:8|row:8|pad:8] [size:32] payload
//! +------------------------------------------+
//! ```
//!
//! All multi-byte fields are little-endian.

pub mod builder;
pub mod encoder;
pub mod parser;

pub use builder::{DriverInstance, ExportedTransaction};
pub use encoder::{encode, InstructionBuffer, CONFIGURE_OPCODE, TRANSACTION_OP};
pub use parser::{TransactionStream, TxnInstruction};

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Transaction format major version.
pub const TXN_MAJOR: u8 = 0;
/// Transaction format minor version.
pub const TXN_MINOR: u8 = 1;
/// Transaction header size in bytes.
pub const TXN_HEADER_SIZE: usize = 16;
/// Size of the standard op header (opcode word + padding word).
pub const OP_HEADER_SIZE: usize = 8;
/// Size of the custom op header (opcode word + size word).
pub const CUSTOM_OP_HEADER_SIZE: usize = 8;
/// Payload of a record-timer custom op.
pub const RECORD_TIMER_PAYLOAD_SIZE: usize = 4;

/// Raw transaction header (16 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct RawTxnHeader {
    pub major: u8,
    pub minor: u8,
    pub dev_gen: u8,
    pub num_rows: u8,
    pub num_cols: u8,
    pub num_mem_tile_rows: u8,
    pub pad: [u8; 2],
    /// Number of operations following the header
    pub num_ops: U32,
    /// Total size in bytes, header included
    pub txn_size: U32,
}

/// Transaction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TxnOpcode {
    Write32 = 0,
    BlockWrite = 1,
    BlockSet = 2,
    MaskWrite = 3,
    MaskPoll = 4,
    Noop = 5,
    /// Task completion token (sync on a DMA channel).
    Tct = 128,
    /// Patch a BD address with a host buffer address.
    DdrPatch = 129,
    /// Read a list of registers into the debug buffer.
    ReadRegs = 130,
    /// Append `(id, timer_hi, timer_lo)` to the debug buffer.
    RecordTimer = 131,
    MergeSync = 132,
    Unknown = 255,
}

impl TxnOpcode {
    /// Opcodes at or above this value carry a size word and opaque payload.
    pub const CUSTOM_OP_BEGIN: u8 = 128;

    /// Whether this opcode uses the custom-op layout.
    pub fn is_custom(self) -> bool {
        (self as u8) >= Self::CUSTOM_OP_BEGIN && self != Self::Unknown
    }
}

impl From<u8> for TxnOpcode {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::Write32,
            1 => Self::BlockWrite,
            2 => Self::BlockSet,
            3 => Self::MaskWrite,
            4 => Self::MaskPoll,
            5 => Self::Noop,
            128 => Self::Tct,
            129 => Self::DdrPatch,
            130 => Self::ReadRegs,
            131 => Self::RecordTimer,
            132 => Self::MergeSync,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<RawTxnHeader>(), TXN_HEADER_SIZE);

        let header = RawTxnHeader {
            major: TXN_MAJOR,
            minor: TXN_MINOR,
            dev_gen: 3,
            num_rows: 6,
            num_cols: 5,
            num_mem_tile_rows: 1,
            pad: [0; 2],
            num_ops: U32::new(2),
            txn_size: U32::new(48),
        };
        let bytes = header.as_bytes();
        // Magic word seen at the start of NPU1 instruction streams
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 0x06030100);

        let (parsed, rest) = RawTxnHeader::read_from_prefix(bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.txn_size.get(), 48);
        assert_eq!(&bytes[12..16], &48u32.to_le_bytes());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_opcode_from_u8() {
        assert_eq!(TxnOpcode::from(0), TxnOpcode::Write32);
        assert_eq!(TxnOpcode::from(1), TxnOpcode::BlockWrite);
        assert_eq!(TxnOpcode::from(3), TxnOpcode::MaskWrite);
        assert_eq!(TxnOpcode::from(128), TxnOpcode::Tct);
        assert_eq!(TxnOpcode::from(131), TxnOpcode::RecordTimer);
        assert_eq!(TxnOpcode::from(200), TxnOpcode::Unknown);
        assert!(TxnOpcode::RecordTimer.is_custom());
        assert!(!TxnOpcode::MaskPoll.is_custom());
        assert!(!TxnOpcode::Unknown.is_custom());
    }
}
