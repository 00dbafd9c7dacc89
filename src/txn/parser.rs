//! Transaction stream parser.
//!
//! Decodes a serialized transaction back into instructions. The simulated
//! device replays these; tooling can use them to inspect what was submitted.

use std::io::{Cursor, Read};

use anyhow::{anyhow, bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use zerocopy::FromBytes;

use super::{RawTxnHeader, TxnOpcode, TXN_HEADER_SIZE, TXN_MAJOR};

/// A parsed transaction instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnInstruction {
    /// Write a single 32-bit value to a register.
    Write32 {
        /// Register offset (absolute address in array address space).
        reg_off: u64,
        /// Value to write.
        value: u32,
    },

    /// Write consecutive 32-bit values starting at an address.
    BlockWrite {
        reg_off: u32,
        values: Vec<u32>,
    },

    /// Read-modify-write.
    MaskWrite {
        reg_off: u64,
        value: u32,
        /// Only bits set in mask are modified.
        mask: u32,
    },

    /// Poll a register until (value & mask) matches expected.
    MaskPoll {
        reg_off: u64,
        value: u32,
        mask: u32,
    },

    Noop,

    /// Append a timer sample tagged with `id` to the debug buffer.
    RecordTimer {
        id: u32,
    },

    /// Any other custom op, kept opaque.
    Custom {
        opcode: u8,
        payload: Vec<u8>,
    },
}

/// A parsed transaction.
#[derive(Debug, Clone)]
pub struct TransactionStream {
    header: RawTxnHeader,
    instructions: Vec<TxnInstruction>,
}

impl TransactionStream {
    /// Parse a serialized transaction.
    ///
    /// Trailing bytes past the header's `txn_size` are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < TXN_HEADER_SIZE {
            bail!(
                "Transaction too small: {} bytes (minimum {})",
                data.len(),
                TXN_HEADER_SIZE
            );
        }

        let (header, _) = RawTxnHeader::read_from_prefix(data)
            .map_err(|e| anyhow!("Failed to parse transaction header: {:?}", e))?;

        if header.major != TXN_MAJOR {
            bail!("Unsupported transaction version {}.{}", header.major, header.minor);
        }

        let txn_size = header.txn_size.get() as usize;
        if txn_size < TXN_HEADER_SIZE || txn_size > data.len() {
            bail!(
                "Transaction size {} invalid for {} bytes of data",
                txn_size,
                data.len()
            );
        }

        let body = &data[TXN_HEADER_SIZE..txn_size];
        let mut cursor = Cursor::new(body);
        let num_ops = header.num_ops.get();
        let mut instructions = Vec::with_capacity(num_ops.min(1024) as usize);

        for i in 0..num_ops {
            let pos = cursor.position() as usize;
            if pos >= body.len() {
                bail!("Transaction truncated: op {} of {} starts past end", i, num_ops);
            }

            let instr = Self::parse_instruction(&mut cursor)
                .map_err(|e| anyhow!("Failed to parse op {} at offset 0x{:X}: {}", i, pos + TXN_HEADER_SIZE, e))?;
            log::trace!("  op {} at 0x{:X}: {:?}", i, pos + TXN_HEADER_SIZE, instr);
            instructions.push(instr);
        }

        Ok(Self { header, instructions })
    }

    /// Parse a single instruction from the cursor.
    ///
    /// - Standard ops (opcode < 128): 8-byte header (4 opcode + 4 zeros), then op-specific fields
    /// - Custom ops (opcode >= 128): 4-byte header + 4-byte size + payload
    fn parse_instruction(cursor: &mut Cursor<&[u8]>) -> std::io::Result<TxnInstruction> {
        let opcode_byte = cursor.read_u8()?;
        let _col = cursor.read_u8()?;
        let _row = cursor.read_u8()?;
        let _pad = cursor.read_u8()?;

        if opcode_byte >= TxnOpcode::CUSTOM_OP_BEGIN {
            let size = cursor.read_u32::<LittleEndian>()?;
            let remaining = size.checked_sub(8).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("custom op size {} smaller than its header", size),
                )
            })?;

            let available = cursor.get_ref().len() as u64 - cursor.position();
            if remaining as u64 > available {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("custom op payload of {} bytes exceeds {} remaining", remaining, available),
                ));
            }
            let mut payload = vec![0u8; remaining as usize];
            cursor.read_exact(&mut payload)?;

            return Ok(match TxnOpcode::from(opcode_byte) {
                TxnOpcode::RecordTimer => {
                    let id = payload
                        .get(0..4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .unwrap_or(0);
                    TxnInstruction::RecordTimer { id }
                }
                _ => TxnInstruction::Custom { opcode: opcode_byte, payload },
            });
        }

        let _padding = cursor.read_u32::<LittleEndian>()?;

        match TxnOpcode::from(opcode_byte) {
            TxnOpcode::Write32 => {
                let reg_off = cursor.read_u64::<LittleEndian>()?;
                let value = cursor.read_u32::<LittleEndian>()?;
                let _size = cursor.read_u32::<LittleEndian>()?;
                Ok(TxnInstruction::Write32 { reg_off, value })
            }

            TxnOpcode::BlockWrite => {
                let reg_off = cursor.read_u32::<LittleEndian>()?;
                // Size includes the 16-byte header
                let size = cursor.read_u32::<LittleEndian>()?;
                let num_words = size.saturating_sub(16) / 4;

                let mut values = Vec::with_capacity(num_words.min(4096) as usize);
                for _ in 0..num_words {
                    values.push(cursor.read_u32::<LittleEndian>()?);
                }
                Ok(TxnInstruction::BlockWrite { reg_off, values })
            }

            TxnOpcode::MaskWrite | TxnOpcode::MaskPoll => {
                let reg_off = cursor.read_u64::<LittleEndian>()?;
                let value = cursor.read_u32::<LittleEndian>()?;
                let mask = cursor.read_u32::<LittleEndian>()?;
                let _size = cursor.read_u32::<LittleEndian>()?;
                if opcode_byte == TxnOpcode::MaskWrite as u8 {
                    Ok(TxnInstruction::MaskWrite { reg_off, value, mask })
                } else {
                    Ok(TxnInstruction::MaskPoll { reg_off, value, mask })
                }
            }

            TxnOpcode::Noop => Ok(TxnInstruction::Noop),

            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown standard opcode 0x{:02X}", opcode_byte),
            )),
        }
    }

    /// The transaction header.
    pub fn header(&self) -> &RawTxnHeader {
        &self.header
    }

    /// Get the parsed instructions.
    pub fn instructions(&self) -> &[TxnInstruction] {
        &self.instructions
    }

    /// Number of record-timer ops.
    pub fn record_timer_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i, TxnInstruction::RecordTimer { .. }))
            .count()
    }

    /// Get the number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::txn::DriverInstance;

    fn build(f: impl FnOnce(&mut DriverInstance)) -> Vec<u8> {
        let mut inst = DriverInstance::initialize(&DeviceConfig::npu1()).unwrap();
        inst.start_transaction().unwrap();
        f(&mut inst);
        inst.export_serialized().unwrap().as_bytes().to_vec()
    }

    #[test]
    fn test_parse_empty() {
        assert!(TransactionStream::parse(&[]).is_err());
    }

    #[test]
    fn test_parse_all_op_kinds() {
        let bytes = build(|inst| {
            inst.write32(0, 0, 0x1D204, 3).unwrap();
            inst.block_write(0, 0, 0x1D000, &[1, 2, 3, 4]).unwrap();
            inst.mask_write(1, 2, 0x32000, 1, 0x1).unwrap();
            inst.mask_poll(0, 0, 0x1D220, 0, 0x7).unwrap();
            inst.noop().unwrap();
            inst.record_timer(7).unwrap();
            inst.add_custom_op(TxnOpcode::Tct, &[0xAA; 8]).unwrap();
        });

        let stream = TransactionStream::parse(&bytes).unwrap();
        assert_eq!(stream.len(), 7);
        assert_eq!(stream.header().num_ops.get(), 7);
        assert_eq!(stream.record_timer_count(), 1);

        let instrs = stream.instructions();
        assert_eq!(instrs[0], TxnInstruction::Write32 { reg_off: 0x1D204, value: 3 });
        assert_eq!(instrs[1], TxnInstruction::BlockWrite { reg_off: 0x1D000, values: vec![1, 2, 3, 4] });
        assert_eq!(instrs[2], TxnInstruction::MaskWrite { reg_off: 0x0223_2000, value: 1, mask: 1 });
        assert_eq!(instrs[3], TxnInstruction::MaskPoll { reg_off: 0x1D220, value: 0, mask: 7 });
        assert_eq!(instrs[4], TxnInstruction::Noop);
        assert_eq!(instrs[5], TxnInstruction::RecordTimer { id: 7 });
        assert_eq!(instrs[6], TxnInstruction::Custom { opcode: 128, payload: vec![0xAA; 8] });
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = build(|inst| {
            inst.record_timer(1).unwrap();
            inst.record_timer(2).unwrap();
        });
        // Header still claims the full size
        assert!(TransactionStream::parse(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut bytes = build(|inst| inst.record_timer(9).unwrap());
        bytes.extend_from_slice(&[0xFF; 12]);
        let stream = TransactionStream::parse(&bytes).unwrap();
        assert_eq!(stream.instructions(), &[TxnInstruction::RecordTimer { id: 9 }]);
    }

    #[test]
    fn test_parse_rejects_bad_custom_size() {
        let mut bytes = build(|inst| inst.record_timer(1).unwrap());
        // Custom op size field sits right after the 4-byte opcode word
        bytes[20..24].copy_from_slice(&4u32.to_le_bytes());
        assert!(TransactionStream::parse(&bytes).is_err());
    }
}
