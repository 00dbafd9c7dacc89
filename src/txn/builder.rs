//! Transaction recording against a driver instance.
//!
//! A [`DriverInstance`] is created from a [`DeviceConfig`] for one build. Ops
//! are appended between [`DriverInstance::start_transaction`] and
//! [`DriverInstance::export_serialized`]; the instance must then be cleared
//! before it can record again. Dropping an instance clears it.
//!
//! ```
//! use xdna_timeline::device::DeviceConfig;
//! use xdna_timeline::txn::{DriverInstance, TransactionStream};
//!
//! let mut inst = DriverInstance::initialize(&DeviceConfig::npu1())?;
//! inst.start_transaction()?;
//! inst.record_timer(0)?;
//! let txn = inst.export_serialized()?;
//! inst.clear_transaction();
//!
//! let stream = TransactionStream::parse(txn.as_bytes())?;
//! assert_eq!(stream.len(), 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

use byteorder::{LittleEndian, WriteBytesExt};
use zerocopy::little_endian::U32;
use zerocopy::IntoBytes;

use super::{
    RawTxnHeader, TxnOpcode, CUSTOM_OP_HEADER_SIZE, RECORD_TIMER_PAYLOAD_SIZE,
    TXN_HEADER_SIZE, TXN_MAJOR, TXN_MINOR,
};
use crate::device::{AieGeneration, DeviceConfig};
use crate::error::{Result, TimelineError};

/// One recorded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TxnOp {
    Write32 { col: u8, row: u8, reg_off: u64, value: u32 },
    BlockWrite { col: u8, row: u8, reg_off: u32, values: Vec<u32> },
    MaskWrite { col: u8, row: u8, reg_off: u64, value: u32, mask: u32 },
    MaskPoll { col: u8, row: u8, reg_off: u64, value: u32, mask: u32 },
    Noop,
    Custom { opcode: TxnOpcode, payload: Vec<u8> },
}

impl TxnOp {
    fn serialize(&self, out: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            Self::Write32 { col, row, reg_off, value } => {
                write_op_header(out, TxnOpcode::Write32, *col, *row)?;
                out.write_u64::<LittleEndian>(*reg_off)?;
                out.write_u32::<LittleEndian>(*value)?;
                out.write_u32::<LittleEndian>(24)?;
            }
            Self::BlockWrite { col, row, reg_off, values } => {
                write_op_header(out, TxnOpcode::BlockWrite, *col, *row)?;
                out.write_u32::<LittleEndian>(*reg_off)?;
                out.write_u32::<LittleEndian>((16 + values.len() * 4) as u32)?;
                for v in values {
                    out.write_u32::<LittleEndian>(*v)?;
                }
            }
            Self::MaskWrite { col, row, reg_off, value, mask } => {
                write_op_header(out, TxnOpcode::MaskWrite, *col, *row)?;
                out.write_u64::<LittleEndian>(*reg_off)?;
                out.write_u32::<LittleEndian>(*value)?;
                out.write_u32::<LittleEndian>(*mask)?;
                out.write_u32::<LittleEndian>(28)?;
            }
            Self::MaskPoll { col, row, reg_off, value, mask } => {
                write_op_header(out, TxnOpcode::MaskPoll, *col, *row)?;
                out.write_u64::<LittleEndian>(*reg_off)?;
                out.write_u32::<LittleEndian>(*value)?;
                out.write_u32::<LittleEndian>(*mask)?;
                out.write_u32::<LittleEndian>(28)?;
            }
            Self::Noop => write_op_header(out, TxnOpcode::Noop, 0, 0)?,
            Self::Custom { opcode, payload } => {
                // Payload is padded so the next op stays word aligned
                let padded = (payload.len() + 3) & !3;
                out.extend_from_slice(&[*opcode as u8, 0, 0, 0]);
                out.write_u32::<LittleEndian>((CUSTOM_OP_HEADER_SIZE + padded) as u32)?;
                out.extend_from_slice(payload);
                out.resize(out.len() + (padded - payload.len()), 0);
            }
        }
        Ok(())
    }
}

/// Standard op header: opcode word followed by a zero word.
fn write_op_header(out: &mut Vec<u8>, opcode: TxnOpcode, col: u8, row: u8) -> std::io::Result<()> {
    out.extend_from_slice(&[opcode as u8, col, row, 0]);
    out.write_u32::<LittleEndian>(0)
}

#[derive(Debug)]
enum RecordState {
    Idle,
    Recording(Vec<TxnOp>),
    Exported,
}

/// A finished, immutable transaction blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedTransaction {
    bytes: Vec<u8>,
    num_ops: u32,
}

impl ExportedTransaction {
    /// The serialized transaction, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of ops in the transaction.
    pub fn num_ops(&self) -> u32 {
        self.num_ops
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if empty (never true for an exported transaction).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Generation-specific driver handle recording one transaction at a time.
#[derive(Debug)]
pub struct DriverInstance {
    config: DeviceConfig,
    generation: AieGeneration,
    state: RecordState,
}

impl DriverInstance {
    /// Initialize a driver instance for the given geometry.
    pub fn initialize(config: &DeviceConfig) -> Result<Self> {
        config.validate()?;
        let generation = config
            .generation()
            .ok_or_else(|| TimelineError::ConfigIncomplete(format!("unknown hw_gen {}", config.hw_gen)))?;
        log::debug!("Driver instance initialized for {}", generation);
        Ok(Self {
            config: *config,
            generation,
            state: RecordState::Idle,
        })
    }

    /// The hardware generation this instance targets.
    pub fn generation(&self) -> AieGeneration {
        self.generation
    }

    /// Begin recording. Auto-flush is always disabled: nothing reaches the
    /// device until the exported blob is submitted.
    pub fn start_transaction(&mut self) -> Result<()> {
        match self.state {
            RecordState::Idle => {
                self.state = RecordState::Recording(Vec::new());
                Ok(())
            }
            RecordState::Recording(_) => Err(TimelineError::EncodingError(
                "transaction already in progress".to_string(),
            )),
            RecordState::Exported => Err(TimelineError::EncodingError(
                "exported transaction must be cleared before reuse".to_string(),
            )),
        }
    }

    /// Whether ops are currently being recorded.
    pub fn is_recording(&self) -> bool {
        matches!(self.state, RecordState::Recording(_))
    }

    /// Number of ops recorded so far.
    pub fn pending_ops(&self) -> usize {
        match &self.state {
            RecordState::Recording(ops) => ops.len(),
            _ => 0,
        }
    }

    fn push(&mut self, op: TxnOp) -> Result<()> {
        match &mut self.state {
            RecordState::Recording(ops) => {
                ops.push(op);
                Ok(())
            }
            _ => Err(TimelineError::EncodingError(
                "no transaction in progress".to_string(),
            )),
        }
    }

    fn check_tile(&self, col: u8, row: u8) -> Result<()> {
        if self.config.is_valid_tile(col, row) {
            Ok(())
        } else {
            Err(TimelineError::EncodingError(format!(
                "tile ({}, {}) outside {}x{} array",
                col, row, self.config.num_columns, self.config.num_rows
            )))
        }
    }

    /// Record a 32-bit register write.
    pub fn write32(&mut self, col: u8, row: u8, offset: u32, value: u32) -> Result<()> {
        self.check_tile(col, row)?;
        let reg_off = self.config.tile_address(col, row, offset);
        self.push(TxnOp::Write32 { col, row, reg_off, value })
    }

    /// Record a block write starting at `offset`.
    pub fn block_write(&mut self, col: u8, row: u8, offset: u32, values: &[u32]) -> Result<()> {
        self.check_tile(col, row)?;
        let reg_off = self.config.tile_address(col, row, offset) as u32;
        self.push(TxnOp::BlockWrite { col, row, reg_off, values: values.to_vec() })
    }

    /// Record a read-modify-write.
    pub fn mask_write(&mut self, col: u8, row: u8, offset: u32, value: u32, mask: u32) -> Result<()> {
        self.check_tile(col, row)?;
        let reg_off = self.config.tile_address(col, row, offset);
        self.push(TxnOp::MaskWrite { col, row, reg_off, value, mask })
    }

    /// Record a poll until `(reg & mask) == value`.
    pub fn mask_poll(&mut self, col: u8, row: u8, offset: u32, value: u32, mask: u32) -> Result<()> {
        self.check_tile(col, row)?;
        let reg_off = self.config.tile_address(col, row, offset);
        self.push(TxnOp::MaskPoll { col, row, reg_off, value, mask })
    }

    /// Record a no-op.
    pub fn noop(&mut self) -> Result<()> {
        self.push(TxnOp::Noop)
    }

    /// Record a custom op with an opaque payload.
    ///
    /// The payload is copied into the transaction; the caller keeps ownership
    /// of its buffer.
    pub fn add_custom_op(&mut self, opcode: TxnOpcode, payload: &[u8]) -> Result<()> {
        if !opcode.is_custom() {
            return Err(TimelineError::EncodingError(format!(
                "{:?} is not a custom opcode",
                opcode
            )));
        }
        self.push(TxnOp::Custom { opcode, payload: payload.to_vec() })
    }

    /// Record a timer read tagged with `id`.
    pub fn record_timer(&mut self, id: u32) -> Result<()> {
        let payload: [u8; RECORD_TIMER_PAYLOAD_SIZE] = id.to_le_bytes();
        self.add_custom_op(TxnOpcode::RecordTimer, &payload)
    }

    /// Serialize the recorded ops into a self-describing blob.
    ///
    /// The instance stays locked until [`clear_transaction`](Self::clear_transaction).
    pub fn export_serialized(&mut self) -> Result<ExportedTransaction> {
        let ops = match std::mem::replace(&mut self.state, RecordState::Exported) {
            RecordState::Recording(ops) => ops,
            other => {
                self.state = other;
                return Err(TimelineError::EncodingError(
                    "no transaction in progress".to_string(),
                ));
            }
        };

        let mut body = Vec::new();
        for op in &ops {
            op.serialize(&mut body)?;
        }

        let txn_size = TXN_HEADER_SIZE + body.len();
        let txn_size = u32::try_from(txn_size).map_err(|_| {
            TimelineError::EncodingError(format!("transaction of {} bytes too large", txn_size))
        })?;
        let header = RawTxnHeader {
            major: TXN_MAJOR,
            minor: TXN_MINOR,
            dev_gen: self.generation as u8,
            num_rows: self.config.num_rows,
            num_cols: self.config.num_columns,
            num_mem_tile_rows: self.config.mem_num_rows,
            pad: [0; 2],
            num_ops: U32::new(ops.len() as u32),
            txn_size: U32::new(txn_size),
        };

        let mut bytes = Vec::with_capacity(txn_size as usize);
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&body);

        log::debug!("Exported transaction: {} ops, {} bytes", ops.len(), bytes.len());
        Ok(ExportedTransaction { bytes, num_ops: ops.len() as u32 })
    }

    /// Discard any recorded or exported state.
    pub fn clear_transaction(&mut self) {
        self.state = RecordState::Idle;
    }
}

impl Drop for DriverInstance {
    fn drop(&mut self) {
        if self.is_recording() {
            log::debug!("Dropping driver instance with {} unexported ops", self.pending_ops());
        }
        self.clear_transaction();
    }
}
