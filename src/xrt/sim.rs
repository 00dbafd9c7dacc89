//! Simulated XDNA device.
//!
//! An in-process [`HwContext`] for tests and the demo binary. Buffer objects
//! live in a sparse [`HostMemory`] and keep a separate host-side view, so
//! nothing written by one side is visible to the other until it is synced.
//! Kernel runs replay the op-buffer immediately: register ops land in a
//! register file and record-timer ops append `(id, high, low)` to the live
//! debug buffer.
//!
//! Debug buffers follow the firmware reservation rules: only one may own the
//! reservation at a time. A debug buffer created while another is live gets a
//! nonzero host offset and never receives device writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BoFlags, BufferObject, HwContext, Kernel, RunHandle, RunState, SyncDirection, XrtError};
use crate::config::DEFAULT_KERNEL_NAME;
use crate::device::{HostMemory, HostMemoryError};
use crate::txn::{encoder, TransactionStream, TxnInstruction, CONFIGURE_OPCODE, TRANSACTION_OP};

/// Bytes per `(id, high, low)` record written by the device.
const RECORD_SIZE: usize = 12;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Failures the simulated device can be told to produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Faults {
    /// Every buffer allocation fails with out-of-memory.
    pub fail_alloc: bool,
    /// Runs launch but finish in the error state.
    pub fail_runs: bool,
    /// Runs launch and never finish.
    pub hang_runs: bool,
}

#[derive(Debug)]
struct DebugReservation {
    bo_id: u64,
    base: u64,
    size: usize,
    write_offset: usize,
}

#[derive(Debug)]
struct SimState {
    memory: HostMemory,
    kernels: Vec<String>,
    registers: BTreeMap<u64, u32>,
    reservation: Option<DebugReservation>,
    live_debug: usize,
    next_bo_id: u64,
    timer: u64,
    tick: u64,
    faults: Faults,
    runs: u64,
}

impl SimState {
    fn advance_timer(&mut self) -> u64 {
        self.timer = self.timer.wrapping_add(self.tick);
        self.timer
    }

    fn execute_op_buffer(&mut self, bytes: &[u8]) -> Result<(), String> {
        let (op_type, payload) = encoder::split(bytes).map_err(|e| e.to_string())?;
        if op_type != TRANSACTION_OP {
            return Err(format!("unsupported op type {}", op_type));
        }
        let stream = TransactionStream::parse(payload).map_err(|e| e.to_string())?;
        log::debug!("Simulated device executing {} ops", stream.len());

        for instr in stream.instructions() {
            self.execute_instruction(instr)?;
        }
        Ok(())
    }

    fn execute_instruction(&mut self, instr: &TxnInstruction) -> Result<(), String> {
        match instr {
            TxnInstruction::Write32 { reg_off, value } => {
                self.registers.insert(*reg_off, *value);
            }
            TxnInstruction::BlockWrite { reg_off, values } => {
                for (i, v) in values.iter().enumerate() {
                    self.registers.insert(*reg_off as u64 + i as u64 * 4, *v);
                }
            }
            TxnInstruction::MaskWrite { reg_off, value, mask } => {
                let old = self.registers.get(reg_off).copied().unwrap_or(0);
                self.registers.insert(*reg_off, (old & !mask) | (value & mask));
            }
            TxnInstruction::MaskPoll { reg_off, value, mask } => {
                let current = self.registers.get(reg_off).copied().unwrap_or(0);
                // Nothing else runs on the simulated array, so an unmet poll never resolves
                if current & mask != *value {
                    return Err(format!(
                        "mask poll on 0x{:08X} never satisfied (0x{:08X} & 0x{:08X} != 0x{:08X})",
                        reg_off, current, mask, value
                    ));
                }
            }
            TxnInstruction::Noop => {}
            TxnInstruction::RecordTimer { id } => self.record_timer(*id),
            TxnInstruction::Custom { opcode, payload } => {
                log::trace!("Ignoring custom op 0x{:02X} ({} bytes)", opcode, payload.len());
            }
        }
        Ok(())
    }

    fn record_timer(&mut self, id: u32) {
        let cycle = self.advance_timer();
        let slot = match self.reservation.as_mut() {
            Some(res) if res.write_offset + RECORD_SIZE <= res.size => {
                let addr = res.base + res.write_offset as u64;
                res.write_offset += RECORD_SIZE;
                Some(addr)
            }
            Some(_) => {
                log::debug!("Debug buffer full, dropping timer record {}", id);
                None
            }
            None => {
                log::debug!("No debug buffer reserved, dropping timer record {}", id);
                None
            }
        };

        if let Some(addr) = slot {
            self.memory.write_u32(addr, id);
            self.memory.write_u32(addr + 4, (cycle >> 32) as u32);
            self.memory.write_u32(addr + 8, cycle as u32);
        }
    }

    fn allocate(&mut self, kind: &str, size: usize) -> Result<(u64, u64), XrtError> {
        if self.faults.fail_alloc {
            return Err(XrtError::OutOfMemory { size });
        }
        let id = self.next_bo_id;
        let base = self
            .memory
            .allocate(format!("{}#{}", kind, id), size)
            .map_err(|e| match e {
                HostMemoryError::OutOfMemory { .. } => XrtError::OutOfMemory { size },
                other => XrtError::InvalidBuffer(other.to_string()),
            })?;
        self.next_bo_id += 1;
        Ok((id, base))
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Simulated hardware context.
#[derive(Debug, Clone)]
pub struct SimContext {
    id: u64,
    state: Arc<Mutex<SimState>>,
}

impl SimContext {
    /// A context exposing the default XDP kernel.
    pub fn new() -> Self {
        Self::with_kernels(&[DEFAULT_KERNEL_NAME])
    }

    /// A context exposing exactly the given kernels.
    pub fn with_kernels(kernels: &[&str]) -> Self {
        let state = SimState {
            memory: HostMemory::new(),
            kernels: kernels.iter().map(|k| k.to_string()).collect(),
            registers: BTreeMap::new(),
            reservation: None,
            live_debug: 0,
            next_bo_id: 1,
            timer: 1_000_000,
            tick: 250,
            faults: Faults::default(),
            runs: 0,
        };
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Set the timer's current value and the amount it advances per record.
    pub fn with_timer(self, start: u64, tick: u64) -> Self {
        {
            let mut state = lock(&self.state);
            state.timer = start;
            state.tick = tick;
        }
        self
    }

    /// Limit the device memory backing buffer objects.
    pub fn with_memory_capacity(self, capacity: usize) -> Self {
        lock(&self.state).memory = HostMemory::with_capacity(capacity);
        self
    }

    pub fn set_faults(&self, faults: Faults) {
        lock(&self.state).faults = faults;
    }

    pub fn faults(&self) -> Faults {
        lock(&self.state).faults
    }

    pub fn add_kernel(&self, name: &str) {
        let mut state = lock(&self.state);
        if !state.kernels.iter().any(|k| k == name) {
            state.kernels.push(name.to_string());
        }
    }

    pub fn remove_kernel(&self, name: &str) {
        lock(&self.state).kernels.retain(|k| k != name);
    }

    /// Number of live debug buffers, reserved or not.
    pub fn live_debug_buffers(&self) -> usize {
        lock(&self.state).live_debug
    }

    /// Number of live buffer objects of any kind.
    pub fn live_buffers(&self) -> usize {
        lock(&self.state).memory.region_count()
    }

    /// Records written into the current debug reservation.
    pub fn records_written(&self) -> usize {
        lock(&self.state)
            .reservation
            .as_ref()
            .map_or(0, |r| r.write_offset / RECORD_SIZE)
    }

    pub fn register(&self, addr: u64) -> Option<u32> {
        lock(&self.state).registers.get(&addr).copied()
    }

    /// Current timer value.
    pub fn timer(&self) -> u64 {
        lock(&self.state).timer
    }

    /// Number of kernel launches so far.
    pub fn runs(&self) -> u64 {
        lock(&self.state).runs
    }
}

impl Default for SimContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HwContext for SimContext {
    fn id(&self) -> u64 {
        self.id
    }

    fn kernel(&self, name: &str) -> Result<Box<dyn Kernel>, XrtError> {
        let state = lock(&self.state);
        if !state.kernels.iter().any(|k| k == name) {
            return Err(XrtError::KernelNotFound(name.to_string()));
        }
        Ok(Box::new(SimKernel {
            name: name.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    fn alloc_bo(&self, size: usize, flags: BoFlags, group: u32) -> Result<Box<dyn BufferObject>, XrtError> {
        let (id, base) = lock(&self.state).allocate("bo", size)?;
        log::trace!(
            "Allocated bo#{} at 0x{:X}: {} bytes, flags 0x{:X}, group {}",
            id, base, size, flags.bits(), group
        );
        Ok(Box::new(SimBo {
            id,
            state: Arc::clone(&self.state),
            base,
            host_offset: 0,
            shadow: vec![0; size],
            debug: false,
        }))
    }

    fn create_debug_bo(&self, size: usize) -> Result<Box<dyn BufferObject>, XrtError> {
        let mut state = lock(&self.state);
        let (id, base) = state.allocate("debug", size)?;
        state.live_debug += 1;

        let holder = state
            .reservation
            .as_ref()
            .map(|r| (r.bo_id, r.size + r.write_offset));
        let host_offset = match holder {
            Some((holder_id, end)) => {
                log::debug!(
                    "Debug bo#{} created while bo#{} holds the reservation",
                    id, holder_id
                );
                end as u64
            }
            None => {
                state.reservation = Some(DebugReservation {
                    bo_id: id,
                    base,
                    size,
                    write_offset: 0,
                });
                0
            }
        };

        Ok(Box::new(SimBo {
            id,
            state: Arc::clone(&self.state),
            base,
            host_offset,
            shadow: vec![0; size],
            debug: true,
        }))
    }
}

/// Simulated buffer object.
struct SimBo {
    id: u64,
    state: Arc<Mutex<SimState>>,
    base: u64,
    host_offset: u64,
    shadow: Vec<u8>,
    debug: bool,
}

impl BufferObject for SimBo {
    fn size(&self) -> usize {
        self.shadow.len()
    }

    fn write(&mut self, data: &[u8], offset: usize) -> Result<(), XrtError> {
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= self.shadow.len())
            .ok_or_else(|| {
                XrtError::InvalidBuffer(format!(
                    "write of {} bytes at {} exceeds {} byte buffer",
                    data.len(),
                    offset,
                    self.shadow.len()
                ))
            })?;
        self.shadow[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn host_bytes(&self) -> &[u8] {
        &self.shadow
    }

    fn sync(&mut self, direction: SyncDirection) -> Result<(), XrtError> {
        let mut state = lock(&self.state);
        match direction {
            SyncDirection::ToDevice => state.memory.write_bytes(self.base, &self.shadow),
            SyncDirection::FromDevice => state.memory.read_bytes(self.base, &mut self.shadow),
        }
        Ok(())
    }

    fn host_offset(&self) -> u64 {
        self.host_offset
    }

    fn device_address(&self) -> u64 {
        self.base
    }
}

impl Drop for SimBo {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Err(e) = state.memory.free(self.base) {
            log::warn!("Simulated bo#{} free failed: {}", self.id, e);
        }
        if self.debug {
            state.live_debug = state.live_debug.saturating_sub(1);
            if state.reservation.as_ref().is_some_and(|r| r.bo_id == self.id) {
                state.reservation = None;
            }
        }
    }
}

struct SimKernel {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl Kernel for SimKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn group_id(&self, arg: u32) -> u32 {
        arg
    }

    fn run(
        &self,
        opcode: u64,
        instructions: &dyn BufferObject,
        size_in_words: u32,
    ) -> Result<Box<dyn RunHandle>, XrtError> {
        if opcode != CONFIGURE_OPCODE {
            return Err(XrtError::Run(format!("unsupported kernel opcode {}", opcode)));
        }
        let len = size_in_words as usize * 4;
        if len > instructions.size() {
            return Err(XrtError::InvalidBuffer(format!(
                "{} words exceed {} byte instruction buffer",
                size_in_words,
                instructions.size()
            )));
        }

        let mut state = lock(&self.state);
        state.runs += 1;
        if state.faults.hang_runs {
            return Ok(Box::new(SimRun::Hung));
        }
        if state.faults.fail_runs {
            return Ok(Box::new(SimRun::Finished(RunState::Error)));
        }

        // The device only sees what was synced
        let mut bytes = vec![0u8; len];
        state.memory.read_bytes(instructions.device_address(), &mut bytes);
        let outcome = match state.execute_op_buffer(&bytes) {
            Ok(()) => RunState::Completed,
            Err(e) => {
                log::warn!("Simulated {} run failed: {}", self.name, e);
                RunState::Error
            }
        };
        Ok(Box::new(SimRun::Finished(outcome)))
    }
}

enum SimRun {
    Finished(RunState),
    Hung,
}

impl RunHandle for SimRun {
    fn wait(self: Box<Self>, timeout: Option<Duration>) -> Result<RunState, XrtError> {
        match *self {
            SimRun::Finished(state) => Ok(state),
            SimRun::Hung => match timeout {
                Some(limit) => Err(XrtError::Timeout(limit)),
                None => Err(XrtError::Run("run hung with no timeout set".to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::txn::{encode, DriverInstance};

    fn op_buffer(f: impl FnOnce(&mut DriverInstance)) -> Vec<u8> {
        let mut inst = DriverInstance::initialize(&DeviceConfig::npu1()).unwrap();
        inst.start_transaction().unwrap();
        f(&mut inst);
        let txn = inst.export_serialized().unwrap();
        encode(txn.as_bytes()).unwrap().as_bytes().to_vec()
    }

    fn run(ctx: &SimContext, bytes: &[u8], sync: bool) -> Result<RunState, XrtError> {
        let kernel = ctx.kernel(DEFAULT_KERNEL_NAME)?;
        let mut bo = ctx.alloc_bo(bytes.len(), BoFlags::CACHEABLE, kernel.group_id(1))?;
        bo.write(bytes, 0)?;
        if sync {
            bo.sync(SyncDirection::ToDevice)?;
        }
        kernel.run(CONFIGURE_OPCODE, bo.as_ref(), (bytes.len() / 4) as u32)?.wait(None)
    }

    fn word(bytes: &[u8], i: usize) -> u32 {
        u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
    }

    #[test]
    fn test_debug_bo_offsets() {
        let ctx = SimContext::new();
        let first = ctx.create_debug_bo(0x1000).unwrap();
        assert_eq!(first.host_offset(), 0);

        let second = ctx.create_debug_bo(0x1000).unwrap();
        assert_ne!(second.host_offset(), 0);
        assert_eq!(ctx.live_debug_buffers(), 2);

        drop(second);
        drop(first);
        assert_eq!(ctx.live_debug_buffers(), 0);
        assert_eq!(ctx.live_buffers(), 0);

        let third = ctx.create_debug_bo(0x1000).unwrap();
        assert_eq!(third.host_offset(), 0);
    }

    #[test]
    fn test_record_timer_writes_debug_buffer() {
        let ctx = SimContext::new().with_timer(0xFFFF_FF00, 0x100);
        let mut debug = ctx.create_debug_bo(64).unwrap();

        let bytes = op_buffer(|inst| {
            inst.record_timer(3).unwrap();
            inst.record_timer(4).unwrap();
        });
        assert_eq!(run(&ctx, &bytes, true).unwrap(), RunState::Completed);
        assert_eq!(ctx.records_written(), 2);

        // Host view is stale until synced
        assert_eq!(word(debug.host_bytes(), 0), 0);
        debug.sync(SyncDirection::FromDevice).unwrap();
        let host = debug.host_bytes();
        assert_eq!((word(host, 0), word(host, 1), word(host, 2)), (3, 1, 0));
        assert_eq!((word(host, 3), word(host, 4), word(host, 5)), (4, 1, 0x100));
        assert_eq!(word(host, 6), 0);
    }

    #[test]
    fn test_unreserved_debug_bo_gets_nothing() {
        let ctx = SimContext::new();
        let _owner = ctx.create_debug_bo(64).unwrap();
        let mut late = ctx.create_debug_bo(64).unwrap();

        run(&ctx, &op_buffer(|inst| inst.record_timer(1).unwrap()), true).unwrap();
        late.sync(SyncDirection::FromDevice).unwrap();
        assert!(late.host_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_register_ops() {
        let ctx = SimContext::new();
        let bytes = op_buffer(|inst| {
            inst.write32(0, 2, 0x100, 0xF0).unwrap();
            inst.mask_write(0, 2, 0x100, 0x0A, 0x0F).unwrap();
            inst.mask_poll(0, 2, 0x100, 0xFA, 0xFF).unwrap();
        });
        assert_eq!(run(&ctx, &bytes, true).unwrap(), RunState::Completed);
        assert_eq!(ctx.register(0x0020_0100), Some(0xFA));

        let bytes = op_buffer(|inst| inst.mask_poll(0, 2, 0x200, 1, 1).unwrap());
        assert_eq!(run(&ctx, &bytes, true).unwrap(), RunState::Error);
    }

    #[test]
    fn test_unsynced_instructions_fail() {
        let ctx = SimContext::new();
        let bytes = op_buffer(|inst| inst.noop().unwrap());
        assert_eq!(run(&ctx, &bytes, false).unwrap(), RunState::Error);
    }

    #[test]
    fn test_faults() {
        let ctx = SimContext::new();
        let bytes = op_buffer(|inst| inst.noop().unwrap());

        ctx.set_faults(Faults { fail_runs: true, ..Faults::default() });
        assert_eq!(run(&ctx, &bytes, true).unwrap(), RunState::Error);

        ctx.set_faults(Faults { fail_alloc: true, ..Faults::default() });
        assert!(matches!(ctx.create_debug_bo(64), Err(XrtError::OutOfMemory { size: 64 })));

        ctx.set_faults(Faults { hang_runs: true, ..Faults::default() });
        let kernel = ctx.kernel(DEFAULT_KERNEL_NAME).unwrap();
        let mut bo = ctx.alloc_bo(bytes.len(), BoFlags::CACHEABLE, 1).unwrap();
        bo.write(&bytes, 0).unwrap();
        bo.sync(SyncDirection::ToDevice).unwrap();
        let handle = kernel.run(CONFIGURE_OPCODE, bo.as_ref(), (bytes.len() / 4) as u32).unwrap();
        let limit = Duration::from_millis(10);
        assert_eq!(handle.wait(Some(limit)), Err(XrtError::Timeout(limit)));
        assert_eq!(ctx.runs(), 2);
    }

    #[test]
    fn test_kernel_registry() {
        let ctx = SimContext::with_kernels(&[]);
        assert!(matches!(ctx.kernel("XDP_KERNEL"), Err(XrtError::KernelNotFound(_))));
        ctx.add_kernel("XDP_KERNEL");
        assert_eq!(ctx.kernel("XDP_KERNEL").unwrap().name(), "XDP_KERNEL");
        ctx.remove_kernel("XDP_KERNEL");
        assert!(ctx.kernel("XDP_KERNEL").is_err());
        assert_ne!(SimContext::new().id(), ctx.id());
    }
}
