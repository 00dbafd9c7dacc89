//! Transaction submission through the XDP kernel.
//!
//! A [`TransactionSubmitter`] binds a kernel by name, then pushes exactly one
//! encoded instruction buffer through it per [`submit`](TransactionSubmitter::submit):
//! allocate a cacheable command buffer, copy, sync, launch with the configure
//! opcode, wait.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{BoFlags, HwContext, Kernel, RunState, SyncDirection};
use crate::error::{Result, TimelineError};
use crate::txn::{InstructionBuffer, CONFIGURE_OPCODE};

/// Wall-clock bracket around one run, in microseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyBracket {
    pub mid: u64,
    pub before: u64,
    pub after: u64,
}

impl LatencyBracket {
    pub fn new(before: u64, after: u64) -> Self {
        Self {
            mid: before / 2 + after / 2 + (before % 2 + after % 2) / 2,
            before,
            after,
        }
    }

    /// Launch-to-completion time.
    pub fn latency_us(&self) -> u64 {
        self.after.saturating_sub(self.before)
    }
}

/// Microseconds since the Unix epoch.
pub fn epoch_micros() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

/// Where a submitter is in its bind/submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitterState {
    Unbound,
    Bound,
    Submitted { success: bool },
}

impl fmt::Display for SubmitterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitterState::Unbound => write!(f, "unbound"),
            SubmitterState::Bound => write!(f, "bound"),
            SubmitterState::Submitted { success: true } => write!(f, "submitted"),
            SubmitterState::Submitted { success: false } => write!(f, "failed"),
        }
    }
}

/// Single-use submitter for one transaction.
pub struct TransactionSubmitter {
    context: Arc<dyn HwContext>,
    transaction_name: String,
    kernel: Option<Box<dyn Kernel>>,
    state: SubmitterState,
    timeout: Option<Duration>,
    last_latency: Option<LatencyBracket>,
}

impl TransactionSubmitter {
    /// Create an unbound submitter. `transaction_name` only appears in logs.
    pub fn new(context: Arc<dyn HwContext>, transaction_name: impl Into<String>) -> Self {
        Self {
            context,
            transaction_name: transaction_name.into(),
            kernel: None,
            state: SubmitterState::Unbound,
            timeout: None,
            last_latency: None,
        }
    }

    /// Bound the completion wait. `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn state(&self) -> SubmitterState {
        self.state
    }

    /// Bracket of the last successful run.
    pub fn last_latency(&self) -> Option<LatencyBracket> {
        self.last_latency
    }

    /// Resolve `kernel_name` from the context. Rebinding is allowed from any state.
    pub fn bind(&mut self, kernel_name: &str) -> Result<()> {
        match self.context.kernel(kernel_name) {
            Ok(kernel) => {
                self.kernel = Some(kernel);
                self.state = SubmitterState::Bound;
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "Unable to find {} kernel from hardware context. Failed to configure {}. {}",
                    kernel_name, self.transaction_name, e
                );
                self.kernel = None;
                self.state = SubmitterState::Unbound;
                Err(TimelineError::KernelNotFound {
                    name: kernel_name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Run `instructions` once and block until the device is done.
    pub fn submit(&mut self, instructions: &InstructionBuffer) -> Result<()> {
        let kernel = match (self.state, self.kernel.as_deref()) {
            (SubmitterState::Bound, Some(kernel)) => kernel,
            (state, _) => {
                return Err(TimelineError::ExecutionFailed(format!(
                    "cannot submit {} transaction from {} state",
                    self.transaction_name, state
                )))
            }
        };

        let result = Self::run_once(
            self.context.as_ref(),
            kernel,
            instructions,
            self.timeout,
            &self.transaction_name,
        );

        match result {
            Ok(bracket) => {
                log::debug!(
                    "{} run took {} us (before {}, after {})",
                    self.transaction_name,
                    bracket.latency_us(),
                    bracket.before,
                    bracket.after
                );
                log::info!(
                    "Successfully scheduled {} instruction buffer.",
                    self.transaction_name
                );
                self.last_latency = Some(bracket);
                self.state = SubmitterState::Submitted { success: true };
                Ok(())
            }
            Err(e) => {
                log::warn!("Unable to configure {}: {}", self.transaction_name, e);
                self.state = SubmitterState::Submitted { success: false };
                Err(e)
            }
        }
    }

    fn run_once(
        context: &dyn HwContext,
        kernel: &dyn Kernel,
        instructions: &InstructionBuffer,
        timeout: Option<Duration>,
        name: &str,
    ) -> Result<LatencyBracket> {
        let size = instructions.len();
        let mut bo = context
            .alloc_bo(size, BoFlags::CACHEABLE, kernel.group_id(1))
            .map_err(|e| TimelineError::BufferAllocationFailed {
                size,
                reason: format!("instruction buffer for {}: {}", name, e),
            })?;

        bo.write(instructions.as_bytes(), 0)?;
        bo.sync(SyncDirection::ToDevice)?;

        let words = u32::try_from(instructions.size_in_words()).map_err(|_| {
            TimelineError::EncodingError(format!("{} byte instruction buffer too large", size))
        })?;

        let before = epoch_micros();
        let run = kernel.run(CONFIGURE_OPCODE, bo.as_ref(), words)?;
        let state = run.wait(timeout)?;
        let after = epoch_micros();

        if state != RunState::Completed {
            return Err(TimelineError::ExecutionFailed(format!(
                "{} run finished in state {}",
                name, state
            )));
        }
        Ok(LatencyBracket::new(before, after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_KERNEL_NAME;
    use crate::device::DeviceConfig;
    use crate::txn::{encode, DriverInstance};
    use crate::xrt::sim::{Faults, SimContext};

    fn timer_instructions(ids: &[u32]) -> InstructionBuffer {
        let mut inst = DriverInstance::initialize(&DeviceConfig::npu1()).unwrap();
        inst.start_transaction().unwrap();
        for id in ids {
            inst.record_timer(*id).unwrap();
        }
        let txn = inst.export_serialized().unwrap();
        encode(txn.as_bytes()).unwrap()
    }

    fn submitter(ctx: &SimContext) -> TransactionSubmitter {
        TransactionSubmitter::new(Arc::new(ctx.clone()), "Record Timer TS")
    }

    #[test]
    fn test_bind_then_submit() {
        let ctx = SimContext::new();
        let _debug = ctx.create_debug_bo(0x100).unwrap();
        let mut sub = submitter(&ctx);
        assert_eq!(sub.state(), SubmitterState::Unbound);

        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        assert_eq!(sub.state(), SubmitterState::Bound);
        sub.submit(&timer_instructions(&[1, 2])).unwrap();

        assert_eq!(sub.state(), SubmitterState::Submitted { success: true });
        assert_eq!(ctx.records_written(), 2);
        let bracket = sub.last_latency().unwrap();
        assert!(bracket.after >= bracket.before);
        // Command buffer is released after the run
        assert_eq!(ctx.live_buffers(), 1);
    }

    #[test]
    fn test_bind_missing_kernel() {
        let ctx = SimContext::with_kernels(&[]);
        let mut sub = submitter(&ctx);
        let err = sub.bind(DEFAULT_KERNEL_NAME).unwrap_err();
        assert!(matches!(err, TimelineError::KernelNotFound { .. }));
        assert!(err.is_recoverable());
        assert_eq!(sub.state(), SubmitterState::Unbound);
    }

    #[test]
    fn test_submit_requires_bound() {
        let ctx = SimContext::new();
        let mut sub = submitter(&ctx);
        let instrs = timer_instructions(&[1]);
        assert!(matches!(sub.submit(&instrs), Err(TimelineError::ExecutionFailed(_))));
        assert_eq!(ctx.runs(), 0);

        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        sub.submit(&instrs).unwrap();
        // Single use until rebound
        assert!(matches!(sub.submit(&instrs), Err(TimelineError::ExecutionFailed(_))));
        assert_eq!(ctx.runs(), 1);

        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        sub.submit(&instrs).unwrap();
        assert_eq!(ctx.runs(), 2);
    }

    #[test]
    fn test_submit_failures() {
        let ctx = SimContext::new();
        let instrs = timer_instructions(&[1]);

        ctx.set_faults(Faults { fail_alloc: true, ..Faults::default() });
        let mut sub = submitter(&ctx);
        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        assert!(matches!(
            sub.submit(&instrs),
            Err(TimelineError::BufferAllocationFailed { .. })
        ));
        assert_eq!(sub.state(), SubmitterState::Submitted { success: false });

        ctx.set_faults(Faults { fail_runs: true, ..Faults::default() });
        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        assert!(matches!(sub.submit(&instrs), Err(TimelineError::ExecutionFailed(_))));

        ctx.set_faults(Faults { hang_runs: true, ..Faults::default() });
        let mut sub = submitter(&ctx).with_timeout(Some(Duration::from_millis(50)));
        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        assert!(matches!(sub.submit(&instrs), Err(TimelineError::Timeout(_))));
        assert!(sub.last_latency().is_none());
    }

    #[test]
    fn test_latency_bracket() {
        let b = LatencyBracket::new(1_000, 1_501);
        assert_eq!(b.mid, 1_250);
        assert_eq!(b.latency_us(), 501);
        let b = LatencyBracket::new(u64::MAX - 1, u64::MAX);
        assert_eq!(b.mid, u64::MAX - 1);
    }
}
