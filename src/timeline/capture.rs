//! Single-shot timer reads.
//!
//! A [`CaptureSession`] builds a record-timer transaction, runs it through
//! the XDP kernel and reads the samples back from a result buffer it creates
//! and destroys for each call. Failures are logged and produce no samples;
//! the session holds no device state between calls, so a retry starts clean.

use std::sync::Arc;
use std::time::Duration;

use super::decode::{self, RECORD_BYTES};
use crate::config::DEFAULT_KERNEL_NAME;
use crate::device::DeviceConfig;
use crate::error::Result;
use crate::txn::{encode, DriverInstance, InstructionBuffer};
use crate::xrt::submitter::epoch_micros;
use crate::xrt::{HwContext, LatencyBracket, ResultBuffer, TransactionSubmitter};

const TRANSACTION_NAME: &str = "Record Timer TS";

pub struct CaptureSession {
    context: Arc<dyn HwContext>,
    device_config: DeviceConfig,
    kernel_name: String,
    timeout: Option<Duration>,
    last_latency: Option<LatencyBracket>,
}

impl CaptureSession {
    pub fn new(context: Arc<dyn HwContext>, device_config: DeviceConfig) -> Self {
        Self {
            context,
            device_config,
            kernel_name: DEFAULT_KERNEL_NAME.to_string(),
            timeout: None,
            last_latency: None,
        }
    }

    pub fn with_kernel_name(mut self, name: impl Into<String>) -> Self {
        self.kernel_name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_kernel_name(&mut self, name: impl Into<String>) {
        self.kernel_name = name.into();
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Latency bracket of the most recent successful submission.
    pub fn last_latency(&self) -> Option<LatencyBracket> {
        self.last_latency
    }

    /// Read the timer once.
    pub fn read_timestamp(&mut self) -> Option<u64> {
        self.read_timestamps(1).first().copied()
    }

    /// Read the timer `n` times in one transaction. Empty on failure.
    pub fn read_timestamps(&mut self, n: usize) -> Vec<u64> {
        if n == 0 {
            return Vec::new();
        }
        match self.try_read_timestamps(n) {
            Ok(stamps) => stamps,
            Err(e) => {
                log::warn!("Record timer read failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Like [`read_timestamps`](Self::read_timestamps), but reports the error.
    pub fn try_read_timestamps(&mut self, n: usize) -> Result<Vec<u64>> {
        let instructions = self.build_instructions(n)?;

        let mut buffer = ResultBuffer::create(self.context.as_ref(), n * RECORD_BYTES)?;
        buffer.zero()?;
        self.submit(&instructions)?;
        buffer.sync_from_device()?;
        Ok(decode::timestamps(&buffer.words(), n))
    }

    /// Read the timer `n` times, one submission each, pairing every sample
    /// with the wall clock taken just before its submission.
    pub fn read_staggered(&mut self, n: usize) -> Vec<(u64, u64)> {
        if n == 0 {
            return Vec::new();
        }
        match self.try_read_staggered(n) {
            Ok(pairs) => pairs,
            Err(e) => {
                log::warn!("Staggered record timer read failed: {}", e);
                Vec::new()
            }
        }
    }

    fn try_read_staggered(&mut self, n: usize) -> Result<Vec<(u64, u64)>> {
        let instructions = self.build_instructions(1)?;

        let mut buffer = ResultBuffer::create(self.context.as_ref(), n * RECORD_BYTES)?;
        buffer.zero()?;
        let mut wall = Vec::with_capacity(n);
        for _ in 0..n {
            wall.push(epoch_micros());
            self.submit(&instructions)?;
        }
        buffer.sync_from_device()?;

        let stamps = decode::timestamps(&buffer.words(), n);
        Ok(wall.into_iter().zip(stamps).collect())
    }

    fn build_instructions(&self, n: usize) -> Result<InstructionBuffer> {
        let mut instance = DriverInstance::initialize(&self.device_config)?;
        instance.start_transaction()?;
        for _ in 0..n {
            instance.record_timer(0)?;
        }
        let txn = instance.export_serialized();
        instance.clear_transaction();
        encode(txn?.as_bytes())
    }

    fn submit(&mut self, instructions: &InstructionBuffer) -> Result<()> {
        let mut submitter = TransactionSubmitter::new(Arc::clone(&self.context), TRANSACTION_NAME)
            .with_timeout(self.timeout);
        submitter.bind(&self.kernel_name)?;
        submitter.submit(instructions)?;
        self.last_latency = submitter.last_latency();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrt::sim::{Faults, SimContext};

    fn session(ctx: &SimContext) -> CaptureSession {
        CaptureSession::new(Arc::new(ctx.clone()), DeviceConfig::npu1())
    }

    #[test]
    fn test_read_timestamp() {
        let ctx = SimContext::new().with_timer(0xFFFF_FFFF, 1);
        let mut session = session(&ctx);
        assert_eq!(session.read_timestamp(), Some(0x1_0000_0000));
        assert!(session.last_latency().is_some());
        assert_eq!(ctx.live_buffers(), 0);
    }

    #[test]
    fn test_read_timestamps_monotonic() {
        let ctx = SimContext::new().with_timer(100, 10);
        let mut session = session(&ctx);
        assert_eq!(session.read_timestamps(3), vec![110, 120, 130]);
        assert!(session.read_timestamps(0).is_empty());
    }

    #[test]
    fn test_bind_failure_then_retry() {
        let ctx = SimContext::new();
        let mut session = session(&ctx).with_kernel_name("MISSING_KERNEL");
        assert_eq!(session.read_timestamp(), None);
        // Nothing left behind on the device
        assert_eq!(ctx.live_debug_buffers(), 0);
        assert_eq!(ctx.runs(), 0);

        session.set_kernel_name(DEFAULT_KERNEL_NAME);
        assert!(session.read_timestamp().is_some());
    }

    #[test]
    fn test_run_failure_yields_nothing() {
        let ctx = SimContext::new();
        ctx.set_faults(Faults { fail_runs: true, ..Faults::default() });
        let mut session = session(&ctx);
        assert!(session.read_timestamps(2).is_empty());
        assert!(session.last_latency().is_none());

        ctx.set_faults(Faults::default());
        assert_eq!(session.read_timestamps(2).len(), 2);
    }

    #[test]
    fn test_blocked_by_live_window() {
        let ctx = SimContext::new();
        let window = ResultBuffer::create(&ctx, 0x100).unwrap();
        let mut session = session(&ctx);
        assert_eq!(session.read_timestamp(), None);
        drop(window);
        assert!(session.read_timestamp().is_some());
    }

    #[test]
    fn test_read_staggered() {
        let ctx = SimContext::new().with_timer(0, 5);
        let mut session = session(&ctx);
        let pairs = session.read_staggered(5);
        assert_eq!(pairs.len(), 5);
        let cycles: Vec<u64> = pairs.iter().map(|(_, c)| *c).collect();
        assert_eq!(cycles, vec![5, 10, 15, 20, 25]);
        assert!(pairs.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(ctx.runs(), 5);
    }

    #[test]
    fn test_incomplete_config() {
        let ctx = SimContext::new();
        let mut config = DeviceConfig::npu1();
        config.num_rows = 0;
        let mut session = CaptureSession::new(Arc::new(ctx.clone()), config);
        assert!(session.try_read_timestamps(1).is_err());
        assert_eq!(session.read_timestamp(), None);
    }
}
