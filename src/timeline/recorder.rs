//! Capture windows across a device attach/detach cycle.
//!
//! [`TimelineDevice`] is the per-device-class capability the plugin drives.
//! [`ClientTimeline`] implements it for client NPUs: attach opens a window by
//! creating a zeroed result buffer that the workload's own record-timer ops
//! append to, and detach decodes the buffer and destroys it.

use std::sync::Arc;
use std::time::Duration;

use super::capture::CaptureSession;
use super::decode::{decode_records, RecordSet};
use crate::config::Config;
use crate::device::DeviceConfig;
use crate::error::{Result, TimelineError};
use crate::xrt::submitter::epoch_micros;
use crate::xrt::{HwContext, LatencyBracket, ResultBuffer};

/// Capture capability for one device class.
pub trait TimelineDevice: Send {
    fn set_context(&mut self, context: Arc<dyn HwContext>);

    fn set_buffer_size(&mut self, size: usize);

    /// Open the capture window.
    fn update_device(&mut self) -> Result<()>;

    /// Close the window and decode it. `None` if no window was open.
    fn finish_flush_device(&mut self) -> Result<Option<RecordSet>>;

    /// Bracket of the most recent diagnostic read, if any.
    fn last_latency(&self) -> Option<LatencyBracket> {
        None
    }
}

/// Knobs for a [`ClientTimeline`], resolved from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderSettings {
    pub kernel_name: String,
    pub grace_period: Duration,
    pub pre_roll_reads: usize,
    pub diagnostic_reads: bool,
    pub completion_timeout: Option<Duration>,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for RecorderSettings {
    fn from(config: &Config) -> Self {
        Self {
            kernel_name: config.kernel_name(),
            grace_period: config.grace_period(),
            pre_roll_reads: config.pre_roll_reads(),
            diagnostic_reads: config.diagnostic_reads(),
            completion_timeout: config.completion_timeout(),
        }
    }
}

/// Record-timer capture for client NPUs.
pub struct ClientTimeline {
    device_config: DeviceConfig,
    settings: RecorderSettings,
    context: Option<Arc<dyn HwContext>>,
    buffer_size: usize,
    window: Option<ResultBuffer>,
    last_latency: Option<LatencyBracket>,
    pre_roll: Vec<(u64, u64)>,
}

impl ClientTimeline {
    pub fn new(device_config: DeviceConfig, settings: RecorderSettings) -> Self {
        log::debug!("Created ML timeline implementation for client device");
        Self {
            device_config,
            settings,
            context: None,
            buffer_size: ResultBuffer::DEFAULT_SIZE,
            window: None,
            last_latency: None,
            pre_roll: Vec::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn is_window_open(&self) -> bool {
        self.window.is_some()
    }

    /// `(wall clock us, cycle)` pairs from the last pre-roll.
    pub fn pre_roll(&self) -> &[(u64, u64)] {
        &self.pre_roll
    }

    fn session(&self, context: &Arc<dyn HwContext>) -> CaptureSession {
        CaptureSession::new(Arc::clone(context), self.device_config)
            .with_kernel_name(self.settings.kernel_name.clone())
            .with_timeout(self.settings.completion_timeout)
    }

    fn diagnostic_read(&mut self, context: &Arc<dyn HwContext>, when: &str) {
        let mut session = self.session(context);
        let before = epoch_micros();
        let stamp = session.read_timestamp();
        let after = epoch_micros();
        match stamp {
            Some(ts) => {
                log::debug!(
                    "{}: us since epoch {}, timestamp {} (0x{:x}), us since epoch {}",
                    when, before, ts, ts, after
                );
                self.last_latency = session.last_latency();
            }
            None => log::debug!("{}: no timestamp", when),
        }
    }

    fn run_pre_roll(&mut self, context: &Arc<dyn HwContext>) {
        let mut session = self.session(context);
        self.pre_roll = session.read_staggered(self.settings.pre_roll_reads);
        for (i, (wall, cycle)) in self.pre_roll.iter().enumerate() {
            log::debug!(
                "Pre-roll[{}]: us since epoch {}, timestamp {} (0x{:x})",
                i, wall, cycle, cycle
            );
        }
    }
}

impl TimelineDevice for ClientTimeline {
    fn set_context(&mut self, context: Arc<dyn HwContext>) {
        self.context = Some(context);
    }

    fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size;
    }

    fn update_device(&mut self) -> Result<()> {
        let context = self
            .context
            .clone()
            .ok_or_else(|| TimelineError::ConfigIncomplete("no hardware context set".to_string()))?;

        if let Some(stale) = self.window.take() {
            log::warn!("Capture window already open, discarding it");
            drop(stale);
        }

        if self.settings.diagnostic_reads {
            self.diagnostic_read(&context, "Before window");
        }
        if self.settings.pre_roll_reads > 0 {
            self.run_pre_roll(&context);
        }

        let mut window = ResultBuffer::create(context.as_ref(), self.buffer_size).map_err(|e| {
            log::warn!(
                "Unable to create/initialize result buffer of size 0x{:x} bytes for record timer values. Cannot get ML timeline info. {}",
                self.buffer_size, e
            );
            e
        })?;
        window.zero()?;
        self.window = Some(window);
        log::debug!("Allocated 0x{:x} byte capture window", self.buffer_size);
        Ok(())
    }

    fn finish_flush_device(&mut self) -> Result<Option<RecordSet>> {
        let Some(mut window) = self.window.take() else {
            log::debug!("No capture window open, nothing to flush");
            return Ok(None);
        };

        let decoded = window
            .sync_from_device()
            .map(|()| decode_records(&window.words(), window.size()));
        // Other consumers of the debug reservation may allocate only after this
        drop(window);
        let records = decoded?;
        log::info!("Decoded {} record timer entries", records.len());

        if let Some(context) = self.context.clone() {
            if self.settings.diagnostic_reads {
                self.diagnostic_read(&context, "After window");
            }
        }

        if !self.settings.grace_period.is_zero() {
            // Let the firmware log drain before the device may power down
            std::thread::sleep(self.settings.grace_period);
        }
        Ok(Some(records))
    }

    fn last_latency(&self) -> Option<LatencyBracket> {
        self.last_latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_KERNEL_NAME;
    use crate::timeline::decode::TimerRecord;
    use crate::txn::{encode, DriverInstance};
    use crate::xrt::sim::{Faults, SimContext};
    use crate::xrt::TransactionSubmitter;

    fn settings() -> RecorderSettings {
        RecorderSettings {
            grace_period: Duration::ZERO,
            ..RecorderSettings::default()
        }
    }

    fn attached(ctx: &SimContext, settings: RecorderSettings) -> ClientTimeline {
        let mut timeline = ClientTimeline::new(DeviceConfig::npu1(), settings);
        timeline.set_context(Arc::new(ctx.clone()));
        timeline
    }

    /// Stand-in for a workload whose instruction stream carries record-timer ops.
    fn run_workload(ctx: &SimContext, ids: &[u32]) {
        let mut inst = DriverInstance::initialize(&DeviceConfig::npu1()).unwrap();
        inst.start_transaction().unwrap();
        for id in ids {
            inst.record_timer(*id).unwrap();
        }
        let txn = inst.export_serialized().unwrap();
        let mut sub = TransactionSubmitter::new(Arc::new(ctx.clone()), "workload");
        sub.bind(DEFAULT_KERNEL_NAME).unwrap();
        sub.submit(&encode(txn.as_bytes()).unwrap()).unwrap();
    }

    #[test]
    fn test_window_roundtrip() {
        let ctx = SimContext::new().with_timer(1000, 10);
        let mut timeline = attached(&ctx, settings());
        timeline.set_buffer_size(0x1000);
        timeline.update_device().unwrap();
        assert!(timeline.is_window_open());

        run_workload(&ctx, &[1, 2, 3]);

        let records = timeline.finish_flush_device().unwrap().unwrap();
        assert_eq!(
            records.records(),
            &[
                TimerRecord { id: 1, cycle: 1010 },
                TimerRecord { id: 2, cycle: 1020 },
                TimerRecord { id: 3, cycle: 1030 },
            ]
        );
        assert!(!timeline.is_window_open());
        assert_eq!(ctx.live_debug_buffers(), 0);
    }

    #[test]
    fn test_empty_window() {
        let ctx = SimContext::new();
        let mut timeline = attached(&ctx, settings());
        timeline.update_device().unwrap();
        assert_eq!(timeline.finish_flush_device().unwrap(), Some(RecordSet::Empty));
        assert_eq!(timeline.finish_flush_device().unwrap(), None);
    }

    #[test]
    fn test_window_capacity() {
        let ctx = SimContext::new();
        let mut timeline = attached(&ctx, settings());
        timeline.set_buffer_size(36);
        timeline.update_device().unwrap();
        run_workload(&ctx, &[1, 2, 3, 4, 5]);
        let records = timeline.finish_flush_device().unwrap().unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_diagnostics_and_pre_roll() {
        let ctx = SimContext::new();
        let mut timeline = attached(
            &ctx,
            RecorderSettings {
                pre_roll_reads: 5,
                diagnostic_reads: true,
                ..settings()
            },
        );
        timeline.update_device().unwrap();
        assert_eq!(timeline.pre_roll().len(), 5);
        assert!(timeline.last_latency().is_some());
        // Diagnostic buffers are gone, only the window is live
        assert_eq!(ctx.live_debug_buffers(), 1);

        run_workload(&ctx, &[9]);
        let records = timeline.finish_flush_device().unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(ctx.live_debug_buffers(), 0);
        // 1 before + 5 pre-roll + 1 workload + 1 after
        assert_eq!(ctx.runs(), 8);
    }

    #[test]
    fn test_attach_without_context() {
        let mut timeline = ClientTimeline::new(DeviceConfig::npu1(), settings());
        assert!(matches!(
            timeline.update_device(),
            Err(TimelineError::ConfigIncomplete(_))
        ));
    }

    #[test]
    fn test_allocation_failure_leaves_no_window() {
        let ctx = SimContext::new();
        ctx.set_faults(Faults { fail_alloc: true, ..Faults::default() });
        let mut timeline = attached(&ctx, settings());
        assert!(matches!(
            timeline.update_device(),
            Err(TimelineError::BufferAllocationFailed { .. })
        ));
        assert_eq!(timeline.finish_flush_device().unwrap(), None);
    }

    #[test]
    fn test_grace_period_held() {
        let ctx = SimContext::new();
        let mut timeline = attached(
            &ctx,
            RecorderSettings {
                grace_period: Duration::from_millis(20),
                ..settings()
            },
        );
        timeline.update_device().unwrap();
        let start = std::time::Instant::now();
        timeline.finish_flush_device().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
