//! Host-facing plugin lifecycle.
//!
//! The hosting profiler drives a [`TimelinePlugin`] through three hooks:
//! [`attach`](TimelinePlugin::attach) when a hardware context comes up,
//! [`capture`](TimelinePlugin::capture) when it asks for record timestamps,
//! and [`flush`](TimelinePlugin::flush) when a context is torn down. Only the
//! first attached device is tracked.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::device::{DeviceClass, DeviceConfig};
use crate::error::Result;
use crate::timeline::{
    write_latency, ClientTimeline, JsonReport, RecordSet, RecordSink, RecorderSettings,
    TimelineDevice,
};
use crate::txn::{encode, DriverInstance};
use crate::xrt::{HwContext, TransactionSubmitter};

/// Liveness of the host's profiling database.
pub trait HostLifecycle: Send + Sync {
    fn database_alive(&self) -> bool;
}

/// A host liveness flag the host flips on teardown.
#[derive(Debug)]
pub struct HostFlag {
    alive: AtomicBool,
}

impl HostFlag {
    pub fn new(alive: bool) -> Self {
        Self {
            alive: AtomicBool::new(alive),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

impl HostLifecycle for HostFlag {
    fn database_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Where the plugin is in its single-device lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// No device attached.
    Idle,
    /// Attached with an open capture window.
    Capturing,
    /// Attached, nothing left to flush.
    Finished,
}

/// Pick the capture implementation for a device class.
pub fn implementation_for(
    class: DeviceClass,
    device: DeviceConfig,
    settings: RecorderSettings,
) -> Option<Box<dyn TimelineDevice>> {
    match class {
        DeviceClass::Client => Some(Box::new(ClientTimeline::new(device, settings))),
        DeviceClass::Edge => None,
    }
}

pub struct TimelinePlugin {
    config: Config,
    buffer_size: usize,
    lifecycle: Arc<dyn HostLifecycle>,
    sink: Box<dyn RecordSink + Send>,
    context: Option<Arc<dyn HwContext>>,
    implementation: Option<Box<dyn TimelineDevice>>,
    state: PluginState,
}

impl TimelinePlugin {
    pub fn new(config: Config, lifecycle: Arc<dyn HostLifecycle>) -> Self {
        let buffer_size = config.buffer_size_bytes();
        let sink = Box::new(JsonReport::new(config.output_path()));
        Self {
            config,
            buffer_size,
            lifecycle,
            sink,
            context: None,
            implementation: None,
            state: PluginState::Idle,
        }
    }

    /// Send decoded records somewhere other than the JSON report.
    pub fn with_sink(mut self, sink: Box<dyn RecordSink + Send>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Attach to a hardware context. Later attaches are ignored.
    pub fn attach(
        &mut self,
        context: Arc<dyn HwContext>,
        device: DeviceConfig,
        class: DeviceClass,
    ) -> Result<()> {
        if self.context.is_some() {
            log::debug!("Only one device is supported, ignoring context {}", context.id());
            return Ok(());
        }
        self.context = Some(Arc::clone(&context));
        log::debug!("Attaching to context {} (hw_gen {})", context.id(), device.hw_gen);

        device.validate()?;
        let settings = RecorderSettings::from(&self.config);
        Self::send_setup_transaction(&context, &device, &settings)?;

        let Some(mut implementation) = implementation_for(class, device, settings) else {
            log::info!("No ML timeline implementation for {:?} devices", class);
            return Ok(());
        };
        implementation.set_context(context);
        implementation.set_buffer_size(self.buffer_size);

        let opened = implementation.update_device();
        self.implementation = Some(implementation);
        match opened {
            Ok(()) => {
                self.state = PluginState::Capturing;
                Ok(())
            }
            Err(e) => {
                self.state = PluginState::Finished;
                Err(e)
            }
        }
    }

    /// Host request to read out record timestamps.
    pub fn capture(&mut self) -> Result<Option<RecordSet>> {
        self.finish()
    }

    /// Flush on context teardown. Contexts other than the attached one are ignored.
    pub fn flush(&mut self, context: &dyn HwContext) -> Result<Option<RecordSet>> {
        match &self.context {
            Some(attached) if attached.id() == context.id() => self.finish(),
            Some(_) => {
                log::debug!(
                    "Cannot retrieve ML timeline data as a new hardware context {} is passed",
                    context.id()
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Flush whatever is still open.
    pub fn write_all(&mut self) -> Result<Option<RecordSet>> {
        self.finish()
    }

    fn finish(&mut self) -> Result<Option<RecordSet>> {
        if self.state != PluginState::Capturing {
            return Ok(None);
        }
        self.state = PluginState::Finished;
        let Some(implementation) = self.implementation.as_mut() else {
            return Ok(None);
        };

        let records = implementation.finish_flush_device()?;
        if let Some(records) = &records {
            self.sink.emit(records)?;
        }
        if let (Some(path), Some(bracket)) = (&self.config.latency_path, implementation.last_latency()) {
            write_latency(path, &bracket)?;
        }
        Ok(records)
    }

    fn send_setup_transaction(
        context: &Arc<dyn HwContext>,
        device: &DeviceConfig,
        settings: &RecorderSettings,
    ) -> Result<()> {
        let mut instance = DriverInstance::initialize(device)?;
        instance.start_transaction()?;
        instance.record_timer(0)?;
        let txn = instance.export_serialized();
        instance.clear_transaction();
        let instructions = encode(txn?.as_bytes())?;

        let mut submitter = TransactionSubmitter::new(Arc::clone(context), "AIE Profile Setup")
            .with_timeout(settings.completion_timeout);
        submitter.bind(&settings.kernel_name)?;
        submitter.submit(&instructions)
    }
}

impl Drop for TimelinePlugin {
    fn drop(&mut self) {
        if self.lifecycle.database_alive() {
            if let Err(e) = self.write_all() {
                log::warn!("Failed to flush ML timeline on shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_KERNEL_NAME;
    use crate::error::TimelineError;
    use crate::timeline::TimerRecord;
    use crate::xrt::sim::SimContext;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MemorySink {
        sets: Arc<Mutex<Vec<RecordSet>>>,
    }

    impl RecordSink for MemorySink {
        fn emit(&mut self, records: &RecordSet) -> Result<()> {
            self.sets.lock().unwrap().push(records.clone());
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            grace_period_ms: Some(0),
            buffer_size: Some("4K".to_string()),
            ..Config::default()
        }
    }

    fn plugin(host: &Arc<HostFlag>, sink: &MemorySink) -> TimelinePlugin {
        TimelinePlugin::new(config(), host.clone()).with_sink(Box::new(sink.clone()))
    }

    fn workload(ctx: &SimContext, ids: &[u32]) {
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
    fn test_attach_capture() {
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::new().with_timer(0, 1);
        let mut plugin = plugin(&host, &sink);
        assert_eq!(plugin.buffer_size(), 4096);

        plugin.attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();
        assert_eq!(plugin.state(), PluginState::Capturing);

        workload(&ctx, &[10, 11]);
        let records = plugin.capture().unwrap().unwrap();
        // The setup transaction's record landed nowhere and did not shift ids
        assert_eq!(
            records.records(),
            &[TimerRecord { id: 10, cycle: 2 }, TimerRecord { id: 11, cycle: 3 }]
        );
        assert_eq!(plugin.state(), PluginState::Finished);
        assert_eq!(sink.sets.lock().unwrap().len(), 1);

        // Nothing left for a later flush
        assert_eq!(plugin.flush(&ctx).unwrap(), None);
    }

    #[test]
    fn test_flush_ignores_other_context() {
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::new();
        let other = SimContext::new();
        let mut plugin = plugin(&host, &sink);
        plugin.attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();

        assert_eq!(plugin.flush(&other).unwrap(), None);
        assert_eq!(plugin.state(), PluginState::Capturing);
        assert_eq!(plugin.flush(&ctx).unwrap(), Some(RecordSet::Empty));
        assert_eq!(*sink.sets.lock().unwrap(), vec![RecordSet::Empty]);
    }

    #[test]
    fn test_second_attach_ignored() {
        let host = Arc::new(HostFlag::new(false));
        let sink = MemorySink::default();
        let first = SimContext::new();
        let second = SimContext::new();
        let mut plugin = plugin(&host, &sink);
        plugin.attach(Arc::new(first.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();
        plugin.attach(Arc::new(second.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();
        assert_eq!(second.runs(), 0);
        assert_eq!(second.live_debug_buffers(), 0);
        assert_eq!(first.live_debug_buffers(), 1);
    }

    #[test]
    fn test_missing_kernel_is_recoverable() {
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::with_kernels(&[]);
        let mut plugin = plugin(&host, &sink);
        let err = plugin
            .attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Client)
            .unwrap_err();
        assert!(matches!(err, TimelineError::KernelNotFound { .. }));
        assert!(err.is_recoverable());
        assert_eq!(plugin.state(), PluginState::Idle);
        assert_eq!(plugin.capture().unwrap(), None);
        assert_eq!(ctx.live_debug_buffers(), 0);
    }

    #[test]
    fn test_edge_has_no_implementation() {
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::new();
        let mut plugin = plugin(&host, &sink);
        plugin.attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Edge).unwrap();
        assert_eq!(plugin.state(), PluginState::Idle);
        assert_eq!(ctx.live_debug_buffers(), 0);
    }

    #[test]
    fn test_drop_flushes_while_host_alive() {
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::new();
        {
            let mut plugin = plugin(&host, &sink);
            plugin.attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();
            workload(&ctx, &[1]);
        }
        assert_eq!(sink.sets.lock().unwrap().len(), 1);
        assert_eq!(ctx.live_debug_buffers(), 0);
    }

    #[test]
    fn test_drop_skips_flush_after_host_teardown() {
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::new();
        {
            let mut plugin = plugin(&host, &sink);
            plugin.attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();
            host.set_alive(false);
        }
        assert!(sink.sets.lock().unwrap().is_empty());
    }

    #[test]
    fn test_latency_written() {
        let dir = tempfile::tempdir().unwrap();
        let latency = dir.path().join("latency.txt");
        let host = Arc::new(HostFlag::new(true));
        let sink = MemorySink::default();
        let ctx = SimContext::new();
        let config = Config {
            diagnostic_reads: Some(true),
            latency_path: Some(latency.clone()),
            ..config()
        };
        let mut plugin = TimelinePlugin::new(config, host).with_sink(Box::new(sink.clone()));
        plugin.attach(Arc::new(ctx.clone()), DeviceConfig::npu1(), DeviceClass::Client).unwrap();
        plugin.capture().unwrap();

        let text = std::fs::read_to_string(&latency).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
