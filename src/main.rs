//! xdna-timeline: record-timer capture against the simulated XDNA device

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use xdna_timeline::config::{Config, DEFAULT_KERNEL_NAME};
use xdna_timeline::plugin::{HostFlag, TimelinePlugin};
use xdna_timeline::timeline::RecordSet;
use xdna_timeline::txn::{encode, DriverInstance, TransactionStream};
use xdna_timeline::xrt::{SimContext, TransactionSubmitter};

fn print_usage() {
    println!("Usage: xdna-timeline [OPTIONS]");
    println!();
    println!("Runs one capture window against the simulated device.");
    println!();
    println!("Options:");
    println!("  --records <N>          Record-timer ops in the synthetic workload (default 8)");
    println!("  --buffer-size <SIZE>   Result buffer size, e.g. 128K or 4M");
    println!("  --output <PATH>        JSON report path");
    println!("  --pre-roll <N>         Staggered warm-up reads before the window");
    println!("  --sample-config        Print a sample config file and exit");
    println!("  -h, --help             Show this help");
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config = Config::get().clone();
    let mut records: u32 = 8;

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        let mut value = || -> anyhow::Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .with_context(|| format!("{} needs a value", arg))
        };
        match arg {
            "--records" => records = value()?.parse().context("--records")?,
            "--buffer-size" => config.buffer_size = Some(value()?),
            "--output" => config.output_path = Some(PathBuf::from(value()?)),
            "--pre-roll" => config.pre_roll_reads = Some(value()?.parse().context("--pre-roll")?),
            "--sample-config" => {
                print!("{}", Config::sample_config());
                return Ok(());
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => bail!("Unknown option: {}", other),
        }
        i += 1;
    }

    // Nobody waits on firmware logs in the simulator
    if config.grace_period_ms.is_none() {
        config.grace_period_ms = Some(0);
    }

    let device = config.device_config();
    let class = config.device_class();
    let output = config.output_path();
    let ctx = SimContext::new();
    let host = Arc::new(HostFlag::new(true));

    let mut plugin = TimelinePlugin::new(config, host.clone());
    println!("Buffer size: 0x{:x} bytes", plugin.buffer_size());
    plugin.attach(Arc::new(ctx.clone()), device, class)?;

    // Synthetic workload: one transaction carrying ids 1..=N
    let mut inst = DriverInstance::initialize(&device)?;
    inst.start_transaction()?;
    for id in 1..=records {
        inst.record_timer(id)?;
    }
    let txn = inst.export_serialized()?;
    inst.clear_transaction();

    let stream = TransactionStream::parse(txn.as_bytes())?;
    println!(
        "Workload transaction: {} ops, {} bytes",
        stream.len(),
        txn.len()
    );

    let mut submitter = TransactionSubmitter::new(Arc::new(ctx.clone()), "workload");
    submitter.bind(DEFAULT_KERNEL_NAME)?;
    submitter.submit(&encode(txn.as_bytes())?)?;

    match plugin.flush(&ctx)? {
        Some(RecordSet::Records(records)) => {
            println!("Captured {} records -> {}", records.len(), output.display());
            for record in records.iter().take(10) {
                println!("  id {:4}  cycle {:>16} (0x{:x})", record.id, record.cycle, record.cycle);
            }
            if records.len() > 10 {
                println!("  ... ({} more)", records.len() - 10);
            }
        }
        Some(RecordSet::Empty) => println!("Capture window was empty -> {}", output.display()),
        None => println!("No capture window was open"),
    }

    host.set_alive(false);
    Ok(())
}
