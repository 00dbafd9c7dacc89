//! Report output.
//!
//! Decoded records leave the core through a [`RecordSink`]. [`JsonReport`]
//! writes the `record_timer_ts.json` layout:
//!
//! ```text
//! {
//!   "header": { "date", "time_created", "schema_version", "device", "clock_freq_MHz" },
//!   "record_timer_ts": [ { "id": 1, "cycle": 123456 }, ... ]   // [ {} ] when empty
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use serde_json::{json, Value};

use super::decode::RecordSet;
use crate::error::{Result, TimelineError};
use crate::xrt::LatencyBracket;

/// Consumer of decoded record sets.
pub trait RecordSink {
    fn emit(&mut self, records: &RecordSet) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SchemaVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

#[derive(Debug, Serialize)]
struct ReportHeader {
    date: String,
    time_created: i64,
    schema_version: SchemaVersion,
    device: String,
    #[serde(rename = "clock_freq_MHz")]
    clock_freq_mhz: u32,
}

/// JSON file writer.
#[derive(Debug, Clone)]
pub struct JsonReport {
    path: PathBuf,
    device: String,
    clock_freq_mhz: u32,
}

impl JsonReport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            device: "Client".to_string(),
            clock_freq_mhz: 1000,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Render the report document.
    pub fn render(&self, records: &RecordSet) -> anyhow::Result<String> {
        let now = chrono::Local::now();
        let header = ReportHeader {
            date: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            time_created: now.timestamp_millis(),
            schema_version: SchemaVersion { major: 1, minor: 0, patch: 0 },
            device: self.device.clone(),
            clock_freq_mhz: self.clock_freq_mhz,
        };

        let entries = match records {
            RecordSet::Empty => json!([{}]),
            RecordSet::Records(records) => {
                serde_json::to_value(records).context("serializing timer records")?
            }
        };

        let doc: Value = json!({
            "header": serde_json::to_value(&header).context("serializing report header")?,
            "record_timer_ts": entries,
        });
        serde_json::to_string_pretty(&doc).context("rendering report")
    }

    fn write(&self, records: &RecordSet) -> anyhow::Result<()> {
        let text = self.render(records)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}

impl RecordSink for JsonReport {
    fn emit(&mut self, records: &RecordSet) -> Result<()> {
        self.write(records)
            .map_err(|e| TimelineError::Report(format!("{:#}", e)))?;
        log::debug!("Finished writing {}", self.path.display());
        Ok(())
    }
}

/// Write a latency bracket as three lines: mid, before, after.
pub fn write_latency(path: &Path, bracket: &LatencyBracket) -> Result<()> {
    let text = format!("{}\n{}\n{}", bracket.mid, bracket.before, bracket.after);
    std::fs::write(path, text)?;
    Ok(())
}
