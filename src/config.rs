//! Configuration management for xdna-timeline.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`XDNA_TIMELINE_BUFFER_SIZE`, etc.)
//! 2. Project-local config file (`./xdna-timeline.toml`)
//! 3. User config file (`~/.config/xdna-timeline/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # xdna-timeline.toml
//!
//! # Result buffer size: bytes, or with a K/M suffix
//! buffer_size = "128K"
//!
//! # Where the decoded records are written
//! output_path = "record_timer_ts.json"
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::device::{DeviceClass, DeviceConfig};

/// Kernel that executes configuration transactions.
pub const DEFAULT_KERNEL_NAME: &str = "XDP_KERNEL";

/// Result buffer size used when none is configured or the setting is invalid.
pub const DEFAULT_BUFFER_SIZE: usize = 0x20000;

/// Report file name used when none is configured.
pub const DEFAULT_OUTPUT_PATH: &str = "record_timer_ts.json";

/// Hold time after a flush, in milliseconds.
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 1000;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

static BUFFER_SIZE_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// xdna-timeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Result buffer size string, e.g. "128K" or "4M".
    pub buffer_size: Option<String>,

    /// Kernel resolved from the hardware context.
    pub kernel_name: Option<String>,

    /// JSON report destination.
    pub output_path: Option<PathBuf>,

    /// Where to write the latency bracket of the last diagnostic read.
    pub latency_path: Option<PathBuf>,

    /// Hold time after a flush so firmware logs drain before power-down.
    pub grace_period_ms: Option<u64>,

    /// Staggered timer reads taken before the capture window opens.
    pub pre_roll_reads: Option<usize>,

    /// Take a single timer read before and after the capture window.
    pub diagnostic_reads: Option<bool>,

    /// Bound on each completion wait. Unset waits indefinitely.
    pub completion_timeout_ms: Option<u64>,

    /// Which capture implementation to attach.
    pub device_class: Option<DeviceClass>,

    /// Array geometry. Defaults to NPU1.
    pub device: Option<DeviceConfig>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `xdna-timeline.toml`
    /// 3. User config `~/.config/xdna-timeline/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Result buffer size in bytes.
    pub fn buffer_size_bytes(&self) -> usize {
        match &self.buffer_size {
            Some(s) => parse_buffer_size(s),
            None => DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn kernel_name(&self) -> String {
        self.kernel_name
            .clone()
            .unwrap_or_else(|| DEFAULT_KERNEL_NAME.to_string())
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS))
    }

    pub fn pre_roll_reads(&self) -> usize {
        self.pre_roll_reads.unwrap_or(0)
    }

    pub fn diagnostic_reads(&self) -> bool {
        self.diagnostic_reads.unwrap_or(false)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn device_class(&self) -> DeviceClass {
        self.device_class.unwrap_or_default()
    }

    pub fn device_config(&self) -> DeviceConfig {
        self.device.unwrap_or_else(DeviceConfig::npu1)
    }

    /// Load user configuration from ~/.config/xdna-timeline/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./xdna-timeline.toml
    fn load_local_config() -> Option<Self> {
        Self::load_from_file(Path::new("xdna-timeline.toml"))
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.buffer_size.is_some() {
            self.buffer_size = other.buffer_size;
        }
        if other.kernel_name.is_some() {
            self.kernel_name = other.kernel_name;
        }
        if other.output_path.is_some() {
            self.output_path = other.output_path;
        }
        if other.latency_path.is_some() {
            self.latency_path = other.latency_path;
        }
        if other.grace_period_ms.is_some() {
            self.grace_period_ms = other.grace_period_ms;
        }
        if other.pre_roll_reads.is_some() {
            self.pre_roll_reads = other.pre_roll_reads;
        }
        if other.diagnostic_reads.is_some() {
            self.diagnostic_reads = other.diagnostic_reads;
        }
        if other.completion_timeout_ms.is_some() {
            self.completion_timeout_ms = other.completion_timeout_ms;
        }
        if other.device_class.is_some() {
            self.device_class = other.device_class;
        }
        if other.device.is_some() {
            self.device = other.device;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(size) = lookup("XDNA_TIMELINE_BUFFER_SIZE") {
            log::info!("Using XDNA_TIMELINE_BUFFER_SIZE from environment: {}", size);
            self.buffer_size = Some(size);
        }
        if let Some(path) = lookup("XDNA_TIMELINE_OUTPUT") {
            log::info!("Using XDNA_TIMELINE_OUTPUT from environment: {}", path);
            self.output_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = lookup("XDNA_TIMELINE_GRACE_MS") {
            match ms.trim().parse() {
                Ok(ms) => self.grace_period_ms = Some(ms),
                Err(e) => log::warn!("Ignoring XDNA_TIMELINE_GRACE_MS={}: {}", ms, e),
            }
        }
        if let Some(n) = lookup("XDNA_TIMELINE_PRE_ROLL") {
            match n.trim().parse() {
                Ok(n) => self.pre_roll_reads = Some(n),
                Err(e) => log::warn!("Ignoring XDNA_TIMELINE_PRE_ROLL={}: {}", n, e),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("xdna-timeline").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# xdna-timeline configuration
# Place this file at ~/.config/xdna-timeline/config.toml or ./xdna-timeline.toml

# Result buffer size in bytes, or with a K/M suffix (default 128K)
buffer_size = "128K"

# JSON report destination
# output_path = "record_timer_ts.json"

# Latency bracket of the last diagnostic read (mid, before, after)
# latency_path = "record_timer_latency.txt"

# Hold after flush so firmware logs drain (default 1000)
# grace_period_ms = 1000

# Staggered warm-up reads before the window opens (default 0)
# pre_roll_reads = 5

# Single timer read before and after the window (default false)
# diagnostic_reads = true

# Bound each completion wait (default: wait forever)
# completion_timeout_ms = 5000

# "client" or "edge"
# device_class = "client"

# Array geometry (default NPU1)
# [device]
# hw_gen = 3
# base_address = 0
# column_shift = 25
# row_shift = 20
# num_rows = 6
# num_columns = 5
# shim_row = 0
# mem_row_start = 1
# mem_num_rows = 1
# aie_tile_row_start = 2
# aie_tile_num_rows = 4
"#
        .to_string()
    }
}

/// Parse a buffer size of the form `<integer>[K|k|M|m]`.
///
/// No suffix means bytes. Invalid, zero or overflowing values fall back to
/// [`DEFAULT_BUFFER_SIZE`] with a warning.
pub fn parse_buffer_size(s: &str) -> usize {
    let re = BUFFER_SIZE_RE.get_or_init(|| Regex::new(r"^\s*([0-9]+)\s*([KkMm]?)\s*$").ok());

    let parsed = re
        .as_ref()
        .and_then(|re| re.captures(s))
        .and_then(|caps| {
            let value: usize = caps.get(1)?.as_str().parse().ok()?;
            let scale = match caps.get(2).map(|m| m.as_str()) {
                Some("K") | Some("k") => 1024,
                Some("M") | Some("m") => 1024 * 1024,
                _ => 1,
            };
            value.checked_mul(scale)
        })
        .filter(|size| *size > 0);

    match parsed {
        Some(size) => size,
        None => {
            log::warn!(
                "Invalid buffer size '{}', using default of 0x{:x} bytes",
                s, DEFAULT_BUFFER_SIZE
            );
            DEFAULT_BUFFER_SIZE
        }
    }
}
