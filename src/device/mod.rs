//! Device geometry for AMD XDNA NPUs.
//!
//! This module provides:
//! - [`DeviceConfig`], the driver configuration a transaction is built against
//! - [`DeviceConfigBuilder`] for assembling one field by field from metadata
//! - [`DeviceClass`] for picking the capture implementation at attach time
//! - [`HostMemory`], the simulated DDR used by the in-process backend
//!
//! # Architecture Overview
//!
//! ```text
//!     Col 0    Col 1    Col 2    Col 3    Col 4
//!   +--------+--------+--------+--------+--------+
//! 5 |Compute |Compute |Compute |Compute |Compute |  <- aie_tile_row_start + 3
//!   +--------+--------+--------+--------+--------+
//! 4 |Compute |Compute |Compute |Compute |Compute |
//!   +--------+--------+--------+--------+--------+
//! 3 |Compute |Compute |Compute |Compute |Compute |
//!   +--------+--------+--------+--------+--------+
//! 2 |Compute |Compute |Compute |Compute |Compute |  <- aie_tile_row_start
//!   +--------+--------+--------+--------+--------+
//! 1 |MemTile |MemTile |MemTile |MemTile |MemTile |  <- mem_row_start
//!   +--------+--------+--------+--------+--------+
//! 0 | Shim   | Shim   | Shim   | Shim   | Shim   |  <- shim_row
//!   +--------+--------+--------+--------+--------+
//! ```
//!
//! A register address is `base_address | (col << column_shift) | (row << row_shift) | offset`.
//!
//! # Example
//!
//! ```
//! use xdna_timeline::device::{DeviceConfig, DeviceConfigBuilder, AieGeneration};
//!
//! let npu1 = DeviceConfig::npu1();
//! assert_eq!(npu1.generation(), Some(AieGeneration::Aie2Ipu));
//! assert_eq!(npu1.tile_address(1, 2, 0x32000), 0x0223_2000);
//!
//! // Metadata readers fill a builder; missing fields are reported by name.
//! let err = DeviceConfigBuilder::new().hw_gen(3).build().unwrap_err();
//! assert!(err.to_string().contains("base_address"));
//! ```

pub mod host_memory;

pub use host_memory::{HostMemory, HostMemoryError, MemoryRegion};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TimelineError};

/// AIE hardware generation, as encoded in the driver configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AieGeneration {
    /// First-generation AI Engine (Versal)
    Aie = 1,
    /// AI Engine ML (Versal edge)
    AieMl = 2,
    /// AIE2 in the Phoenix/HawkPoint NPU
    Aie2Ipu = 3,
    /// AIE2P (Strix/Krackan NPU)
    Aie2P = 4,
    /// AIE2PS
    Aie2Ps = 5,
}

impl AieGeneration {
    /// Decode the raw `hw_gen` value.
    pub fn from_raw(hw_gen: u8) -> Option<Self> {
        match hw_gen {
            1 => Some(Self::Aie),
            2 => Some(Self::AieMl),
            3 => Some(Self::Aie2Ipu),
            4 => Some(Self::Aie2P),
            5 => Some(Self::Aie2Ps),
            _ => None,
        }
    }
}

impl std::fmt::Display for AieGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aie => write!(f, "AIE"),
            Self::AieMl => write!(f, "AIE-ML"),
            Self::Aie2Ipu => write!(f, "AIE2 (NPU1)"),
            Self::Aie2P => write!(f, "AIE2P (NPU2+)"),
            Self::Aie2Ps => write!(f, "AIE2PS"),
        }
    }
}

/// Device class used to select the capture implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Client NPU driven through the XDP kernel (Ryzen AI).
    #[default]
    Client,
    /// Edge/VE2 devices; no record-timer path exists for them.
    Edge,
}

/// Tile-array driver configuration.
///
/// Produced by the metadata reader from the device image. Every field must be
/// present before a transaction is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub hw_gen: u8,
    pub base_address: u64,
    pub column_shift: u8,
    pub row_shift: u8,
    pub num_rows: u8,
    pub num_columns: u8,
    pub shim_row: u8,
    pub mem_row_start: u8,
    pub mem_num_rows: u8,
    pub aie_tile_row_start: u8,
    pub aie_tile_num_rows: u8,
}

impl DeviceConfig {
    /// Phoenix NPU1 geometry: 5 columns, shim row 0, one mem-tile row,
    /// four compute rows.
    pub fn npu1() -> Self {
        Self {
            hw_gen: AieGeneration::Aie2Ipu as u8,
            base_address: 0,
            column_shift: 25,
            row_shift: 20,
            num_rows: 6,
            num_columns: 5,
            shim_row: 0,
            mem_row_start: 1,
            mem_num_rows: 1,
            aie_tile_row_start: 2,
            aie_tile_num_rows: 4,
        }
    }

    /// The hardware generation, if known.
    pub fn generation(&self) -> Option<AieGeneration> {
        AieGeneration::from_raw(self.hw_gen)
    }

    /// Check that the geometry is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.generation().is_none() {
            return Err(TimelineError::ConfigIncomplete(format!(
                "unknown hw_gen {}",
                self.hw_gen
            )));
        }
        if self.num_rows == 0 || self.num_columns == 0 {
            return Err(TimelineError::ConfigIncomplete(
                "array has no rows or columns".to_string(),
            ));
        }
        if self.column_shift >= 64 || self.row_shift >= 64 {
            return Err(TimelineError::ConfigIncomplete(format!(
                "shift out of range (column {}, row {})",
                self.column_shift, self.row_shift
            )));
        }
        if self.shim_row >= self.num_rows {
            return Err(TimelineError::ConfigIncomplete(format!(
                "shim row {} outside {} rows",
                self.shim_row, self.num_rows
            )));
        }
        let ranges = [
            ("mem tile", self.mem_row_start, self.mem_num_rows),
            ("aie tile", self.aie_tile_row_start, self.aie_tile_num_rows),
        ];
        for (what, start, count) in ranges {
            if start as u16 + count as u16 > self.num_rows as u16 {
                return Err(TimelineError::ConfigIncomplete(format!(
                    "{} rows {}..{} outside {} rows",
                    what,
                    start,
                    start as u16 + count as u16,
                    self.num_rows
                )));
            }
        }
        Ok(())
    }

    /// Absolute register address of `offset` in tile (col, row).
    pub fn tile_address(&self, col: u8, row: u8, offset: u32) -> u64 {
        self.base_address
            | ((col as u64) << self.column_shift)
            | ((row as u64) << self.row_shift)
            | offset as u64
    }

    /// Check if a tile position is inside the array.
    pub fn is_valid_tile(&self, col: u8, row: u8) -> bool {
        col < self.num_columns && row < self.num_rows
    }
}

/// Field-by-field assembly of a [`DeviceConfig`].
#[derive(Debug, Clone, Default)]
pub struct DeviceConfigBuilder {
    hw_gen: Option<u8>,
    base_address: Option<u64>,
    column_shift: Option<u8>,
    row_shift: Option<u8>,
    num_rows: Option<u8>,
    num_columns: Option<u8>,
    shim_row: Option<u8>,
    mem_row_start: Option<u8>,
    mem_num_rows: Option<u8>,
    aie_tile_row_start: Option<u8>,
    aie_tile_num_rows: Option<u8>,
}

macro_rules! builder_setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $field(mut self, value: $ty) -> Self {
                self.$field = Some(value);
                self
            }
        )*
    };
}

impl DeviceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    builder_setters! {
        hw_gen: u8,
        base_address: u64,
        column_shift: u8,
        row_shift: u8,
        num_rows: u8,
        num_columns: u8,
        shim_row: u8,
        mem_row_start: u8,
        mem_num_rows: u8,
        aie_tile_row_start: u8,
        aie_tile_num_rows: u8,
    }

    /// Finish the configuration, naming the first missing field on failure.
    pub fn build(self) -> Result<DeviceConfig> {
        fn require<T>(value: Option<T>, name: &str) -> Result<T> {
            value.ok_or_else(|| TimelineError::ConfigIncomplete(format!("missing {}", name)))
        }

        let config = DeviceConfig {
            hw_gen: require(self.hw_gen, "hw_gen")?,
            base_address: require(self.base_address, "base_address")?,
            column_shift: require(self.column_shift, "column_shift")?,
            row_shift: require(self.row_shift, "row_shift")?,
            num_rows: require(self.num_rows, "num_rows")?,
            num_columns: require(self.num_columns, "num_columns")?,
            shim_row: require(self.shim_row, "shim_row")?,
            mem_row_start: require(self.mem_row_start, "mem_row_start")?,
            mem_num_rows: require(self.mem_num_rows, "mem_num_rows")?,
            aie_tile_row_start: require(self.aie_tile_row_start, "aie_tile_row_start")?,
            aie_tile_num_rows: require(self.aie_tile_num_rows, "aie_tile_num_rows")?,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::new()
            .hw_gen(3)
            .base_address(0)
            .column_shift(25)
            .row_shift(20)
            .num_rows(6)
            .num_columns(5)
            .shim_row(0)
            .mem_row_start(1)
            .mem_num_rows(1)
            .aie_tile_row_start(2)
            .aie_tile_num_rows(4)
    }

    #[test]
    fn test_builder_complete() {
        let config = full_builder().build().unwrap();
        assert_eq!(config, DeviceConfig::npu1());
    }

    #[test]
    fn test_builder_reports_missing_field() {
        let err = DeviceConfigBuilder::new()
            .hw_gen(3)
            .base_address(0)
            .column_shift(25)
            .build()
            .unwrap_err();
        assert!(matches!(err, TimelineError::ConfigIncomplete(ref msg) if msg == "missing row_shift"));
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut config = DeviceConfig::npu1();
        config.aie_tile_num_rows = 5;
        assert!(config.validate().is_err());

        let mut config = DeviceConfig::npu1();
        config.hw_gen = 42;
        assert!(config.validate().is_err());

        let mut config = DeviceConfig::npu1();
        config.shim_row = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tile_address() {
        let config = DeviceConfig::npu1();
        assert_eq!(config.tile_address(0, 0, 0x1D000), 0x0001_D000);
        assert_eq!(config.tile_address(1, 2, 0x31520), 0x0223_1520);
        assert!(config.is_valid_tile(4, 5));
        assert!(!config.is_valid_tile(5, 0));
    }

    #[test]
    fn test_generation_display() {
        assert_eq!(AieGeneration::from_raw(3), Some(AieGeneration::Aie2Ipu));
        assert_eq!(AieGeneration::from_raw(0), None);
        assert_eq!(format!("{}", AieGeneration::Aie2P), "AIE2P (NPU2+)");
    }

    #[test]
    fn test_device_config_from_toml() {
        let text = r#"
            hw_gen = 4
            base_address = 0
            column_shift = 25
            row_shift = 20
            num_rows = 6
            num_columns = 8
            shim_row = 0
            mem_row_start = 1
            mem_num_rows = 1
            aie_tile_row_start = 2
            aie_tile_num_rows = 4
        "#;
        let config: DeviceConfig = toml::from_str(text).unwrap();
        assert_eq!(config.generation(), Some(AieGeneration::Aie2P));
        assert!(config.validate().is_ok());
    }
}
