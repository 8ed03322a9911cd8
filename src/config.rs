use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LogError, Result};
use crate::record::RECORD_SIZE;
use crate::storage::engine::EngineConfig;
use crate::storage::ring::SLOTS_OFFSET;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Identifier printed in the last CSV column.
    #[serde(default = "default_node_id")]
    pub node_id: u16,
    /// Sampling configuration.
    pub sensor: SensorConfig,
    /// NVRAM staging area.
    pub nvram: NvramConfig,
    /// Removable-media storage.
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    /// Producer cadence in milliseconds.
    #[serde(default = "default_log_period_ms")]
    pub log_period_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NvramConfig {
    /// Path of the NVRAM image file.
    pub path: PathBuf,
    /// Device size in bytes. Ring capacity follows from it.
    #[serde(default = "default_nvram_size_bytes")]
    pub size_bytes: u32,
    /// Header persist cadence in id assignments (1 = every assignment).
    #[serde(default = "default_persist_every")]
    pub persist_every: u32,
}

/// What `append` does when the ring is at capacity.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFullPolicy {
    /// Overwrite the oldest record and count it in `overrun_records_total`.
    #[default]
    OverwriteOldest,
    /// Refuse the newest record; the ring keeps what it has.
    DropNewest,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Mount point of the removable media.
    pub mount_point: PathBuf,
    /// Flush when this many records are buffered in the ring.
    #[serde(default = "default_flush_watermark")]
    pub flush_watermark_records: u32,
    /// Periodic flush deadline in milliseconds.
    #[serde(default = "default_flush_period_ms")]
    pub flush_period_ms: u64,
    /// Size hint for one flush batch.
    #[serde(default = "default_batch_bytes")]
    pub batch_bytes_target: usize,
    /// Cap on the tail-repair / resume scan window.
    #[serde(default = "default_tail_scan_bytes")]
    pub tail_scan_bytes: u64,
    /// Line-buffer size for the open day file.
    #[serde(default = "default_file_buffer_bytes")]
    pub file_buffer_bytes: usize,
    /// Fixed backoff after a media failure, milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Record cap for one flush pass.
    #[serde(default = "default_max_records_per_pass")]
    pub max_records_per_pass: u32,
    /// Wall-time cap for one flush pass, milliseconds.
    #[serde(default = "default_max_pass_ms")]
    pub max_pass_ms: u64,
    /// Bounded producer queue capacity in records.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Ring behavior at capacity.
    #[serde(default)]
    pub on_full: OnFullPolicy,
    /// Offset of the descriptive local ISO column; file naming stays UTC.
    #[serde(default)]
    pub local_offset_minutes: i32,
}

fn default_node_id() -> u16 { 1 }
fn default_log_period_ms() -> u64 { 1_000 }
fn default_nvram_size_bytes() -> u32 { 32_768 }
fn default_persist_every() -> u32 { 1 }
fn default_flush_watermark() -> u32 { 16 }
fn default_flush_period_ms() -> u64 { 30_000 }
fn default_batch_bytes() -> usize { 8_192 }
fn default_tail_scan_bytes() -> u64 { 256 * 1024 }
fn default_file_buffer_bytes() -> usize { 4_096 }
fn default_backoff_ms() -> u64 { 5_000 }
fn default_max_records_per_pass() -> u32 { 512 }
fn default_max_pass_ms() -> u64 { 250 }
fn default_queue_capacity() -> usize { 64 }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LogError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| LogError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(100..=3_600_000).contains(&self.sensor.log_period_ms) {
            return Err(LogError::Config(
                "log_period_ms must be in 100..=3600000".into(),
            ));
        }
        if self.nvram.size_bytes < SLOTS_OFFSET + RECORD_SIZE as u32 {
            return Err(LogError::Config(format!(
                "nvram.size_bytes must hold at least one record slot (>= {})",
                SLOTS_OFFSET + RECORD_SIZE as u32
            )));
        }
        if self.nvram.persist_every == 0 {
            return Err(LogError::Config("nvram.persist_every must be >= 1".into()));
        }
        if self.storage.flush_watermark_records == 0 {
            return Err(LogError::Config("flush_watermark_records must be >= 1".into()));
        }
        if self.storage.flush_period_ms < 1_000 {
            return Err(LogError::Config("flush_period_ms must be >= 1000".into()));
        }
        if self.storage.batch_bytes_target < 4_096 {
            return Err(LogError::Config("batch_bytes_target must be >= 4096".into()));
        }
        if self.storage.tail_scan_bytes == 0 {
            return Err(LogError::Config("tail_scan_bytes must be >= 1".into()));
        }
        if self.storage.max_records_per_pass == 0 {
            return Err(LogError::Config("max_records_per_pass must be >= 1".into()));
        }
        if self.storage.queue_capacity == 0 {
            return Err(LogError::Config("queue_capacity must be >= 1".into()));
        }
        if self.storage.local_offset_minutes.abs() >= 24 * 60 {
            return Err(LogError::Config(
                "local_offset_minutes must be within one day".into(),
            ));
        }
        Ok(())
    }

    /// Flatten the storage sections into the engine's tunable set.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            node_id: self.node_id,
            mount_point: self.storage.mount_point.clone(),
            flush_watermark_records: self.storage.flush_watermark_records,
            flush_period: Duration::from_millis(self.storage.flush_period_ms),
            batch_bytes_target: self.storage.batch_bytes_target,
            max_records_per_pass: self.storage.max_records_per_pass,
            max_pass_time: Duration::from_millis(self.storage.max_pass_ms),
            backoff: Duration::from_millis(self.storage.backoff_ms),
            tail_scan_bytes: self.storage.tail_scan_bytes,
            file_buffer_bytes: self.storage.file_buffer_bytes,
            on_full: self.storage.on_full,
            local_offset_minutes: self.storage.local_offset_minutes,
        }
    }
}
