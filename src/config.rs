//! Configuration for the engine, interceptor, coordinator and plugin
//!
//! Every struct deserializes from the plugin's JSON config blob with all
//! keys optional; missing keys take the defaults below, which match the
//! reference deployment (retry 10 x 5 s, 1 GiB file cap, 10000-event
//! buffer, 2 worker threads).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::size::{GIB, MIB};
use crate::status::{Error, ErrorCode};

/// Bitmap engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on tracked (non-clean) blocks; 0 means unbounded.
    pub max_blocks: u64,
    /// Soft memory budget for the index state in MiB; 0 disables the check.
    pub memory_limit_mb: u64,
    /// Whether snapshot persistence is enabled.
    pub persistence_enabled: bool,
    /// Snapshot file path, required when persistence is enabled.
    pub persistence_path: Option<PathBuf>,
    /// Percentage of the memory budget at which cleanup is advised.
    pub lru_cleanup_threshold_pct: u8,
    /// Whether to watch index memory against the budget.
    pub memory_monitor_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_blocks: 0,
            memory_limit_mb: 0,
            persistence_enabled: false,
            persistence_path: None,
            lru_cleanup_threshold_pct: 80,
            memory_monitor_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the number of tracked blocks.
    pub fn with_max_blocks(mut self, max_blocks: u64) -> Self {
        self.max_blocks = max_blocks;
        self
    }

    /// Set the memory budget in MiB and enable monitoring.
    pub fn with_memory_limit_mb(mut self, limit: u64) -> Self {
        self.memory_limit_mb = limit;
        self.memory_monitor_enabled = limit > 0;
        self
    }

    /// Enable snapshot persistence at `path`.
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_enabled = true;
        self.persistence_path = Some(path.into());
        self
    }
}

/// What producers do when the event buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Drop the event and count it; the producer never blocks. Default:
    /// the submitter is the database hot path, and storage latency must
    /// not grow with backup lag.
    DropOnFull,
    /// Wait up to `timeout_ms` for capacity before dropping.
    Block {
        /// Bound on the wait, in milliseconds.
        timeout_ms: u64,
    },
}

/// How FLUSH events are applied to the engine.
///
/// FLUSH marking a block durable only means "no longer dirty relative to
/// the last backup" when backups cover up to that WAL offset; hosts that
/// treat FLUSH as a pure hint run with [`FlushPolicy::Ignore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPolicy {
    /// FLUSH purges the block back to clean (default).
    ClearBlock,
    /// FLUSH is a hint; the engine is not touched.
    Ignore,
}

/// Event interceptor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptorConfig {
    /// Master switch; a disabled interceptor ignores all submissions.
    pub enabled: bool,
    /// Ring-buffer capacity in events.
    pub event_buffer_size: usize,
    /// Number of worker threads applying events to the engine.
    pub callback_threads: usize,
    /// Overflow behavior for producers.
    pub queue_policy: QueuePolicy,
    /// FLUSH-event semantics.
    pub flush_policy: FlushPolicy,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_buffer_size: 10_000,
            callback_threads: 2,
            queue_policy: QueuePolicy::DropOnFull,
            flush_policy: FlushPolicy::ClearBlock,
        }
    }
}

impl InterceptorConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable interception.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the event-buffer capacity.
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Set the worker-thread count.
    pub fn with_callback_threads(mut self, threads: usize) -> Self {
        self.callback_threads = threads;
        self
    }

    /// Set the overflow policy.
    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    /// Set the FLUSH policy.
    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = policy;
        self
    }
}

/// Compression effort for backup payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CompressionLevel {
    /// Level 1.
    Fastest,
    /// Level 2.
    Balanced,
    /// Level 3.
    Best,
}

impl TryFrom<u8> for CompressionLevel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(CompressionLevel::Fastest),
            2 => Ok(CompressionLevel::Balanced),
            3 => Ok(CompressionLevel::Best),
            _ => Err(Error::new(
                ErrorCode::InvalidParam,
                format!("compression level must be 1, 2 or 3, got {value}"),
            )),
        }
    }
}

impl From<CompressionLevel> for u8 {
    fn from(level: CompressionLevel) -> u8 {
        match level {
            CompressionLevel::Fastest => 1,
            CompressionLevel::Balanced => 2,
            CompressionLevel::Best => 3,
        }
    }
}

/// Backup coordinator options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Largest batch a cursor hands out.
    pub max_blocks_per_batch: u32,
    /// Batch assembly deadline, milliseconds.
    pub batch_timeout_ms: u32,
    /// Whether archive payloads are compressed.
    pub enable_compression: bool,
    /// Whether archive payloads are encrypted.
    pub enable_encryption: bool,
    /// Key material when encryption is enabled.
    pub encryption_key: Option<String>,
    /// Maximum retries for retryable failures.
    pub error_retry_max: u32,
    /// Pause between retries, seconds.
    pub error_retry_interval_s: u64,
    /// Directory receiving error-log files.
    pub error_store_path: Option<PathBuf>,
    /// Whether recorded errors are appended to the error store.
    pub enable_error_logging: bool,
    /// In-memory error buffer entries.
    pub error_buffer_size: u32,
    /// Directory receiving backup archives.
    pub backup_path: Option<PathBuf>,
    /// Size cap for a single archive file, bytes.
    pub backup_max_size: u64,
    /// Compression effort.
    pub compression_level: CompressionLevel,
    /// Assumed bytes per block for size estimation. Kept configurable;
    /// real block sizes vary too much for a constant baked into call
    /// sites.
    pub average_block_size: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_batch: 1000,
            batch_timeout_ms: 5000,
            enable_compression: true,
            enable_encryption: false,
            encryption_key: None,
            error_retry_max: 10,
            error_retry_interval_s: 5,
            error_store_path: None,
            enable_error_logging: true,
            error_buffer_size: 1000,
            backup_path: None,
            backup_max_size: GIB,
            compression_level: CompressionLevel::Fastest,
            average_block_size: MIB,
        }
    }
}

impl CoordinatorConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-batch block cap.
    pub fn with_max_blocks_per_batch(mut self, max: u32) -> Self {
        self.max_blocks_per_batch = max;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, max_retries: u32, interval: Duration) -> Self {
        self.error_retry_max = max_retries;
        self.error_retry_interval_s = interval.as_secs();
        self
    }

    /// Set the error-log directory.
    pub fn with_error_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_store_path = Some(path.into());
        self.enable_error_logging = true;
        self
    }

    /// Set the archive output directory.
    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Set the per-block estimation factor.
    pub fn with_average_block_size(mut self, bytes: u64) -> Self {
        self.average_block_size = bytes;
        self
    }

    /// Retry pause as a [`Duration`].
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.error_retry_interval_s)
    }
}

/// Top-level config blob accepted by the plugin entry point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// Engine section.
    pub engine: EngineConfig,
    /// Interceptor section.
    pub interceptor: InterceptorConfig,
    /// Coordinator section.
    pub coordinator: CoordinatorConfig,
}
