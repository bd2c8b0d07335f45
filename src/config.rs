//! Runtime configuration.
//!
//! [`RuntimeConfig`] carries everything the core consumes from its environment: the
//! scratch directory used for overflow files and Unix sockets, the open-handle ceiling
//! and the heartbeat interval. Values can be overridden from `RIPPLE_*` environment
//! variables.

use crate::error::{Error, Result};

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding [`RuntimeConfig::runtime_dir`].
pub const ENV_RUNTIME_DIR: &str = "RIPPLE_RUNTIME_DIR";
/// Environment variable overriding [`RuntimeConfig::max_open_handles`].
pub const ENV_MAX_OPEN_HANDLES: &str = "RIPPLE_MAX_OPEN_HANDLES";
/// Environment variable overriding [`RuntimeConfig::heartbeat_interval`], in milliseconds.
pub const ENV_HEARTBEAT_MS: &str = "RIPPLE_HEARTBEAT_MS";
/// Environment variable overriding [`RuntimeConfig::max_frame_length`].
pub const ENV_MAX_FRAME_LENGTH: &str = "RIPPLE_MAX_FRAME_LENGTH";

const DEFAULT_MAX_OPEN_HANDLES: usize = 1024;
const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(100);
const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;
const DEFAULT_READ_CHUNK: usize = 64 * 1024;
const DEFAULT_POLL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding overflow files and Unix socket paths.
    pub runtime_dir: PathBuf,
    /// Ceiling on descriptors held by the runtime: sockets, listeners, transfer files
    /// and overflow files. Overflow that would cross it is dropped and logged.
    pub max_open_handles: usize,
    /// Interval between two heartbeats of the kernel.
    pub heartbeat_interval: Duration,
    /// Largest frame payload the frame codec accepts.
    pub max_frame_length: usize,
    /// Size of a single socket read.
    pub read_chunk_size: usize,
    /// Number of readiness events fetched per poll.
    pub poll_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir().join("ripple"),
            max_open_handles: DEFAULT_MAX_OPEN_HANDLES,
            heartbeat_interval: DEFAULT_HEARTBEAT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_chunk_size: DEFAULT_READ_CHUNK,
            poll_capacity: DEFAULT_POLL_CAPACITY,
        }
    }
}

impl RuntimeConfig {
    /// Applies `RIPPLE_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides using `lookup` as the variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_RUNTIME_DIR) {
            if dir.trim().is_empty() {
                return Err(Error::Config(format!("{ENV_RUNTIME_DIR} is empty")));
            }
            self.runtime_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup(ENV_MAX_OPEN_HANDLES) {
            self.max_open_handles = parse_usize(ENV_MAX_OPEN_HANDLES, &raw)?;
        }

        if let Some(raw) = lookup(ENV_HEARTBEAT_MS) {
            let ms = parse_usize(ENV_HEARTBEAT_MS, &raw)?;
            if ms == 0 {
                return Err(Error::Config(format!("{ENV_HEARTBEAT_MS} must be positive")));
            }
            self.heartbeat_interval = Duration::from_millis(ms as u64);
        }

        if let Some(raw) = lookup(ENV_MAX_FRAME_LENGTH) {
            self.max_frame_length = parse_usize(ENV_MAX_FRAME_LENGTH, &raw)?;
        }

        Ok(())
    }
}

fn parse_usize(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: `{raw}` is not a non-negative integer")))
}
