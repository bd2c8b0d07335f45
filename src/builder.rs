//! Fluent builder for Kernel construction.

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::reactor::Kernel;

use std::path::PathBuf;
use std::time::Duration;

/// Builder for constructing a [`Kernel`] with a fluent API.
///
/// # Example
/// ```no_run
/// use ripple::RuntimeBuilder;
/// use std::time::Duration;
///
/// let kernel = RuntimeBuilder::new()
///     .heartbeat_interval(Duration::from_millis(50))
///     .build()
///     .expect("kernel");
/// # drop(kernel);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the defaults with `RIPPLE_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = RuntimeConfig::default();
        config.apply_env_overrides()?;
        Ok(Self { config })
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.runtime_dir = dir.into();
        self
    }

    pub fn max_open_handles(mut self, max: usize) -> Self {
        self.config.max_open_handles = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn max_frame_length(mut self, max: usize) -> Self {
        self.config.max_frame_length = max;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.config.read_chunk_size = size;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Creates the runtime directory and builds the kernel with its built-in
    /// services loaded.
    pub fn build(self) -> Result<Kernel> {
        Kernel::new(self.config)
    }
}
