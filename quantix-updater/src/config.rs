//! Updater configuration
//!
//! Typically loaded from the host's YAML config under an `updater` section;
//! every field has a default so an empty document is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Updater configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Directory for the downloaded package and the backup (default: system temp dir)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Minimum interval between download progress notifications
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Read size used when streaming local packages
    #[serde(default = "default_download_buffer_hint")]
    pub download_buffer_hint: usize,

    /// HTTP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// HTTP request timeout in seconds (covers the whole download)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Remove directories left empty by a rolled-back install
    #[serde(default = "default_true")]
    pub sweep_empty_directories: bool,
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_download_buffer_hint() -> usize {
    64 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    // 5 minute timeout for large packages
    300
}

fn default_true() -> bool {
    true
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            temp_dir: None,
            progress_interval_ms: default_progress_interval_ms(),
            download_buffer_hint: default_download_buffer_hint(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            sweep_empty_directories: default_true(),
        }
    }
}

impl UpdaterConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read updater config: {}", path.display()))?;
        let config: UpdaterConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse updater config: {}", path.display()))?;
        config.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    /// Where per-attempt temporary files are created
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.download_buffer_hint == 0 {
            return Err("download_buffer_hint must be greater than zero".to_string());
        }

        if self.connect_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err("HTTP timeouts must be greater than zero".to_string());
        }

        if let Some(dir) = &self.temp_dir {
            if dir.as_os_str().is_empty() {
                return Err("temp_dir cannot be empty; omit it to use the system temp directory".to_string());
            }
        }

        Ok(())
    }
}
