//! Configuration for the `run` command.
//!
//! ```yaml
//! application_directory: /opt/quantix/app
//! manifest_url: https://updates.example.com/app/latest.json
//! channel: stable
//! updater:
//!   temp_dir: /var/tmp/quantix
//!   progress_interval_ms: 250
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use quantix_updater::{parse_uri, ReferenceDigests, UpdaterConfig, Url};
use serde::Deserialize;

use crate::cli::RunArgs;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of the installed application
    pub application_directory: Option<PathBuf>,
    /// Release manifest URL
    pub manifest_url: Option<String>,
    /// Release channel passed to the manifest server
    pub channel: Option<String>,
    /// Direct package URI, used instead of a manifest
    pub package: Option<String>,
    /// Updater tuning
    pub updater: UpdaterConfig,
}

/// Where the package comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    Manifest { url: Url, channel: Option<String> },
    Package { uri: Url, digests: ReferenceDigests },
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.updater.validate().map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &RunArgs) -> Self {
        if let Some(ref dir) = args.app_dir {
            self.application_directory = Some(dir.clone());
        }

        // A source on the command line replaces the configured one entirely
        if let Some(ref manifest) = args.manifest {
            self.manifest_url = Some(manifest.clone());
            self.channel = args.channel.clone();
            self.package = None;
        }

        if let Some(ref package) = args.package {
            self.package = Some(package.clone());
            self.manifest_url = None;
            self.channel = None;
        }

        if let Some(ref temp_dir) = args.temp_dir {
            self.updater.temp_dir = Some(temp_dir.clone());
        }

        self
    }

    /// The package source, with `digests` applied to direct packages.
    pub fn source(&self, digests: ReferenceDigests) -> Result<PackageSource> {
        match (&self.manifest_url, &self.package) {
            (Some(manifest), None) => Ok(PackageSource::Manifest {
                url: parse_uri(manifest)?,
                channel: self.channel.clone(),
            }),
            (None, Some(package)) => Ok(PackageSource::Package {
                uri: parse_uri(package)?,
                digests,
            }),
            (Some(_), Some(_)) => bail!("Configure either a manifest URL or a package, not both"),
            (None, None) => bail!("No update source: pass --manifest or --package"),
        }
    }

    pub fn application_directory(&self) -> Result<&Path> {
        self.application_directory
            .as_deref()
            .context("No application directory: pass --app-dir")
    }
}
