//! Command-line argument parsing.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use quantix_updater::{Algorithm, ReferenceDigests};
use quantix_updater_common::LogFormat;

/// qx-update - Quantix application self-updater
#[derive(Parser, Debug)]
#[command(name = "qx-update")]
#[command(about = "qx-update - download, verify and install application updates with rollback")]
#[command(version)]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "QX_UPDATE_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one update attempt against an installed application
    Run(RunArgs),

    /// Check a file against reference digests
    Verify(VerifyArgs),

    /// Print the digest of a file
    Hash(HashArgs),
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Path to configuration file (optional)
    #[arg(short, long, env = "QX_UPDATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory of the installed application
    #[arg(long)]
    pub app_dir: Option<PathBuf>,

    /// Release manifest URL (http, https or file)
    #[arg(long, conflicts_with = "package")]
    pub manifest: Option<String>,

    /// Release channel requested from the manifest server
    #[arg(long, requires = "manifest")]
    pub channel: Option<String>,

    /// Package URI or local path, bypassing the manifest
    #[arg(long)]
    pub package: Option<String>,

    #[command(flatten)]
    pub digests: DigestArgs,

    /// Directory for the downloaded package and the backup
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct VerifyArgs {
    /// File to verify
    pub file: PathBuf,

    #[command(flatten)]
    pub digests: DigestArgs,
}

#[derive(ClapArgs, Debug)]
pub struct HashArgs {
    /// File to hash
    pub file: PathBuf,

    /// Digest algorithm (md5, sha256, sha512)
    #[arg(short, long, default_value = "sha256")]
    pub algorithm: Algorithm,
}

/// Reference digests given on the command line
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct DigestArgs {
    /// Expected MD5 digest (hex)
    #[arg(long)]
    pub md5: Option<String>,

    /// Expected SHA-256 digest (hex)
    #[arg(long)]
    pub sha256: Option<String>,

    /// Expected SHA-512 digest (hex)
    #[arg(long)]
    pub sha512: Option<String>,
}

impl DigestArgs {
    pub fn to_reference(&self) -> ReferenceDigests {
        ReferenceDigests {
            md5: self.md5.clone(),
            sha256: self.sha256.clone(),
            sha512: self.sha512.clone(),
        }
    }
}
