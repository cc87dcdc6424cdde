//! # qx-update
//!
//! Command-line host for the Quantix self-updater. Drives one update
//! attempt against an installed application, or checks package files.
//!
//! ## Usage
//! ```bash
//! qx-update run --app-dir /opt/app --manifest https://updates.example.com/app/latest.json
//! qx-update run --config /etc/quantix/update.yaml
//! qx-update verify app-2.0.zip --sha256 3b1f...
//! qx-update hash app-2.0.zip --algorithm sha512
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use quantix_updater::verify::compute_digest;
use quantix_updater::{
    verify_file, ArchiveInstaller, DefaultTransport, Dispatcher, EventLoop, ManifestResolver,
    ManifestSource, PackageResolver, ResolvedPackage, StaticResolver, Updater, UpdaterEvent,
    UpdaterState,
};
use tracing::{debug, error, info, warn};

mod cli;
mod config;

use cli::{Args, Command, HashArgs, RunArgs, VerifyArgs};
use config::{Config, PackageSource};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    quantix_updater_common::init_logging(&args.log_level, args.log_format)?;

    match args.command {
        Command::Run(run_args) => run(run_args).await,
        Command::Verify(verify_args) => verify(verify_args).await,
        Command::Hash(hash_args) => hash(hash_args).await,
    }
}

async fn run(args: RunArgs) -> Result<ExitCode> {
    info!(version = env!("CARGO_PKG_VERSION"), "Starting qx-update");

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => {
                info!(config_path = %path.display(), "Configuration loaded");
                cfg
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to load configuration");
                return Err(e);
            }
        },
        None => Config::default(),
    }
    .with_cli_overrides(&args);

    let app_dir = config.application_directory()?.to_path_buf();
    let source = config.source(args.digests.to_reference())?;

    let dispatcher: Arc<dyn Dispatcher> = EventLoop::spawn();
    let updater = Updater::new(dispatcher.clone(), config.updater.clone())?;

    let resolver: Arc<dyn PackageResolver> = match source {
        PackageSource::Manifest { url, channel } => {
            info!(manifest = %url, channel = ?channel, "Resolving package from manifest");
            let transport = Arc::new(DefaultTransport::new(&config.updater)?);
            let resolver = ManifestResolver::new(dispatcher.clone(), transport);
            let mut source = ManifestSource::new(url);
            if let Some(channel) = channel {
                source = source.with_channel(channel);
            }
            resolver.set_source(source)?;
            Arc::new(resolver)
        }
        PackageSource::Package { uri, digests } => {
            info!(package = %uri, digests = digests.expected().len(), "Using package directly");
            let package = ResolvedPackage::new(uri).with_digests(digests);
            Arc::new(StaticResolver::new(dispatcher.clone(), package))
        }
    };

    updater.set_application_directory(&app_dir)?;
    updater.set_package_resolver(resolver)?;
    updater.set_package_installer(Arc::new(ArchiveInstaller::new(dispatcher)))?;

    let _events = updater.subscribe(log_event);

    if !updater.start() {
        error!(app_dir = %app_dir.display(), "Update could not be started");
        return Ok(ExitCode::FAILURE);
    }

    let state = tokio::select! {
        state = updater.wait_until_finished() => state,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling update");
            updater.cancel();
            updater.wait_until_finished().await
        }
    };

    match state {
        UpdaterState::Succeeded => {
            info!(
                bytes = updater.downloaded_package_size(),
                "Application updated"
            );
            Ok(ExitCode::SUCCESS)
        }
        UpdaterState::Cancelled => {
            warn!("Update cancelled, application restored");
            Ok(ExitCode::from(130))
        }
        other => {
            let reason = updater
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| other.to_string());
            error!(state = %other, error = %reason, "Update did not complete");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn log_event(event: &UpdaterEvent) {
    match event {
        UpdaterEvent::StateChanged(state) => info!(state = %state, "Update state changed"),
        UpdaterEvent::ProgressChanged(progress) => match progress.value() {
            Some(value) => debug!(percent = %format!("{:.1}", value * 100.0), "Progress"),
            None => debug!("Progress indeterminate"),
        },
        UpdaterEvent::DownloadProgress { downloaded, total } => {
            debug!(downloaded = downloaded, total = ?total, "Download progress")
        }
        UpdaterEvent::CancellingChanged(true) => info!("Cancelling update"),
        UpdaterEvent::CancellingChanged(false) => {}
    }
}

async fn verify(args: VerifyArgs) -> Result<ExitCode> {
    let digests = args.digests.to_reference();
    if digests.is_empty() {
        anyhow::bail!("No reference digests given: pass --md5, --sha256 or --sha512");
    }

    let path = args.file.clone();
    let verification = tokio::task::spawn_blocking(move || verify_file(&path, &digests))
        .await
        .context("Verification task failed")?;

    for check in &verification.checks {
        let outcome = match (&check.actual, &check.error) {
            (_, Some(err)) => format!("ERROR ({})", err),
            (Some(_), None) if check.matched => "OK".to_string(),
            (Some(actual), None) => format!("MISMATCH (got {})", actual),
            (None, None) => "NOT COMPUTED".to_string(),
        };
        println!("{:<7} {}", check.algorithm.name(), outcome);
    }

    if verification.is_verified() {
        info!(file = %args.file.display(), "Package verified");
        Ok(ExitCode::SUCCESS)
    } else {
        error!(file = %args.file.display(), failures = %verification.failure_summary(), "Verification failed");
        Ok(ExitCode::FAILURE)
    }
}

async fn hash(args: HashArgs) -> Result<ExitCode> {
    let path = args.file.clone();
    let algorithm = args.algorithm;
    let digest = tokio::task::spawn_blocking(move || compute_digest(&path, algorithm))
        .await
        .context("Hash task failed")?
        .with_context(|| format!("Failed to hash {}", args.file.display()))?;

    println!("{}  {}", digest, args.file.display());
    Ok(ExitCode::SUCCESS)
}
