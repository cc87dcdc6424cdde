//! The stages of one update attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{ActiveComponent, Inner, UpdaterState};
use crate::component::{start_and_wait, Component, ComponentEvent, ComponentState};
use crate::error::{is_cancellation, UpdateError, WaitError};
use crate::fsutil::{self, CopyMode, CopyStats};
use crate::installer::PackageInstaller;
use crate::observe::Subscription;
use crate::progress::Progress;
use crate::resolver::{PackageResolver, ResolvedPackage};
use crate::transport::PackageStream;
use crate::verify;

/// Everything an attempt needs, captured at start.
pub(super) struct Job {
    pub application_directory: PathBuf,
    pub resolver: Arc<dyn PackageResolver>,
    pub installer: Arc<dyn PackageInstaller>,
    pub temp_root: PathBuf,
}

/// Temporary paths owned by the attempt
#[derive(Default)]
struct Scratch {
    package_file: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
}

/// Run the attempt to completion, clean up, then publish the outcome.
pub(super) async fn run(inner: Arc<Inner>, job: Job) {
    let mut scratch = Scratch::default();
    let outcome = execute(&inner, &job, &mut scratch).await;

    match &outcome {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => info!("Update attempt cancelled"),
        Err(e) => error!(error = %e, "Update attempt failed"),
    }

    cleanup(&scratch).await;
    inner.finish(outcome);
}

async fn execute(inner: &Arc<Inner>, job: &Job, scratch: &mut Scratch) -> Result<(), UpdateError> {
    check_cancelled(inner)?;

    inner.enter(UpdaterState::ResolvingPackage, Some(Progress::ZERO));
    let package = resolve(inner, job.resolver.as_ref()).await?;
    check_cancelled(inner)?;

    fsutil::ensure_dir(&job.temp_root)
        .await
        .map_err(|e| UpdateError::Download(format!("{:#}", e)))?;
    let package_file = fsutil::unique_temp_path(&job.temp_root, "qx-update-package", ".pkg");
    let backup_dir = fsutil::unique_temp_path(&job.temp_root, "qx-update-backup", "");
    scratch.package_file = Some(package_file.clone());
    scratch.backup_dir = Some(backup_dir.clone());

    download_and_backup(inner, job, &package, &package_file, &backup_dir).await?;
    check_cancelled(inner)?;

    inner.enter(UpdaterState::VerifyingPackage, Some(Progress::UNKNOWN));
    verify_package(&package, &package_file).await?;
    check_cancelled(inner)?;

    inner.enter(UpdaterState::InstallingPackage, Some(Progress::ZERO));
    if let Err(e) = install(inner, job, &package_file).await {
        rollback(inner, job, &backup_dir).await;
        return Err(e);
    }

    Ok(())
}

fn check_cancelled(inner: &Inner) -> Result<(), UpdateError> {
    if inner.token.is_cancelled() {
        Err(UpdateError::Cancelled)
    } else {
        Ok(())
    }
}

/// Start `component` and wait until it has really stopped.
///
/// The wait itself is never abandoned: cancellation is forwarded to the
/// component instead, so nothing is left running behind the next stage.
async fn drive<C>(component: &C, token: &CancellationToken) -> Result<ComponentState, WaitError>
where
    C: Component + ?Sized,
{
    if component.state() == ComponentState::Initializing && !component.start() {
        return Err(WaitError::StartRefused);
    }
    if token.is_cancelled() {
        component.cancel();
    }
    start_and_wait(component, &CancellationToken::new()).await
}

/// Mirror a component's progress as the updater's own.
fn forward_progress<C>(inner: &Arc<Inner>, component: &C) -> Subscription
where
    C: Component + ?Sized,
{
    let weak = Arc::downgrade(inner);
    component.subscribe(Box::new(move |event: &ComponentEvent| {
        if let ComponentEvent::ProgressChanged(progress) = event {
            if let Some(inner) = weak.upgrade() {
                inner.set_progress(*progress);
            }
        }
    }))
}

#[instrument(skip_all)]
async fn resolve(inner: &Arc<Inner>, resolver: &dyn PackageResolver) -> Result<ResolvedPackage, UpdateError> {
    let _progress = forward_progress(inner, resolver);
    inner.set_active(Some(ActiveComponent::Resolver));
    let outcome = drive(resolver, &inner.token).await;
    inner.set_active(None);

    match outcome {
        Ok(ComponentState::Succeeded) => {}
        Ok(ComponentState::Cancelled) => return Err(UpdateError::Cancelled),
        Ok(_) if inner.token.is_cancelled() => return Err(UpdateError::Cancelled),
        Ok(state) => {
            return Err(UpdateError::Resolution(format!(
                "resolver stopped in state {:?}",
                state
            )))
        }
        Err(WaitError::Failed(e)) => return Err(UpdateError::Resolution(format!("{:#}", e))),
        Err(e) => return Err(UpdateError::Resolution(e.to_string())),
    }

    let package = resolver.resolved().ok_or_else(|| {
        UpdateError::Resolution("resolver did not expose a package location".to_string())
    })?;

    info!(
        uri = %package.uri,
        version = ?package.version,
        size = ?package.size,
        digests = package.digests.expected().len(),
        "Package resolved"
    );
    Ok(package)
}

/// Download the package while the application is backed up alongside.
/// Returns once both have finished.
async fn download_and_backup(
    inner: &Arc<Inner>,
    job: &Job,
    package: &ResolvedPackage,
    package_file: &Path,
    backup_dir: &Path,
) -> Result<(), UpdateError> {
    inner.enter(UpdaterState::DownloadingPackage, Some(Progress::ZERO));

    let backup_token = inner.token.child_token();
    let backup = tokio::spawn(backup_application(
        job.application_directory.clone(),
        backup_dir.to_path_buf(),
        backup_token.clone(),
    ));

    let downloaded = download(inner, package, package_file).await;
    if downloaded.is_err() {
        backup_token.cancel();
    } else if !backup.is_finished() {
        info!("Download finished, waiting for application backup");
        inner.enter(UpdaterState::BackingUpApplication, Some(Progress::UNKNOWN));
    }

    let backed_up = match backup.await {
        Ok(result) => result,
        Err(e) => Err(UpdateError::Backup(format!("backup task failed: {}", e))),
    };

    downloaded?;
    backed_up?;
    Ok(())
}

#[instrument(skip_all, fields(uri = %package.uri))]
async fn download(inner: &Arc<Inner>, package: &ResolvedPackage, destination: &Path) -> Result<u64, UpdateError> {
    let opened = tokio::select! {
        biased;
        _ = inner.token.cancelled() => return Err(UpdateError::Cancelled),
        opened = inner.transport.open(&package.uri) => opened,
    };
    let PackageStream { content_length, mut body } =
        opened.map_err(|e| UpdateError::Download(format!("{:#}", e)))?;
    let total = content_length.or(package.size);

    info!(
        destination = %destination.display(),
        content_length = ?content_length,
        "Downloading package"
    );

    let mut file = tokio::fs::File::create(destination).await.map_err(|e| {
        UpdateError::Download(format!("Failed to create {}: {}", destination.display(), e))
    })?;

    let interval = inner.config.progress_interval();
    let mut downloaded = 0u64;
    let mut last_report = Instant::now();
    inner.report_download(0, total);

    loop {
        let next = tokio::select! {
            biased;
            _ = inner.token.cancelled() => return Err(UpdateError::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk
            .map_err(|e| UpdateError::Download(format!("Error reading package stream: {}", e)))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| UpdateError::Download(format!("Failed to write package: {}", e)))?;
        downloaded += chunk.len() as u64;

        if last_report.elapsed() >= interval {
            inner.report_download(downloaded, total);
            last_report = Instant::now();
        }
        check_cancelled(inner)?;
    }

    file.flush()
        .await
        .map_err(|e| UpdateError::Download(format!("Failed to write package: {}", e)))?;
    inner.report_download(downloaded, total);

    if let Some(expected) = content_length {
        if downloaded != expected {
            return Err(UpdateError::Download(format!(
                "Truncated download: received {} of {} bytes",
                downloaded, expected
            )));
        }
    }

    info!(bytes = downloaded, "Package downloaded");
    Ok(downloaded)
}

#[instrument(skip_all, fields(source = %source.display()))]
async fn backup_application(
    source: PathBuf,
    backup_dir: PathBuf,
    token: CancellationToken,
) -> Result<CopyStats, UpdateError> {
    info!(backup = %backup_dir.display(), "Backing up application");

    let stats = fsutil::copy_tree(&source, &backup_dir, CopyMode::AbortOnError, Some(&token))
        .await
        .map_err(|e| {
            if is_cancellation(&e) {
                UpdateError::Cancelled
            } else {
                UpdateError::Backup(format!("{:#}", e))
            }
        })?;

    info!(files = stats.files, bytes = stats.bytes, "Application backup complete");
    Ok(stats)
}

#[instrument(skip_all)]
async fn verify_package(package: &ResolvedPackage, package_file: &Path) -> Result<(), UpdateError> {
    if package.digests.is_empty() {
        warn!("No reference digests supplied, skipping integrity check");
        return Ok(());
    }

    let digests = package.digests.clone();
    let path = package_file.to_path_buf();
    let verification = tokio::task::spawn_blocking(move || verify::verify_file(&path, &digests))
        .await
        .map_err(|e| UpdateError::Verification(format!("verification task failed: {}", e)))?;

    if !verification.is_verified() {
        let summary = verification.failure_summary();
        error!(failures = %summary, "Package verification failed");
        return Err(UpdateError::Verification(summary));
    }

    let algorithms: Vec<&str> = verification.checks.iter().map(|c| c.algorithm.name()).collect();
    info!(algorithms = ?algorithms, "Package verified");
    Ok(())
}

#[instrument(skip_all)]
async fn install(inner: &Arc<Inner>, job: &Job, package_file: &Path) -> Result<(), UpdateError> {
    let installer = job.installer.as_ref();
    installer
        .configure(package_file, &job.application_directory)
        .map_err(|e| UpdateError::Installation(e.to_string()))?;

    let _progress = forward_progress(inner, installer);
    inner.set_active(Some(ActiveComponent::Installer));
    let outcome = drive(installer, &inner.token).await;
    inner.set_active(None);

    match outcome {
        Ok(ComponentState::Succeeded) => {
            info!(files = installer.installed_file_paths().len(), "Package installed");
            Ok(())
        }
        Ok(ComponentState::Cancelled) => Err(UpdateError::Cancelled),
        Ok(_) if inner.token.is_cancelled() => Err(UpdateError::Cancelled),
        Ok(state) => Err(UpdateError::Installation(format!(
            "installer stopped in state {:?}",
            state
        ))),
        Err(WaitError::Failed(e)) => Err(UpdateError::Installation(format!("{:#}", e))),
        Err(e) => Err(UpdateError::Installation(e.to_string())),
    }
}

/// Undo a failed or cancelled install. Never fails; problems are logged.
#[instrument(skip_all)]
async fn rollback(inner: &Arc<Inner>, job: &Job, backup_dir: &Path) {
    inner.enter(UpdaterState::RestoringApplication, Some(Progress::UNKNOWN));

    let app_dir = &job.application_directory;
    let installed = job.installer.installed_file_paths();
    warn!(
        installed = installed.len(),
        backup = %backup_dir.display(),
        "Rolling back installation"
    );

    let removal = fsutil::remove_paths_best_effort(&installed, app_dir).await;
    debug!(
        removed = removal.removed,
        skipped = removal.skipped,
        failed = removal.failed,
        "Installed files removed"
    );

    match fsutil::copy_tree(backup_dir, app_dir, CopyMode::ContinueOnError, None).await {
        Ok(stats) if stats.failures > 0 => warn!(
            restored = stats.files,
            failures = stats.failures,
            "Application partially restored"
        ),
        Ok(stats) => info!(restored = stats.files, "Application restored from backup"),
        Err(e) => error!(error = %format!("{:#}", e), "Failed to restore application"),
    }

    if inner.config.sweep_empty_directories {
        let swept = fsutil::sweep_empty_dirs(app_dir, backup_dir).await;
        if swept > 0 {
            debug!(directories = swept, "Removed directories created by the installer");
        }
    }
}

/// Delete the package file and the backup. Failures are only logged.
async fn cleanup(scratch: &Scratch) {
    if let Some(file) = &scratch.package_file {
        fsutil::remove_file_best_effort(file).await;
    }
    if let Some(dir) = &scratch.backup_dir {
        fsutil::remove_tree_best_effort(dir).await;
    }
    debug!("Temporary files cleaned up");
}
