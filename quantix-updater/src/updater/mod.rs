//! # Update orchestrator
//!
//! Drives one update attempt through the pipeline and publishes its state,
//! progress and outcome through the owning [`Dispatcher`].
//!
//! ## Pipeline
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────┐   ┌───────────┐
//! │  Resolve  │──►│   Download   │──►│  Verify  │──►│  Install  │──► Succeeded
//! │ (resolver)│   │ ∥ Back up app│   │ (digests)│   │(installer)│
//! └───────────┘   └──────────────┘   └──────────┘   └─────┬─────┘
//!                                                         │ failed / cancelled
//!                                                         ▼
//!                                                  ┌─────────────┐
//!                                                  │  Roll back  │──► Failed
//!                                                  └─────────────┘
//! ```
//!
//! The downloaded package and the backup live under the configured temp
//! directory and are removed before the attempt reports its final state.

mod pipeline;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::Component;
use crate::config::UpdaterConfig;
use crate::dispatch::Dispatcher;
use crate::error::UpdateError;
use crate::installer::PackageInstaller;
use crate::observe::{Observers, Subscription};
use crate::progress::Progress;
use crate::resolver::PackageResolver;
use crate::sync;
use crate::transport::{DefaultTransport, Transport};

/// State of an update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdaterState {
    Initializing,
    Starting,
    ResolvingPackage,
    DownloadingPackage,
    /// Download finished, backup still running
    BackingUpApplication,
    VerifyingPackage,
    InstallingPackage,
    RestoringApplication,
    Succeeded,
    Failed,
    Cancelled,
    Disposed,
}

impl UpdaterState {
    /// `Succeeded`, `Failed` or `Cancelled`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdaterState::Succeeded | UpdaterState::Failed | UpdaterState::Cancelled
        )
    }

    /// Between `Starting` and a terminal state.
    pub fn is_updating(&self) -> bool {
        matches!(
            self,
            UpdaterState::Starting
                | UpdaterState::ResolvingPackage
                | UpdaterState::DownloadingPackage
                | UpdaterState::BackingUpApplication
                | UpdaterState::VerifyingPackage
                | UpdaterState::InstallingPackage
                | UpdaterState::RestoringApplication
        )
    }
}

impl std::fmt::Display for UpdaterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdaterState::Initializing => "initializing",
            UpdaterState::Starting => "starting",
            UpdaterState::ResolvingPackage => "resolving_package",
            UpdaterState::DownloadingPackage => "downloading_package",
            UpdaterState::BackingUpApplication => "backing_up_application",
            UpdaterState::VerifyingPackage => "verifying_package",
            UpdaterState::InstallingPackage => "installing_package",
            UpdaterState::RestoringApplication => "restoring_application",
            UpdaterState::Succeeded => "succeeded",
            UpdaterState::Failed => "failed",
            UpdaterState::Cancelled => "cancelled",
            UpdaterState::Disposed => "disposed",
        };
        write!(f, "{}", s)
    }
}

/// Change notifications published by the [`Updater`].
#[derive(Debug, Clone, Copy)]
pub enum UpdaterEvent {
    StateChanged(UpdaterState),
    ProgressChanged(Progress),
    /// Bytes received so far and the total, if known
    DownloadProgress { downloaded: u64, total: Option<u64> },
    CancellingChanged(bool),
}

/// Sub-component currently driven by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActiveComponent {
    Resolver,
    Installer,
}

struct Status {
    state: UpdaterState,
    progress: Progress,
    downloaded: u64,
    package_size: Option<u64>,
    cancelling: bool,
    error: Option<Arc<UpdateError>>,
    application_directory: Option<PathBuf>,
    resolver: Option<Arc<dyn PackageResolver>>,
    installer: Option<Arc<dyn PackageInstaller>>,
    active: Option<ActiveComponent>,
}

struct Inner {
    dispatcher: Arc<dyn Dispatcher>,
    config: UpdaterConfig,
    transport: Arc<dyn Transport>,
    status: Mutex<Status>,
    token: CancellationToken,
    observers: Observers<UpdaterEvent>,
}

/// Orchestrates a single update attempt.
///
/// Configure the application directory, resolver and installer, then call
/// [`start`](Updater::start). All events are delivered through the
/// dispatcher given at construction.
pub struct Updater {
    inner: Arc<Inner>,
}

impl Updater {
    /// Create an updater using the default HTTP/file transport.
    pub fn new(dispatcher: Arc<dyn Dispatcher>, config: UpdaterConfig) -> Result<Self, UpdateError> {
        config.validate().map_err(UpdateError::InvalidConfig)?;
        let transport = DefaultTransport::new(&config)
            .map_err(|e| UpdateError::InvalidConfig(format!("{:#}", e)))?;
        Self::with_transport(dispatcher, config, Arc::new(transport))
    }

    /// Create an updater that downloads through `transport`.
    pub fn with_transport(
        dispatcher: Arc<dyn Dispatcher>,
        config: UpdaterConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, UpdateError> {
        config.validate().map_err(UpdateError::InvalidConfig)?;
        Ok(Self {
            inner: Arc::new(Inner {
                dispatcher,
                config,
                transport,
                status: Mutex::new(Status {
                    state: UpdaterState::Initializing,
                    progress: Progress::ZERO,
                    downloaded: 0,
                    package_size: None,
                    cancelling: false,
                    error: None,
                    application_directory: None,
                    resolver: None,
                    installer: None,
                    active: None,
                }),
                token: CancellationToken::new(),
                observers: Observers::new(),
            }),
        })
    }

    pub fn set_application_directory(&self, path: impl Into<PathBuf>) -> Result<(), UpdateError> {
        let path = path.into();
        self.inner
            .configure("application directory", |status| status.application_directory = Some(path))
    }

    pub fn set_package_resolver(&self, resolver: Arc<dyn PackageResolver>) -> Result<(), UpdateError> {
        self.inner
            .configure("package resolver", |status| status.resolver = Some(resolver))
    }

    pub fn set_package_installer(&self, installer: Arc<dyn PackageInstaller>) -> Result<(), UpdateError> {
        self.inner
            .configure("package installer", |status| status.installer = Some(installer))
    }

    pub fn application_directory(&self) -> Option<PathBuf> {
        self.inner.lock().application_directory.clone()
    }

    /// Begin the update.
    ///
    /// Returns false, with no side effects, unless the updater is
    /// `Initializing`, the application directory exists, a resolver and an
    /// installer are set, and a tokio runtime is available. The outcome of
    /// the attempt is reported through state changes, not the return value.
    pub fn start(&self) -> bool {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("Refusing to start update: no async runtime");
                return false;
            }
        };

        let (directory, resolver, installer) = {
            let status = self.inner.lock();
            if status.state != UpdaterState::Initializing {
                debug!(state = %status.state, "Start ignored");
                return false;
            }
            (
                status.application_directory.clone(),
                status.resolver.clone(),
                status.installer.clone(),
            )
        };

        let job = match self.inner.prepare_job(directory, resolver, installer) {
            Ok(job) => job,
            Err(reason) => {
                warn!(reason = %reason, "Refusing to start update");
                return false;
            }
        };

        {
            let mut status = self.inner.lock();
            if status.state != UpdaterState::Initializing {
                return false;
            }
            status.state = UpdaterState::Starting;
        }

        info!(
            app_dir = %job.application_directory.display(),
            temp_dir = %job.temp_root.display(),
            "Update started"
        );
        self.inner.post_event(UpdaterEvent::StateChanged(UpdaterState::Starting));
        runtime.spawn(pipeline::run(Arc::clone(&self.inner), job));
        true
    }

    /// Request cancellation of the running attempt.
    ///
    /// Returns false unless an update is in flight. Repeated calls return
    /// true without further effect.
    pub fn cancel(&self) -> bool {
        let (resolver, installer) = {
            let mut status = self.inner.lock();
            if !status.state.is_updating() {
                return false;
            }
            if status.cancelling {
                return true;
            }
            status.cancelling = true;
            // Under the lock so the pipeline either sees the token or
            // publishes its active component before we read it.
            self.inner.token.cancel();
            match status.active {
                Some(ActiveComponent::Resolver) => (status.resolver.clone(), None),
                Some(ActiveComponent::Installer) => (None, status.installer.clone()),
                None => (None, None),
            }
        };

        info!("Update cancellation requested");
        if let Some(resolver) = resolver {
            resolver.cancel();
        }
        if let Some(installer) = installer {
            installer.cancel();
        }
        self.inner.post_event(UpdaterEvent::CancellingChanged(true));
        true
    }

    /// Stop everything and move to `Disposed`. Safe to call repeatedly.
    ///
    /// An attempt in flight still rolls back and cleans up, but publishes
    /// nothing further.
    pub fn dispose(&self) {
        let (resolver, installer) = {
            let mut status = self.inner.lock();
            if status.state == UpdaterState::Disposed {
                return;
            }
            status.state = UpdaterState::Disposed;
            status.active = None;
            (status.resolver.clone(), status.installer.clone())
        };

        debug!("Updater disposed");
        self.inner.token.cancel();
        if let Some(resolver) = resolver {
            resolver.dispose();
        }
        if let Some(installer) = installer {
            installer.dispose();
        }
        self.inner.post_event(UpdaterEvent::StateChanged(UpdaterState::Disposed));
    }

    /// Wait for a terminal state (or `Disposed`) and return it.
    ///
    /// Returns `Initializing` at once if the updater was never started.
    pub async fn wait_until_finished(&self) -> UpdaterState {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = self.subscribe(move |event| {
            if let UpdaterEvent::StateChanged(state) = event {
                let _ = tx.send(*state);
            }
        });

        loop {
            let state = self.state();
            if state.is_terminal() || matches!(state, UpdaterState::Disposed | UpdaterState::Initializing) {
                return state;
            }
            if rx.recv().await.is_none() {
                return self.state();
            }
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&UpdaterEvent) + Send + Sync + 'static,
    {
        self.inner.observers.subscribe(handler)
    }

    pub fn state(&self) -> UpdaterState {
        self.inner.lock().state
    }

    pub fn progress(&self) -> Progress {
        self.inner.lock().progress
    }

    /// Bytes of the package received so far.
    pub fn downloaded_package_size(&self) -> u64 {
        self.inner.lock().downloaded
    }

    /// Package size, once the transport or resolver exposes it.
    pub fn package_size(&self) -> Option<u64> {
        self.inner.lock().package_size
    }

    pub fn is_updating(&self) -> bool {
        self.state().is_updating()
    }

    pub fn is_cancellable(&self) -> bool {
        self.is_updating()
    }

    pub fn is_cancelling(&self) -> bool {
        self.inner.lock().cancelling
    }

    /// The first error that terminated the attempt. Never set for a
    /// cancelled attempt.
    pub fn error(&self) -> Option<Arc<UpdateError>> {
        self.inner.lock().error.clone()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Status> {
        sync::lock(&self.status)
    }

    fn configure<F>(&self, what: &str, apply: F) -> Result<(), UpdateError>
    where
        F: FnOnce(&mut Status),
    {
        let mut status = self.lock();
        if status.state != UpdaterState::Initializing {
            return Err(UpdateError::InvalidState(format!(
                "{} can only be set before start (state: {})",
                what, status.state
            )));
        }
        apply(&mut status);
        Ok(())
    }

    fn prepare_job(
        &self,
        directory: Option<PathBuf>,
        resolver: Option<Arc<dyn PackageResolver>>,
        installer: Option<Arc<dyn PackageInstaller>>,
    ) -> Result<pipeline::Job, String> {
        let directory = directory
            .filter(|d| !d.as_os_str().to_string_lossy().trim().is_empty())
            .ok_or("application directory is not set")?;
        let resolver = resolver.ok_or("package resolver is not set")?;
        let installer = installer.ok_or("package installer is not set")?;

        if !directory.is_dir() {
            return Err(format!(
                "application directory {} does not exist",
                directory.display()
            ));
        }
        let temp_root = self.config.effective_temp_dir();
        if is_inside(&temp_root, &directory) {
            return Err(format!(
                "temp directory {} lies inside the application directory",
                temp_root.display()
            ));
        }

        Ok(pipeline::Job {
            application_directory: directory,
            resolver,
            installer,
            temp_root,
        })
    }

    fn post<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(&Inner) + Send + 'static,
    {
        let inner = Arc::clone(self);
        self.dispatcher.post(Box::new(move || job(&inner)));
    }

    fn post_event(self: &Arc<Self>, event: UpdaterEvent) {
        self.post(move |inner| inner.observers.notify(&event));
    }

    fn set_active(&self, active: Option<ActiveComponent>) {
        let mut status = self.lock();
        if status.state.is_updating() {
            status.active = active;
        }
    }

    /// Move to the next pipeline state, optionally resetting progress.
    fn enter(self: &Arc<Self>, state: UpdaterState, progress: Option<Progress>) {
        self.post(move |inner| {
            let progress_changed = {
                let mut status = inner.lock();
                if !status.state.is_updating() || status.state == state {
                    return;
                }
                status.state = state;
                match progress {
                    Some(p) if status.progress.differs_from(p) => {
                        status.progress = p;
                        Some(p)
                    }
                    _ => None,
                }
            };

            info!(state = %state, "Update state changed");
            inner.observers.notify(&UpdaterEvent::StateChanged(state));
            if let Some(p) = progress_changed {
                inner.observers.notify(&UpdaterEvent::ProgressChanged(p));
            }
        });
    }

    fn set_progress(self: &Arc<Self>, progress: Progress) {
        self.post(move |inner| {
            {
                let mut status = inner.lock();
                if !status.state.is_updating() || !status.progress.differs_from(progress) {
                    return;
                }
                status.progress = progress;
            }
            inner.observers.notify(&UpdaterEvent::ProgressChanged(progress));
        });
    }

    fn report_download(self: &Arc<Self>, downloaded: u64, total: Option<u64>) {
        self.post(move |inner| {
            let progress = Progress::from_ratio(downloaded, total);
            let progress_changed = {
                let mut status = inner.lock();
                if !status.state.is_updating() {
                    return;
                }
                status.downloaded = downloaded;
                status.package_size = total;
                let changed = status.state == UpdaterState::DownloadingPackage
                    && status.progress.differs_from(progress);
                if changed {
                    status.progress = progress;
                }
                changed
            };

            inner
                .observers
                .notify(&UpdaterEvent::DownloadProgress { downloaded, total });
            if progress_changed {
                inner.observers.notify(&UpdaterEvent::ProgressChanged(progress));
            }
        });
    }

    /// Publish the outcome of the attempt. Runs once, after cleanup.
    fn finish(self: &Arc<Self>, outcome: Result<(), UpdateError>) {
        self.post(move |inner| {
            let (state, was_cancelling, completed) = {
                let mut status = inner.lock();
                if !status.state.is_updating() {
                    return;
                }
                let state = match outcome {
                    Ok(()) => UpdaterState::Succeeded,
                    Err(UpdateError::Cancelled) => UpdaterState::Cancelled,
                    Err(e) => {
                        if status.error.is_none() {
                            status.error = Some(Arc::new(e));
                        }
                        UpdaterState::Failed
                    }
                };
                status.state = state;
                status.active = None;
                let was_cancelling = std::mem::replace(&mut status.cancelling, false);
                let completed = state == UpdaterState::Succeeded
                    && status.progress.differs_from(Progress::COMPLETE);
                if completed {
                    status.progress = Progress::COMPLETE;
                }
                (state, was_cancelling, completed)
            };

            match state {
                UpdaterState::Succeeded => info!("Update completed successfully"),
                UpdaterState::Cancelled => warn!("Update cancelled"),
                _ => {
                    let message = inner
                        .lock()
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_default();
                    error!(error = %message, "Update failed");
                }
            }

            if completed {
                inner.observers.notify(&UpdaterEvent::ProgressChanged(Progress::COMPLETE));
            }
            if was_cancelling {
                inner.observers.notify(&UpdaterEvent::CancellingChanged(false));
            }
            inner.observers.notify(&UpdaterEvent::StateChanged(state));
        });
    }
}

/// Whether `path` is the application directory or lies beneath it.
/// Whether `path` is `directory` or lies below it, once both are made
/// absolute and symlinks resolved.
fn is_inside(path: &Path, directory: &Path) -> bool {
    resolve_path(path).starts_with(resolve_path(directory))
}

/// Canonicalize the longest existing prefix of `path` and append the rest,
/// so paths that do not exist yet still resolve.
fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = std::fs::canonicalize(existing) {
            return missing
                .iter()
                .rev()
                .fold(canonical, |resolved, part| resolved.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}
