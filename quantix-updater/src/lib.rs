//! # Quantix Updater
//!
//! Self-update orchestration for installed applications.
//!
//! An [`Updater`] takes an application directory, a [`PackageResolver`] and
//! a [`PackageInstaller`], and drives one update attempt:
//!
//! - Resolve the package location and its reference digests
//! - Download the package while backing up the application directory
//! - Verify MD5 / SHA-256 / SHA-512 digests
//! - Install, rolling back from the backup if installation fails
//! - Remove the temporary package and backup
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                  Updater                    │
//! │   state · progress · cancel · dispose       │
//! └───────┬──────────────────────────┬──────────┘
//!         │ Component contract       │ Transport
//!         ▼                          ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │ PackageResolver   │     │ DefaultTransport  │
//! │ PackageInstaller  │     │ (http, https,     │
//! │  (Lifecycle)      │     │  file)            │
//! └─────────┬─────────┘     └───────────────────┘
//!           │ post()
//!           ▼
//! ┌───────────────────┐
//! │    Dispatcher     │  owning context for state
//! │ (EventLoop, ...)  │  changes and callbacks
//! └───────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quantix_updater::{
//!     ArchiveInstaller, EventLoop, ManifestResolver, ManifestSource, Updater, UpdaterConfig,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dispatcher = EventLoop::spawn();
//!     let config = UpdaterConfig::default();
//!     let updater = Updater::new(dispatcher.clone(), config.clone())?;
//!
//!     let transport = Arc::new(quantix_updater::DefaultTransport::new(&config)?);
//!     let resolver = Arc::new(ManifestResolver::new(dispatcher.clone(), transport));
//!     resolver.set_source(ManifestSource::new("https://updates.example.com/app/latest.json".parse()?))?;
//!
//!     updater.set_application_directory("/opt/app")?;
//!     updater.set_package_resolver(resolver)?;
//!     updater.set_package_installer(Arc::new(ArchiveInstaller::new(dispatcher)))?;
//!
//!     updater.start();
//!     println!("finished: {}", updater.wait_until_finished().await);
//!     Ok(())
//! }
//! ```

pub mod component;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fsutil;
pub mod installer;
pub mod observe;
pub mod progress;
pub mod resolver;
pub mod transport;
pub mod updater;
pub mod verify;
mod sync;

pub use component::{start_and_wait, Component, ComponentEvent, ComponentState, Lifecycle};
pub use config::UpdaterConfig;
pub use dispatch::{Dispatcher, EventLoop, ImmediateDispatcher};
pub use error::{UpdateError, WaitError};
pub use installer::{ArchiveFormat, ArchiveInstaller, PackageInstaller};
pub use observe::{Observers, Subscription};
pub use progress::Progress;
pub use resolver::{
    ManifestResolver, ManifestSource, PackageResolver, ReleaseManifest, ResolvedPackage,
    StaticResolver,
};
pub use transport::{parse_uri, DefaultTransport, PackageStream, Transport};
pub use updater::{Updater, UpdaterEvent, UpdaterState};
pub use verify::{verify_file, Algorithm, ReferenceDigests, Verification};

/// Re-exported so callers can name the URL type used throughout the API.
pub use reqwest::Url;
