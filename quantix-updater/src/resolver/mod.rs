//! Package resolvers: components that work out where the update package
//! lives and which digests it should have.

mod manifest;

pub use manifest::{ManifestResolver, ManifestSource, ReleaseManifest};

use std::sync::{Arc, Mutex};

use reqwest::Url;
use tracing::info;

use crate::component::{Component, ComponentState, Lifecycle, OperationContext};
use crate::dispatch::Dispatcher;
use crate::error::UpdateError;
use crate::sync::lock;
use crate::verify::ReferenceDigests;

/// Where to fetch the package and how to check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub uri: Url,
    pub digests: ReferenceDigests,
    /// Package size, if the metadata states it
    pub size: Option<u64>,
    pub version: Option<String>,
}

impl ResolvedPackage {
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            digests: ReferenceDigests::default(),
            size: None,
            version: None,
        }
    }

    pub fn with_digests(mut self, digests: ReferenceDigests) -> Self {
        self.digests = digests;
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// A component that resolves the package location.
///
/// After reaching `Succeeded`, `resolved()` must return the package.
pub trait PackageResolver: Component {
    fn resolved(&self) -> Option<ResolvedPackage>;
}

/// Resolver whose answer is known up front.
pub struct StaticResolver {
    lifecycle: Lifecycle,
    source: Mutex<Option<ResolvedPackage>>,
    resolved: Arc<Mutex<Option<ResolvedPackage>>>,
}

impl StaticResolver {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, package: ResolvedPackage) -> Self {
        Self {
            lifecycle: Lifecycle::new("static-resolver", dispatcher),
            source: Mutex::new(Some(package)),
            resolved: Arc::new(Mutex::new(None)),
        }
    }

    /// Replace the package. Only allowed while `Initializing`.
    pub fn set_source(&self, package: ResolvedPackage) -> Result<(), UpdateError> {
        if self.state() != ComponentState::Initializing {
            return Err(UpdateError::InvalidState(
                "resolver source can only be set before start".into(),
            ));
        }
        *lock(&self.source) = Some(package);
        Ok(())
    }
}

impl Component for StaticResolver {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(&self) -> bool {
        let package = lock(&self.source).clone();
        let validation = package
            .as_ref()
            .map(|_| ())
            .ok_or_else(|| "no package configured".to_string());
        let resolved = Arc::clone(&self.resolved);

        self.lifecycle
            .start(validation, move |ctx| publish(ctx, package, resolved))
    }
}

async fn publish(
    ctx: OperationContext,
    package: Option<ResolvedPackage>,
    slot: Arc<Mutex<Option<ResolvedPackage>>>,
) -> anyhow::Result<()> {
    ctx.check_cancelled()?;
    if let Some(package) = package {
        info!(uri = %package.uri, version = ?package.version, "Package resolved");
        *lock(&slot) = Some(package);
    }
    ctx.report_progress(1.0);
    Ok(())
}

impl PackageResolver for StaticResolver {
    fn resolved(&self) -> Option<ResolvedPackage> {
        lock(&self.resolved).clone()
    }
}
