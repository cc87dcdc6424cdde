//! Release manifest resolver
//!
//! Fetches a small JSON document describing the latest release and turns it
//! into a [`ResolvedPackage`].

use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{PackageResolver, ResolvedPackage};
use crate::component::{Component, ComponentState, Lifecycle, OperationContext};
use crate::dispatch::Dispatcher;
use crate::error::UpdateError;
use crate::sync::lock;
use crate::transport::Transport;
use crate::verify::ReferenceDigests;

/// Manifests larger than this are rejected.
const MAX_MANIFEST_BYTES: usize = 1024 * 1024;

/// Release manifest describing the package to install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Version string (semantic versioning)
    pub version: String,

    /// Release channel (dev, beta, stable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Release timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_date: Option<DateTime<Utc>>,

    /// Package location, absolute or relative to the manifest URL
    pub package_url: String,

    /// Size of the package in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,

    /// Reference digests of the package
    #[serde(flatten)]
    pub digests: ReferenceDigests,

    /// Human-readable release notes
    #[serde(default)]
    pub release_notes: String,
}

/// Where to look for the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSource {
    pub manifest_url: Url,
    /// Sent as `?channel=` to HTTP servers
    pub channel: Option<String>,
}

impl ManifestSource {
    pub fn new(manifest_url: Url) -> Self {
        Self {
            manifest_url,
            channel: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// URL actually requested
    fn request_url(&self) -> Url {
        let mut url = self.manifest_url.clone();
        if let Some(channel) = &self.channel {
            if matches!(url.scheme(), "http" | "https") {
                url.query_pairs_mut().append_pair("channel", channel);
            }
        }
        url
    }
}

/// Resolver that reads a [`ReleaseManifest`] through a [`Transport`].
pub struct ManifestResolver {
    lifecycle: Lifecycle,
    transport: Arc<dyn Transport>,
    source: Mutex<Option<ManifestSource>>,
    resolved: Arc<Mutex<Option<ResolvedPackage>>>,
    manifest: Arc<Mutex<Option<ReleaseManifest>>>,
}

impl ManifestResolver {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, transport: Arc<dyn Transport>) -> Self {
        Self {
            lifecycle: Lifecycle::new("manifest-resolver", dispatcher),
            transport,
            source: Mutex::new(None),
            resolved: Arc::new(Mutex::new(None)),
            manifest: Arc::new(Mutex::new(None)),
        }
    }

    /// Set where to look. Only allowed while `Initializing`.
    pub fn set_source(&self, source: ManifestSource) -> Result<(), UpdateError> {
        if self.state() != ComponentState::Initializing {
            return Err(UpdateError::InvalidState(
                "resolver source can only be set before start".into(),
            ));
        }
        *lock(&self.source) = Some(source);
        Ok(())
    }

    /// The manifest fetched by the last successful run
    pub fn manifest(&self) -> Option<ReleaseManifest> {
        lock(&self.manifest).clone()
    }
}

impl Component for ManifestResolver {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn start(&self) -> bool {
        let source = lock(&self.source).clone();
        let validation = source
            .as_ref()
            .map(|_| ())
            .ok_or_else(|| "no manifest source configured".to_string());

        let transport = Arc::clone(&self.transport);
        let resolved = Arc::clone(&self.resolved);
        let manifest = Arc::clone(&self.manifest);

        self.lifecycle.start(validation, move |ctx| {
            fetch_manifest(ctx, source, transport, resolved, manifest)
        })
    }
}

async fn fetch_manifest(
    ctx: OperationContext,
    source: Option<ManifestSource>,
    transport: Arc<dyn Transport>,
    resolved: Arc<Mutex<Option<ResolvedPackage>>>,
    manifest_slot: Arc<Mutex<Option<ReleaseManifest>>>,
) -> anyhow::Result<()> {
    let source = source.ok_or_else(|| anyhow::anyhow!("no manifest source configured"))?;
    let url = source.request_url();
    info!(url = %url, "Fetching release manifest");

    let stream = tokio::select! {
        biased;
        _ = ctx.token().cancelled() => return Err(UpdateError::Cancelled.into()),
        opened = transport.open(&url) => opened.context("Failed to fetch release manifest")?,
    };
    ctx.report_progress(0.5);

    let body = tokio::select! {
        biased;
        _ = ctx.token().cancelled() => return Err(UpdateError::Cancelled.into()),
        body = stream.collect_limited(MAX_MANIFEST_BYTES) => body?,
    };

    let manifest: ReleaseManifest =
        serde_json::from_slice(&body).context("Failed to parse manifest JSON")?;
    let package = package_from_manifest(&source, &manifest)?;

    info!(
        version = %manifest.version,
        package = %package.uri,
        digests = package.digests.expected().len(),
        "Manifest fetched successfully"
    );

    *lock(&manifest_slot) = Some(manifest);
    *lock(&resolved) = Some(package);
    ctx.report_progress(1.0);
    Ok(())
}

impl PackageResolver for ManifestResolver {
    fn resolved(&self) -> Option<ResolvedPackage> {
        lock(&self.resolved).clone()
    }
}

fn package_from_manifest(
    source: &ManifestSource,
    manifest: &ReleaseManifest,
) -> anyhow::Result<ResolvedPackage> {
    if manifest.version.trim().is_empty() {
        bail!("Manifest has no version");
    }
    if manifest.package_url.trim().is_empty() {
        bail!("Manifest has no package_url");
    }

    if let (Some(wanted), Some(actual)) = (&source.channel, &manifest.channel) {
        if wanted != actual {
            warn!(wanted = %wanted, actual = %actual, "Manifest channel differs from requested channel");
        }
    }

    let uri = source
        .manifest_url
        .join(manifest.package_url.trim())
        .with_context(|| format!("Invalid package_url '{}'", manifest.package_url))?;

    let mut package = ResolvedPackage::new(uri)
        .with_digests(manifest.digests.clone())
        .with_version(manifest.version.clone());
    package.size = manifest.size_bytes;
    Ok(package)
}
