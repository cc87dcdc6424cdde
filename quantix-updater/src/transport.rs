//! Byte transport for package downloads.
//!
//! `http`/`https` go through reqwest; `file` URLs are streamed from disk so
//! packages can be served from a mounted share or a test fixture.

use std::io;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::Url;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::UpdaterConfig;

/// A package body being received.
pub struct PackageStream {
    /// Total size, when the source exposes it
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl PackageStream {
    /// Read the whole body into memory, refusing anything over `limit` bytes.
    pub async fn collect_limited(mut self, limit: usize) -> Result<Vec<u8>> {
        if let Some(len) = self.content_length {
            if len > limit as u64 {
                bail!("Body of {} bytes exceeds the {} byte limit", len, limit);
            }
        }

        let mut data = Vec::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk.context("Error reading response chunk")?;
            if data.len() + chunk.len() > limit {
                bail!("Body exceeds the {} byte limit", limit);
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }
}

/// Opens a byte stream for a URI.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, uri: &Url) -> Result<PackageStream>;
}

/// HTTP(S) via reqwest plus local `file` URLs.
pub struct DefaultTransport {
    client: reqwest::Client,
    buffer_size: usize,
}

impl DefaultTransport {
    /// Create a transport using the timeouts from `config`.
    pub fn new(config: &UpdaterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("quantix-updater/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            buffer_size: config.download_buffer_hint,
        })
    }

    async fn open_http(&self, uri: &Url) -> Result<PackageStream> {
        let response = self
            .client
            .get(uri.clone())
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", uri))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Server returned error {}: {}", status, body);
        }

        let content_length = response.content_length();
        debug!(uri = %uri, content_length = ?content_length, "HTTP stream opened");

        let body = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();

        Ok(PackageStream { content_length, body })
    }

    async fn open_file(&self, uri: &Url) -> Result<PackageStream> {
        let path = uri
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("Invalid file URL: {}", uri))?;

        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let content_length = file.metadata().await.ok().map(|m| m.len());
        debug!(path = %path.display(), content_length = ?content_length, "File stream opened");

        let body = ReaderStream::with_capacity(file, self.buffer_size).boxed();
        Ok(PackageStream { content_length, body })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn open(&self, uri: &Url) -> Result<PackageStream> {
        info!(uri = %uri, "Opening package stream");
        match uri.scheme() {
            "http" | "https" => self.open_http(uri).await,
            "file" => self.open_file(uri).await,
            other => bail!("Unsupported URI scheme '{}'", other),
        }
    }
}

/// Parse a URI, accepting bare absolute paths as `file` URLs.
pub fn parse_uri(value: &str) -> Result<Url> {
    let value = value.trim();
    if value.starts_with('/') {
        return Url::from_file_path(value)
            .map_err(|_| anyhow::anyhow!("Invalid package path: {}", value));
    }
    Url::parse(value).with_context(|| format!("Invalid package URI: {}", value))
}
