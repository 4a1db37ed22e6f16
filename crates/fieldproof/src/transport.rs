//! Upload transport.
//!
//! [`Transport`] is the boundary the upload orchestrator sends through.
//! [`HttpTransport`] implements it as one `PUT {endpoint}/artifacts/{id}` per
//! artifact, with the payload as the body and the manifest as compact JSON in
//! the `X-Artifact-Manifest` header.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::artifact::{ArtifactManifest, MediaPayload};
use crate::error::{Error, Result};

/// Header carrying the artifact manifest.
pub const MANIFEST_HEADER: &str = "X-Artifact-Manifest";

/// The remote store boundary.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// The name of this transport (for logging).
    fn name(&self) -> &'static str;

    /// Send one artifact. `Ok` means the remote store accepted it.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer fails, times out, or is rejected.
    async fn send(&self, payload: &MediaPayload, manifest: &ArtifactManifest) -> Result<()>;
}

/// HTTP implementation of [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport for `endpoint` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// The URL an artifact is sent to.
    #[must_use]
    pub fn artifact_url(&self, id: &str) -> String {
        format!("{}/artifacts/{}", self.endpoint, id)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, payload: &MediaPayload, manifest: &ArtifactManifest) -> Result<()> {
        let url = self.artifact_url(&manifest.id);
        let manifest_json = serde_json::to_string(manifest)?;

        debug!("PUT {} ({} bytes)", url, payload.len());
        let response = self
            .client
            .put(&url)
            .header(CONTENT_TYPE, payload.mime_type.as_str())
            .header(MANIFEST_HEADER, manifest_json)
            .body(payload.bytes.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout {
                        operation: format!("upload of {}", manifest.id),
                    }
                } else {
                    Error::transport(format!("upload of {} failed: {e}", manifest.id))
                }
            })?;

        response
            .error_for_status()
            .map_err(|e| Error::transport(format!("upload of {} rejected: {e}", manifest.id)))?;
        Ok(())
    }
}

/// Stand-in [`Transport`] for hosts without an upload endpoint.
///
/// Lets a queue be opened for local reads; every send fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait::async_trait]
impl Transport for Unconfigured {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn send(&self, _payload: &MediaPayload, manifest: &ArtifactManifest) -> Result<()> {
        Err(Error::transport(format!(
            "no upload endpoint configured for {}",
            manifest.id
        )))
    }
}
