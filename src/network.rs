//! Generic HTTP transport primitive used by the pipeline for precheck,
//! chunk, and merge requests.
//!
//! The adapter only transports — it never retries and never classifies
//! recoverability itself; callers run the response or error through
//! [`crate::error_center::ErrorCenter`]. Chunk bodies are streamed
//! straight from disk with `reqwest::Body::wrap_stream` instead of
//! buffering the whole chunk in memory first. [`NetworkAdapter`] is the
//! narrow interface the pipeline actually drives, object-safe so tests
//! can substitute an in-process mock for [`ReqwestNetworkAdapter`].

use crate::config::UploaderConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Body, Client};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, TransportError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Precheck response shapes: exists (instant upload), partial (some
/// chunks already received), or new (upload everything).
#[derive(Debug, Clone)]
pub enum PrecheckOutcome {
    Exists { url: String },
    Partial { upload_id: String, received_chunks: Vec<usize> },
    New { upload_id: String },
}

/// A chunk body, boxed so it can cross the object-safe trait boundary.
/// `Box<dyn AsyncRead>` is `Unpin` regardless of the boxed type, which
/// is what `tokio_util::io::ReaderStream` requires.
pub type ChunkReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Per-request options carried from [`UploaderConfig`]: custom headers
/// merged onto every outgoing request, the request timeout, and whether
/// the adapter should send credentials (cookies) along with the request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub with_credentials: bool,
}

impl From<&UploaderConfig> for RequestOptions {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            headers: config.headers.clone(),
            timeout: config.timeout,
            with_credentials: config.with_credentials,
        }
    }
}

/// Narrow external-collaborator interface the pipeline drives. A
/// platform adapter (browser fetch, native HTTP stack) implements this
/// the same way a storage adapter implements [`crate::storage::StorageAdapter`].
#[async_trait]
pub trait NetworkAdapter: Send + Sync {
    async fn precheck(
        &self,
        check_endpoint: &str,
        name: &str,
        size: u64,
        mime_type: Option<&str>,
        fingerprint: &str,
        opts: &RequestOptions,
    ) -> Result<PrecheckOutcome, TransportError>;

    #[allow(clippy::too_many_arguments)]
    async fn upload_chunk(
        &self,
        endpoint: &str,
        upload_id: &str,
        fingerprint: &str,
        chunk_index: usize,
        total_chunks: usize,
        len: u64,
        reader: ChunkReader,
        opts: &RequestOptions,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportError>;

    async fn merge(
        &self,
        merge_endpoint: &str,
        upload_id: &str,
        fingerprint: &str,
        name: &str,
        total_chunks: usize,
        opts: &RequestOptions,
    ) -> Result<String, TransportError>;

    fn network_quality(&self) -> NetworkQuality;
}

/// Default `reqwest`-based adapter.
pub struct ReqwestNetworkAdapter {
    client: Client,
}

impl ReqwestNetworkAdapter {
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }

    /// Builds a client from the uploader configuration: a fixed
    /// connect-phase timeout plus a cookie jar enabled only when
    /// `with_credentials` is set, matching a browser `fetch`'s
    /// `credentials: include` behavior.
    pub fn from_config(config: &UploaderConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .cookie_store(config.with_credentials)
            .build()
            .expect("failed to build reqwest client");
        Self { client }
    }

    fn apply_headers(mut builder: reqwest::RequestBuilder, opts: &RequestOptions) -> reqwest::RequestBuilder {
        for (k, v) in &opts.headers {
            builder = builder.header(k, v);
        }
        builder.timeout(opts.timeout)
    }
}

#[async_trait]
impl NetworkAdapter for ReqwestNetworkAdapter {
    async fn precheck(
        &self,
        check_endpoint: &str,
        name: &str,
        size: u64,
        mime_type: Option<&str>,
        fingerprint: &str,
        opts: &RequestOptions,
    ) -> Result<PrecheckOutcome, TransportError> {
        let payload = serde_json::json!({
            "name": name,
            "size": size,
            "type": mime_type,
            "fingerprint": fingerprint,
        });
        let request = Self::apply_headers(self.client.post(check_endpoint), opts).json(&payload);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body: Value = response.json().await?;
        if !(200..300).contains(&status) {
            return Err(TransportError::Status {
                status,
                body: body.to_string(),
            });
        }
        if body.get("exists").and_then(Value::as_bool) == Some(true) {
            let url = body
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(PrecheckOutcome::Exists { url });
        }
        let upload_id = body
            .get("uploadId")
            .and_then(Value::as_str)
            .unwrap_or(fingerprint)
            .to_string();
        if let Some(received) = body.get("receivedChunks").and_then(Value::as_array) {
            let received_chunks = received.iter().filter_map(Value::as_u64).map(|v| v as usize).collect();
            return Ok(PrecheckOutcome::Partial {
                upload_id,
                received_chunks,
            });
        }
        Ok(PrecheckOutcome::New { upload_id })
    }

    async fn upload_chunk(
        &self,
        endpoint: &str,
        upload_id: &str,
        fingerprint: &str,
        chunk_index: usize,
        total_chunks: usize,
        len: u64,
        reader: ChunkReader,
        opts: &RequestOptions,
        cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let body = Body::wrap_stream(ReaderStream::new(reader));
        let request = Self::apply_headers(self.client.post(endpoint), opts)
            .header("X-Upload-Id", upload_id)
            .header("X-Chunk-Index", chunk_index.to_string())
            .header("X-Chunk-Count", total_chunks.to_string())
            .header("X-Fingerprint", fingerprint)
            .header("Content-Length", len.to_string())
            .body(body);

        tokio::select! {
            result = request.send() => {
                let response = result?;
                let status = response.status().as_u16();
                let headers = response
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
                    .collect();
                let body = response.bytes().await?;
                Ok(HttpResponse { status, headers, body })
            }
            _ = cancel.cancelled() => Err(TransportError::Aborted),
        }
    }

    async fn merge(
        &self,
        merge_endpoint: &str,
        upload_id: &str,
        fingerprint: &str,
        name: &str,
        total_chunks: usize,
        opts: &RequestOptions,
    ) -> Result<String, TransportError> {
        let payload = serde_json::json!({
            "uploadId": upload_id,
            "fingerprint": fingerprint,
            "name": name,
            "totalChunks": total_chunks,
        });
        let request = Self::apply_headers(self.client.post(merge_endpoint), opts).json(&payload);
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body: Value = response.json().await?;
        if !(200..300).contains(&status) {
            return Err(TransportError::Status {
                status,
                body: body.to_string(),
            });
        }
        Ok(body.get("url").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    fn network_quality(&self) -> NetworkQuality {
        NetworkQuality::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_retryability_matches_taxonomy() {
        assert!(TransportError::status_is_retryable(503));
        assert!(TransportError::status_is_retryable(429));
        assert!(!TransportError::status_is_retryable(404));
        assert!(!TransportError::status_is_retryable(401));
    }

    #[test]
    fn request_options_carry_config_timeout_and_headers() {
        let mut config = UploaderConfig::default();
        config.endpoint = "https://example.com/upload".into();
        config.timeout = Duration::from_secs(5);
        config.headers.insert("X-Api-Key".into(), "secret".into());
        let opts = RequestOptions::from(&config);
        assert_eq!(opts.timeout, Duration::from_secs(5));
        assert_eq!(opts.headers.get("X-Api-Key"), Some(&"secret".to_string()));
    }
}
