//! Backend transports.

use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::TransportError;
use super::wire::{MetricDescriptor, UploadRequest};
use crate::config::ExporterConfig;

/// Monitoring backend calls used by the exporter.
pub trait MetricClient: Send + Sync + 'static {
    /// Looks up a descriptor; `None` when the backend has none.
    fn get_metric_descriptor(
        &self,
        metric_type: &str,
    ) -> impl Future<Output = Result<Option<MetricDescriptor>, TransportError>> + Send;

    fn create_metric_descriptor(
        &self,
        descriptor: &MetricDescriptor,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn create_time_series(
        &self,
        request: &UploadRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Request body compression for uploads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    #[default]
    None,
    Gzip,
    Zstd,
    Zlib,
    Snappy,
}

impl BodyEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Zlib => "zlib",
            Self::Snappy => "snappy",
        }
    }

    /// Content-Encoding header value, if the body is compressed.
    pub fn header(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
            Self::Zstd => Some("zstd"),
            Self::Zlib => Some("deflate"),
            Self::Snappy => Some("snappy"),
        }
    }

    /// Compresses a serialized body. `None` hands the buffer back untouched.
    pub fn encode(self, body: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        use flate2::write::{GzEncoder, ZlibEncoder};
        use flate2::Compression;

        let encoded = match self {
            Self::None => return Ok(body),
            Self::Gzip => {
                let mut w = GzEncoder::new(Vec::new(), Compression::default());
                w.write_all(&body).and_then(|()| w.finish())
            }
            Self::Zlib => {
                let mut w = ZlibEncoder::new(Vec::new(), Compression::default());
                w.write_all(&body).and_then(|()| w.finish())
            }
            Self::Zstd => zstd::encode_all(body.as_slice(), 0),
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(&body)
                .map_err(io::Error::other),
        };

        encoded.map_err(|e| TransportError::Encode(format!("{} body: {e}", self.as_str())))
    }
}

/// JSON over HTTP transport with optional body compression.
pub struct HttpMetricClient {
    client: reqwest::Client,
    project_url: String,
    encoding: BodyEncoding,
    headers: HashMap<String, String>,
}

impl HttpMetricClient {
    pub fn new(cfg: &ExporterConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.upload_timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            project_url: format!(
                "{}/v3/projects/{}",
                cfg.endpoint.trim_end_matches('/'),
                cfg.project_id
            ),
            encoding: cfg.compression,
            headers: cfg.headers.clone(),
        })
    }

    async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<(), TransportError> {
        let buf = serde_json::to_vec(body).map_err(|e| TransportError::Encode(e.to_string()))?;
        let raw_len = buf.len();

        let compressed = self.encoding.encode(buf)?;

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(compressed);

        if let Some(encoding) = self.encoding.header() {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.map_err(request_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(resp).await);
        }
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        tracing::debug!(url, bytes = raw_len, "posted to backend");

        Ok(())
    }
}

impl MetricClient for HttpMetricClient {
    async fn get_metric_descriptor(
        &self,
        metric_type: &str,
    ) -> Result<Option<MetricDescriptor>, TransportError> {
        let url = format!("{}/metricDescriptors/{metric_type}", self.project_url);

        let mut request = self.client.get(&url);
        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.map_err(request_error)?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(resp).await);
        }

        let body = resp.bytes().await.map_err(request_error)?;
        let descriptor = serde_json::from_slice(&body)
            .map_err(|e| TransportError::Request(format!("decoding descriptor: {e}")))?;

        Ok(Some(descriptor))
    }

    async fn create_metric_descriptor(
        &self,
        descriptor: &MetricDescriptor,
    ) -> Result<(), TransportError> {
        let url = format!("{}/metricDescriptors", self.project_url);
        self.post_json(&url, descriptor).await
    }

    async fn create_time_series(&self, request: &UploadRequest) -> Result<(), TransportError> {
        let url = format!("{}/timeSeries", self.project_url);
        self.post_json(&url, request).await
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        return TransportError::Request(format!("timed out: {e}"));
    }
    TransportError::Request(e.to_string())
}

async fn status_error(resp: reqwest::Response) -> TransportError {
    const MAX_BODY: usize = 512;

    let status = resp.status().as_u16();
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_BODY {
        let mut cut = MAX_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    TransportError::Status { status, body }
}

/// In-memory backend. Keeps descriptors and upload requests, and can inject
/// upload failures and latency.
#[derive(Default)]
pub struct MemoryClient {
    descriptors: Mutex<HashMap<String, MetricDescriptor>>,
    requests: Mutex<Vec<UploadRequest>>,
    latency: Option<Duration>,
    fail_next: AtomicUsize,
    descriptor_lookups: AtomicUsize,
    descriptors_created: AtomicUsize,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every time series upload by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Pre-registers a descriptor, as if created by an earlier process.
    pub fn insert_descriptor(&self, descriptor: MetricDescriptor) {
        self.descriptors
            .lock()
            .insert(descriptor.metric_type.clone(), descriptor);
    }

    pub fn descriptor(&self, metric_type: &str) -> Option<MetricDescriptor> {
        self.descriptors.lock().get(metric_type).cloned()
    }

    /// Makes the next `n` time series uploads fail with a 503.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Upload requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().clone()
    }

    pub fn take_requests(&self) -> Vec<UploadRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub fn descriptor_lookups(&self) -> usize {
        self.descriptor_lookups.load(Ordering::SeqCst)
    }

    pub fn descriptors_created(&self) -> usize {
        self.descriptors_created.load(Ordering::SeqCst)
    }
}

impl MetricClient for MemoryClient {
    async fn get_metric_descriptor(
        &self,
        metric_type: &str,
    ) -> Result<Option<MetricDescriptor>, TransportError> {
        self.descriptor_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.descriptor(metric_type))
    }

    async fn create_metric_descriptor(
        &self,
        descriptor: &MetricDescriptor,
    ) -> Result<(), TransportError> {
        self.descriptors_created.fetch_add(1, Ordering::SeqCst);
        self.insert_descriptor(descriptor.clone());
        Ok(())
    }

    async fn create_time_series(&self, request: &UploadRequest) -> Result<(), TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::Status {
                status: 503,
                body: "injected failure".to_string(),
            });
        }

        self.requests.lock().push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn test_encoding_none_passes_through() {
        let data = b"hello world".to_vec();
        let result = BodyEncoding::None.encode(data.clone()).expect("encode none");
        assert_eq!(result, data);
        assert_eq!(BodyEncoding::None.header(), None);
    }

    #[test]
    fn test_encoding_gzip_roundtrip() {
        let data = br#"{"name":"projects/p","timeSeries":[]}"#;
        let compressed = BodyEncoding::Gzip
            .encode(data.to_vec())
            .expect("gzip compress");
        assert_ne!(compressed, data.as_slice());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .expect("gzip decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_encoding_zstd_zlib_and_snappy_roundtrip() {
        let data = br#"{"name":"projects/p","timeSeries":[]}"#;

        let compressed = BodyEncoding::Zstd.encode(data.to_vec()).expect("zstd");
        let decompressed = zstd::decode_all(compressed.as_slice()).expect("zstd decompress");
        assert_eq!(decompressed, data);

        let compressed = BodyEncoding::Zlib.encode(data.to_vec()).expect("zlib");
        let mut decompressed = Vec::new();
        flate2::read::ZlibDecoder::new(compressed.as_slice())
            .read_to_end(&mut decompressed)
            .expect("zlib decompress");
        assert_eq!(decompressed, data);

        let compressed = BodyEncoding::Snappy.encode(data.to_vec()).expect("snappy");
        let decompressed = snap::raw::Decoder::new()
            .decompress_vec(&compressed)
            .expect("snappy decompress");
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_encoding_headers_and_names() {
        assert_eq!(BodyEncoding::Zlib.header(), Some("deflate"));
        assert_eq!(BodyEncoding::Snappy.header(), Some("snappy"));
        assert_eq!(BodyEncoding::default(), BodyEncoding::None);

        let parsed: BodyEncoding = serde_yaml::from_str("zstd").expect("parse");
        assert_eq!(parsed, BodyEncoding::Zstd);
        assert!(serde_yaml::from_str::<BodyEncoding>("brotli").is_err());
    }

    #[test]
    fn test_http_client_project_url() {
        let cfg = ExporterConfig {
            endpoint: "http://localhost:8080/".to_string(),
            project_id: "proj".to_string(),
            ..Default::default()
        };
        let client = HttpMetricClient::new(&cfg).expect("client");
        assert_eq!(client.project_url, "http://localhost:8080/v3/projects/proj");
    }

    #[tokio::test]
    async fn test_memory_client_fail_next() {
        let client = MemoryClient::new();
        client.fail_next(1);
        let request = UploadRequest {
            target: "projects/p".to_string(),
            time_series: Vec::new(),
        };

        assert!(matches!(
            client.create_time_series(&request).await,
            Err(TransportError::Status { status: 503, .. })
        ));
        client
            .create_time_series(&request)
            .await
            .expect("second upload succeeds");
        assert_eq!(client.requests().len(), 1);
    }
}
