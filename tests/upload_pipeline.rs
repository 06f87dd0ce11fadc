//! End-to-end pipeline scenarios driven against an in-process mock
//! network and the shipped in-memory storage adapter: no real sockets
//! are opened.

use async_trait::async_trait;
use bytes::Bytes;
use chunkflow::config::UploaderConfig;
use chunkflow::error::TransportError;
use chunkflow::error_center::ErrorCenter;
use chunkflow::event_bus::EventBus;
use chunkflow::network::{ChunkReader, HttpResponse, NetworkAdapter, NetworkQuality, PrecheckOutcome, RequestOptions};
use chunkflow::scheduler::{SchedulerConfig, TaskScheduler};
use chunkflow::storage::{InMemoryStorageAdapter, StorageAdapter};
use chunkflow::Uploader;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// In-process stand-in for a real HTTP backend. `fail_until` maps a
/// chunk index to the number of attempts that should fail with
/// `fail_status` before the chunk is accepted.
struct MockNetwork {
    precheck_outcome: PrecheckOutcome,
    fail_until: Mutex<HashMap<usize, u32>>,
    fail_status: u16,
    precheck_calls: AtomicUsize,
    chunk_calls: AtomicUsize,
    merge_calls: AtomicUsize,
}

impl MockNetwork {
    fn new(precheck_outcome: PrecheckOutcome) -> Self {
        Self {
            precheck_outcome,
            fail_until: Mutex::new(HashMap::new()),
            fail_status: 503,
            precheck_calls: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            merge_calls: AtomicUsize::new(0),
        }
    }

    fn fail_chunk_n_times(mut self, index: usize, times: u32, status: u16) -> Self {
        self.fail_until.get_mut().unwrap().insert(index, times);
        self.fail_status = status;
        self
    }
}

#[async_trait]
impl NetworkAdapter for MockNetwork {
    async fn precheck(
        &self,
        _check_endpoint: &str,
        _name: &str,
        _size: u64,
        _mime_type: Option<&str>,
        _fingerprint: &str,
        _opts: &RequestOptions,
    ) -> Result<PrecheckOutcome, TransportError> {
        self.precheck_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.precheck_outcome.clone())
    }

    async fn upload_chunk(
        &self,
        _endpoint: &str,
        _upload_id: &str,
        _fingerprint: &str,
        chunk_index: usize,
        _total_chunks: usize,
        _len: u64,
        mut reader: ChunkReader,
        _opts: &RequestOptions,
        _cancel: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.expect("mock reader read failed");

        let mut remaining = self.fail_until.lock().unwrap();
        if let Some(n) = remaining.get_mut(&chunk_index) {
            if *n > 0 {
                *n -= 1;
                return Ok(HttpResponse {
                    status: self.fail_status,
                    headers: HashMap::new(),
                    body: Bytes::from_static(b"{}"),
                });
            }
        }
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: Bytes::from_static(b"{}"),
        })
    }

    async fn merge(
        &self,
        _merge_endpoint: &str,
        _upload_id: &str,
        _fingerprint: &str,
        _name: &str,
        _total_chunks: usize,
        _opts: &RequestOptions,
    ) -> Result<String, TransportError> {
        self.merge_calls.fetch_add(1, Ordering::SeqCst);
        Ok("https://example.com/files/merged".to_string())
    }

    fn network_quality(&self) -> NetworkQuality {
        NetworkQuality::Good
    }
}

fn fast_retry_config(endpoint: &str) -> UploaderConfig {
    let mut config = UploaderConfig::builder()
        .endpoint(endpoint)
        .retries(3)
        .build()
        .unwrap();
    config.retry_delay = Duration::from_millis(1);
    config.backoff_factor = 1.0;
    config.max_retry_delay = Duration::from_millis(1);
    config.jitter = 0.0;
    config
}

async fn build_uploader(
    config: UploaderConfig,
    network: Arc<dyn NetworkAdapter>,
    storage: Arc<dyn StorageAdapter>,
) -> Uploader {
    let event_bus = EventBus::new();
    let scheduler = TaskScheduler::new(SchedulerConfig::from(&config), event_bus.clone());
    let error_center = Arc::new(ErrorCenter::default());
    Uploader::new(config, event_bus, scheduler, error_center, network, storage, None).unwrap()
}

async fn write_temp_file(size: usize) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    tokio::fs::write(&path, vec![7u8; size]).await.unwrap();
    (dir, path)
}

#[tokio::test]
async fn happy_path_uploads_every_chunk_and_merges() {
    let (_dir, path) = write_temp_file(3 * 1024 * 1024).await;
    let network = Arc::new(MockNetwork::new(PrecheckOutcome::New {
        upload_id: "upload-1".into(),
    }));
    let config = fast_retry_config("https://example.com/upload");
    let uploader = build_uploader(
        config,
        network.clone(),
        Arc::new(InMemoryStorageAdapter::new()),
    )
    .await;

    let outcome = uploader.upload(&path, "file-1").await.unwrap();

    assert!(!outcome.instant);
    assert_eq!(outcome.url, "https://example.com/files/merged");
    assert_eq!(network.merge_calls.load(Ordering::SeqCst), 1);
    assert!(network.chunk_calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn precheck_exists_short_circuits_as_instant_upload() {
    let (_dir, path) = write_temp_file(1024).await;
    let network = Arc::new(MockNetwork::new(PrecheckOutcome::Exists {
        url: "https://example.com/files/already-there".into(),
    }));
    let config = fast_retry_config("https://example.com/upload");
    let uploader = build_uploader(
        config,
        network.clone(),
        Arc::new(InMemoryStorageAdapter::new()),
    )
    .await;

    let outcome = uploader.upload(&path, "file-2").await.unwrap();

    assert!(outcome.instant);
    assert_eq!(outcome.url, "https://example.com/files/already-there");
    assert_eq!(network.chunk_calls.load(Ordering::SeqCst), 0);
    assert_eq!(network.merge_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn transient_chunk_failure_retries_then_succeeds() {
    let (_dir, path) = write_temp_file(1024 * 1024).await;
    let network = Arc::new(
        MockNetwork::new(PrecheckOutcome::New {
            upload_id: "upload-3".into(),
        })
        .fail_chunk_n_times(0, 2, 503),
    );
    let config = fast_retry_config("https://example.com/upload");
    let uploader = build_uploader(
        config,
        network.clone(),
        Arc::new(InMemoryStorageAdapter::new()),
    )
    .await;

    let outcome = uploader.upload(&path, "file-3").await.unwrap();

    assert!(!outcome.instant);
    assert!(network.chunk_calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn permanent_chunk_failure_fails_the_upload() {
    let (_dir, path) = write_temp_file(1024 * 1024).await;
    let network = Arc::new(
        MockNetwork::new(PrecheckOutcome::New {
            upload_id: "upload-4".into(),
        })
        .fail_chunk_n_times(0, u32::MAX, 400),
    );
    let config = fast_retry_config("https://example.com/upload");
    let uploader = build_uploader(
        config,
        network.clone(),
        Arc::new(InMemoryStorageAdapter::new()),
    )
    .await;

    let result = uploader.upload(&path, "file-4").await;

    assert!(result.is_err());
    assert_eq!(network.merge_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resume_skips_chunks_the_precheck_already_received() {
    let (_dir, path) = write_temp_file(3 * 1024 * 1024).await;
    let network = Arc::new(MockNetwork::new(PrecheckOutcome::Partial {
        upload_id: "upload-5".into(),
        received_chunks: vec![0],
    }));
    let config = fast_retry_config("https://example.com/upload");
    let uploader = build_uploader(
        config,
        network.clone(),
        Arc::new(InMemoryStorageAdapter::new()),
    )
    .await;

    let outcome = uploader.upload(&path, "file-5").await.unwrap();

    assert!(!outcome.instant);
    // 3 MiB at the 1 MiB default chunk size is 3 chunks; chunk 0 was
    // already received, so only 2 chunk uploads should have happened.
    assert_eq!(network.chunk_calls.load(Ordering::SeqCst), 2);
}
