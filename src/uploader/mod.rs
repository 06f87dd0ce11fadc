//! Per-file upload pipeline: validate -> fingerprint -> precheck ->
//! plan -> upload -> merge -> complete, with resumable state and
//! plugin hook dispatch at each phase boundary.
//!
//! Each phase delegates to a narrow collaborator (network adapter,
//! storage adapter, worker pool) and emits a tracing event plus a
//! plugin hook at its boundary, so progress is observable without the
//! orchestration method itself growing provider-specific branches.

pub mod fingerprint;
pub mod plugin;
pub mod progress;

use crate::config::{AutoOr, UploaderConfig};
use crate::error::{ErrorKind, TransportError, UploadError};
use crate::error_center::{ErrorCenter, ErrorContext};
use crate::event_bus::EventBus;
use crate::file_manager::{self, ChunkDescriptor, FileRegistry};
use crate::network::{NetworkAdapter, PrecheckOutcome, RequestOptions};
use crate::scheduler::{TaskExecutor, TaskMetadata, TaskPriority, TaskScheduler};
use crate::storage::{PersistedUploadState, StorageAdapter};
use crate::worker_pool::{offload_or_fallback, TokioWorkerPool};
use plugin::{HookPoint, PluginManager};
use progress::ProgressTracker;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileUploadState {
    Pending,
    Hashing,
    Prechecking,
    Uploading,
    Merging,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub url: String,
    pub instant: bool,
    pub fingerprint: String,
}

/// Wires together the scheduler, event bus, error center, network and
/// storage adapters, worker pool, and plugin manager into the single
/// entry point client code calls.
pub struct Uploader {
    config: UploaderConfig,
    event_bus: EventBus,
    scheduler: Arc<TaskScheduler>,
    error_center: Arc<ErrorCenter>,
    network: Arc<dyn NetworkAdapter>,
    storage: Arc<dyn StorageAdapter>,
    worker_pool: Option<Arc<TokioWorkerPool>>,
    plugins: PluginManager,
    cancel_tokens: dashmap::DashMap<String, CancellationToken>,
    request_opts: RequestOptions,
    files: FileRegistry,
}

impl Uploader {
    pub fn new(
        config: UploaderConfig,
        event_bus: EventBus,
        scheduler: Arc<TaskScheduler>,
        error_center: Arc<ErrorCenter>,
        network: Arc<dyn NetworkAdapter>,
        storage: Arc<dyn StorageAdapter>,
        worker_pool: Option<Arc<TokioWorkerPool>>,
    ) -> Result<Self, crate::error::ConfigError> {
        config.validate()?;
        let plugins = PluginManager::new(&event_bus);
        let request_opts = RequestOptions::from(&config);
        Ok(Self {
            config,
            event_bus,
            scheduler,
            error_center,
            network,
            storage,
            worker_pool,
            plugins,
            cancel_tokens: dashmap::DashMap::new(),
            request_opts,
            files: FileRegistry::new(),
        })
    }

    pub fn use_plugin(&self, plugin: &dyn plugin::UploadPlugin) {
        self.plugins.register(plugin);
    }

    pub fn on(&self, name: &str, handler: impl Fn(&serde_json::Value) + Send + Sync + 'static) {
        self.event_bus.on(name, handler, Default::default());
    }

    /// Drives one file through the full pipeline. `file_id` scopes
    /// cancellation/pause to this upload's chunk tasks.
    pub async fn upload(&self, path: &Path, file_id: &str) -> Result<UploadOutcome, UploadError> {
        let cancel = CancellationToken::new();
        self.cancel_tokens.insert(file_id.to_string(), cancel.clone());

        let result = self.run_pipeline(path, file_id, cancel.clone()).await;

        self.cancel_tokens.remove(file_id);
        self.files.cleanup(file_id);
        match &result {
            Ok(outcome) => {
                self.event_bus.emit(
                    "afterUpload",
                    json!({"fileId": file_id, "url": outcome.url, "instant": outcome.instant}),
                );
            }
            Err(err) => {
                self.event_bus
                    .emit("error", json!({"fileId": file_id, "error": err.message, "kind": err.kind.to_string()}));
            }
        }
        result
    }

    pub fn cancel(&self, file_id: &str) {
        if let Some((_, token)) = self.cancel_tokens.remove(file_id) {
            token.cancel();
        }
        let scheduler = self.scheduler.clone();
        let file_id = file_id.to_string();
        tokio::spawn(async move {
            scheduler.cancel_tasks_with_metadata("fileId", &file_id).await;
        });
        self.event_bus.emit("cancel", json!({"fileId": file_id}));
    }

    pub async fn pause(&self, file_id: &str) {
        self.scheduler.pause_group("fileId", file_id).await;
    }

    pub async fn resume(&self, file_id: &str) {
        self.scheduler.resume_group("fileId", file_id).await;
    }

    async fn run_pipeline(
        &self,
        path: &Path,
        file_id: &str,
        cancel: CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        // Phase 1: validate.
        let registered = self
            .files
            .prepare_file(file_id, path)
            .await
            .map_err(|e| UploadError::new(ErrorKind::File, e.to_string()))?;
        let file_size = registered.size;
        let file_name = registered.name.clone();
        let mime_type = registered.mime_type.as_deref();

        if file_size == 0 && !self.config.allow_empty_files {
            return Err(UploadError::new(ErrorKind::File, "empty files are not allowed"));
        }
        if let Some(max) = self.config.max_file_size {
            if file_size > max {
                return Err(UploadError::new(ErrorKind::Validation, "file exceeds maxFileSize"));
            }
        }
        if let Some(min) = self.config.min_file_size {
            if file_size < min {
                return Err(UploadError::new(ErrorKind::Validation, "file is below minFileSize"));
            }
        }
        if !self
            .config
            .allow_file_types
            .iter()
            .any(|pattern| file_manager::mime_type_matches(pattern, mime_type))
        {
            return Err(UploadError::new(ErrorKind::Validation, "file type is not in allowFileTypes"));
        }
        if self
            .config
            .disallow_file_types
            .iter()
            .any(|pattern| file_manager::mime_type_matches(pattern, mime_type))
        {
            return Err(UploadError::new(ErrorKind::Validation, "file type is in disallowFileTypes"));
        }

        let before = self.plugins.dispatch(
            HookPoint::BeforeUpload,
            json!({"fileId": file_id, "name": file_name, "size": file_size}),
        );
        if before.get("abort").and_then(serde_json::Value::as_bool) == Some(true) {
            return Err(UploadError::new(ErrorKind::Abort, "aborted by plugin in beforeUpload"));
        }
        self.event_bus
            .emit("beforeUpload", json!({"fileId": file_id, "name": file_name, "size": file_size}));

        if cancel.is_cancelled() {
            return Err(UploadError::new(ErrorKind::Abort, "upload cancelled before start"));
        }

        // Phase 2: fingerprint.
        let algo = self.config.hash_algorithm;
        let owned_path = path.to_path_buf();
        let worker_pool = if self.config.use_worker { self.worker_pool.as_deref() } else { None };
        let fingerprint = offload_or_fallback(
            worker_pool,
            {
                let owned_path = owned_path.clone();
                move || {
                    tokio::runtime::Handle::current()
                        .block_on(async { fingerprint::fingerprint_file(&owned_path, algo).await })
                }
            },
            fingerprint::fingerprint_file(&owned_path, algo),
        )
        .await
        .map_err(|e| UploadError::new(ErrorKind::File, e.to_string()))?;

        let after_fp = self.plugins.dispatch(
            HookPoint::AfterFingerprint,
            json!({"fileId": file_id, "fingerprint": fingerprint}),
        );
        let fingerprint = after_fp
            .get("fingerprint")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(&fingerprint)
            .to_string();

        // Phase 3: precheck.
        let mut already_received: Vec<usize> = Vec::new();
        let mut upload_id = fingerprint.clone();
        if self.config.enable_precheck {
            if self.config.persist_queue {
                if let Some(persisted) = self.storage.load(&fingerprint).await.ok().flatten() {
                    already_received = persisted.completed_chunks.clone();
                    upload_id = persisted.upload_id.clone();
                }
            }
            let check_endpoint = self
                .config
                .check_endpoint
                .clone()
                .unwrap_or_else(|| self.config.endpoint.clone());
            match self
                .network
                .precheck(&check_endpoint, &file_name, file_size, None, &fingerprint, &self.request_opts)
                .await
            {
                Ok(PrecheckOutcome::Exists { url }) => {
                    self.event_bus
                        .emit("instantUpload:success", json!({"fileId": file_id, "url": url}));
                    if self.config.persist_queue {
                        let _ = self.storage.delete(&fingerprint).await;
                    }
                    self.plugins.dispatch(
                        HookPoint::AfterUpload,
                        json!({"fileId": file_id, "url": url, "instant": true}),
                    );
                    return Ok(UploadOutcome {
                        url,
                        instant: true,
                        fingerprint,
                    });
                }
                Ok(PrecheckOutcome::Partial { upload_id: uid, received_chunks }) => {
                    upload_id = uid;
                    already_received = received_chunks;
                }
                Ok(PrecheckOutcome::New { upload_id: uid }) => {
                    upload_id = uid;
                }
                Err(e) => {
                    let classified = self.error_center.handle_error(
                        e,
                        ErrorContext {
                            retry_count: 0,
                            ..Default::default()
                        },
                    );
                    warn!(target: "uploader", fileId = %file_id, "precheck failed, proceeding as a new upload: {}", classified.message);
                }
            }
        }
        self.plugins.dispatch(
            HookPoint::AfterPrecheck,
            json!({"fileId": file_id, "uploadId": upload_id, "receivedChunks": already_received}),
        );

        // Phase 4: plan.
        let chunk_size = match self.config.chunk_size {
            AutoOr::Fixed(n) => n,
            AutoOr::Auto => file_manager::optimal_chunk_size(
                file_size,
                self.config.min_chunk_size,
                self.config.max_chunk_size,
            ),
        };
        let chunks = file_manager::create_chunks(file_size, chunk_size);
        let total_chunks = chunks.len();
        let pending_chunks: Vec<ChunkDescriptor> = chunks
            .iter()
            .filter(|c| !already_received.contains(&c.index))
            .copied()
            .collect();
        self.files.set_chunks(file_id, chunks);

        if self.config.persist_queue {
            self.storage
                .save(PersistedUploadState {
                    fingerprint: fingerprint.clone(),
                    upload_id: upload_id.clone(),
                    chunk_size,
                    total_chunks,
                    completed_chunks: already_received.clone(),
                    file_name: file_name.clone(),
                    file_size,
                    updated_at: chrono::Utc::now(),
                })
                .await
                .ok();
        }

        // Phase 5: upload.
        let tracker = Arc::new(ProgressTracker::new(file_size, total_chunks));
        for _ in &already_received {
            tracker.complete_chunk();
        }

        let mut task_ids = Vec::with_capacity(pending_chunks.len());
        let endpoint = self.config.endpoint.clone();
        for descriptor in pending_chunks {
            let before = self.plugins.dispatch(
                HookPoint::BeforeChunk,
                json!({"fileId": file_id, "index": descriptor.index}),
            );
            if before.get("skip").and_then(serde_json::Value::as_bool) == Some(true) {
                tracker.complete_chunk();
                continue;
            }

            let executor = self.make_chunk_executor(
                owned_path.clone(),
                endpoint.clone(),
                upload_id.clone(),
                fingerprint.clone(),
                descriptor,
                total_chunks,
                tracker.clone(),
                self.error_center.clone(),
                self.plugins.clone(),
                self.request_opts.clone(),
            );
            let mut metadata = TaskMetadata::new();
            metadata.insert("fileId".to_string(), file_id.to_string());
            metadata.insert("chunkIndex".to_string(), descriptor.index.to_string());
            let id = self
                .scheduler
                .add_task(executor, TaskPriority::Normal, metadata, Some(self.config.retries))
                .await;
            task_ids.push(id);

            if let Some(update) = tracker.snapshot_if_changed(false) {
                self.event_bus.emit("progress", serde_json::to_value(update).unwrap());
            }
        }

        self.scheduler.wait_for_tasks(&task_ids).await;
        self.files.release_file_chunks(file_id);

        if cancel.is_cancelled() {
            return Err(UploadError::new(ErrorKind::Abort, "upload cancelled"));
        }

        let mut failed = Vec::new();
        for id in &task_ids {
            if let Some(info) = self.scheduler.task_info(*id) {
                if info.status == crate::scheduler::TaskStatus::Failed {
                    failed.push(info);
                }
            }
        }
        if !failed.is_empty() {
            if self.config.persist_queue {
                let _ = self.storage.delete(&fingerprint).await;
            }
            let message = failed
                .iter()
                .map(|f| f.last_error.clone().unwrap_or_default())
                .collect::<Vec<_>>()
                .join("; ");
            error!(target: "uploader", fileId = %file_id, "upload failed: {} chunk(s) could not be sent", failed.len());
            return Err(UploadError::new(ErrorKind::Server, format!("chunk upload failed: {}", message)));
        }

        if let Some(update) = tracker.snapshot_if_changed(true) {
            self.event_bus.emit("progress", serde_json::to_value(update).unwrap());
        }

        // Phase 6: merge.
        self.plugins
            .dispatch(HookPoint::BeforeMerge, json!({"fileId": file_id, "uploadId": upload_id}));
        let merge_endpoint = self
            .config
            .merge_endpoint
            .clone()
            .unwrap_or_else(|| self.config.endpoint.clone());
        let url = self
            .network
            .merge(&merge_endpoint, &upload_id, &fingerprint, &file_name, total_chunks, &self.request_opts)
            .await
            .map_err(|e| {
                self.error_center.handle_error(
                    e,
                    ErrorContext {
                        retry_count: 0,
                        ..Default::default()
                    },
                )
            })?;

        // Phase 7: complete.
        if self.config.persist_queue {
            let _ = self.storage.delete(&fingerprint).await;
        }
        self.plugins.dispatch(
            HookPoint::AfterUpload,
            json!({"fileId": file_id, "url": url, "instant": false}),
        );
        info!(target: "uploader", fileId = %file_id, %url, "upload completed");
        Ok(UploadOutcome {
            url,
            instant: false,
            fingerprint,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn make_chunk_executor(
        &self,
        path: PathBuf,
        endpoint: String,
        upload_id: String,
        fingerprint: String,
        descriptor: ChunkDescriptor,
        total_chunks: usize,
        tracker: Arc<ProgressTracker>,
        error_center: Arc<ErrorCenter>,
        plugins: PluginManager,
        request_opts: RequestOptions,
    ) -> TaskExecutor {
        let network = self.network.clone();
        let event_bus = self.event_bus.clone();
        Arc::new(move |cancel: CancellationToken| {
            let path = path.clone();
            let endpoint = endpoint.clone();
            let upload_id = upload_id.clone();
            let fingerprint = fingerprint.clone();
            let network = network.clone();
            let tracker = tracker.clone();
            let error_center = error_center.clone();
            let event_bus = event_bus.clone();
            let plugins = plugins.clone();
            let request_opts = request_opts.clone();
            Box::pin(async move {
                event_bus.emit("chunkProgress", json!({"index": descriptor.index, "progress": 0.0}));
                let reader = file_manager::open_chunk_reader(&path, descriptor)
                    .await
                    .map_err(|e| UploadError::new(ErrorKind::File, e.to_string()))?;
                let len = descriptor.size();
                let response = network
                    .upload_chunk(
                        &endpoint,
                        &upload_id,
                        &fingerprint,
                        descriptor.index,
                        total_chunks,
                        len,
                        Box::new(reader),
                        &request_opts,
                        cancel,
                    )
                    .await;
                match response {
                    Ok(resp) if resp.ok() => {
                        tracker.add_bytes(len);
                        tracker.complete_chunk();
                        event_bus.emit("chunkProgress", json!({"index": descriptor.index, "progress": 1.0}));
                        event_bus.emit(
                            "chunkSuccess",
                            json!({"index": descriptor.index, "status": resp.status}),
                        );
                        plugins.dispatch(
                            HookPoint::AfterChunk,
                            json!({"index": descriptor.index, "status": resp.status}),
                        );
                        Ok(json!({"index": descriptor.index, "status": resp.status}))
                    }
                    Ok(resp) => {
                        let mut err = error_center.handle_error(
                            TransportError::Status {
                                status: resp.status,
                                body: String::from_utf8_lossy(&resp.body).to_string(),
                            },
                            ErrorContext {
                                chunk_index: Some(descriptor.index),
                                ..Default::default()
                            },
                        );
                        let should_retry = error_center.attempt_recovery(&mut err).await;
                        err.is_recoverable = err.is_recoverable && should_retry;
                        event_bus.emit(
                            "chunkError",
                            json!({"index": descriptor.index, "error": err.message}),
                        );
                        Err(err)
                    }
                    Err(transport_err) => {
                        let mut err = error_center.handle_error(
                            transport_err,
                            ErrorContext {
                                chunk_index: Some(descriptor.index),
                                ..Default::default()
                            },
                        );
                        let should_retry = error_center.attempt_recovery(&mut err).await;
                        err.is_recoverable = err.is_recoverable && should_retry;
                        event_bus.emit(
                            "chunkError",
                            json!({"index": descriptor.index, "error": err.message}),
                        );
                        Err(err)
                    }
                }
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{HttpResponse, NetworkQuality};
    use crate::scheduler::SchedulerConfig;
    use crate::storage::InMemoryStorageAdapter;
    use async_trait::async_trait;

    struct AlwaysNewNetwork;

    #[async_trait]
    impl NetworkAdapter for AlwaysNewNetwork {
        async fn precheck(
            &self,
            _check_endpoint: &str,
            _name: &str,
            _size: u64,
            _mime_type: Option<&str>,
            _fingerprint: &str,
            _opts: &RequestOptions,
        ) -> Result<PrecheckOutcome, TransportError> {
            Ok(PrecheckOutcome::New { upload_id: "u".into() })
        }

        async fn upload_chunk(
            &self,
            _endpoint: &str,
            _upload_id: &str,
            _fingerprint: &str,
            _chunk_index: usize,
            _total_chunks: usize,
            _len: u64,
            _reader: crate::network::ChunkReader,
            _opts: &RequestOptions,
            _cancel: CancellationToken,
        ) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 200,
                headers: Default::default(),
                body: bytes::Bytes::new(),
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
            Ok("https://example.com/done".to_string())
        }

        fn network_quality(&self) -> NetworkQuality {
            NetworkQuality::Unknown
        }
    }

    async fn uploader_with_config(config: UploaderConfig) -> Uploader {
        let event_bus = EventBus::new();
        let scheduler = TaskScheduler::new(SchedulerConfig::from(&config), event_bus.clone());
        let error_center = Arc::new(ErrorCenter::default());
        Uploader::new(
            config,
            event_bus,
            scheduler,
            error_center,
            Arc::new(AlwaysNewNetwork),
            Arc::new(InMemoryStorageAdapter::new()),
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn disallowed_file_type_is_rejected_before_any_network_call() {
        let mut config = UploaderConfig::builder()
            .endpoint("https://example.com/upload")
            .build()
            .unwrap();
        config.disallow_file_types = vec!["text/plain".into()];
        let uploader = uploader_with_config(config).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, b"hi").await.unwrap();

        let err = uploader.upload(&path, "f").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_any_network_call() {
        let mut config = UploaderConfig::builder()
            .endpoint("https://example.com/upload")
            .build()
            .unwrap();
        config.max_file_size = Some(4);
        let uploader = uploader_with_config(config).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, vec![1u8; 10]).await.unwrap();

        let err = uploader.upload(&path, "f").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn happy_path_reports_a_non_instant_outcome() {
        let config = UploaderConfig::builder()
            .endpoint("https://example.com/upload")
            .build()
            .unwrap();
        let uploader = uploader_with_config(config).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, vec![1u8; 1024]).await.unwrap();

        let outcome = uploader.upload(&path, "f").await.unwrap();
        assert!(!outcome.instant);
        assert_eq!(outcome.url, "https://example.com/done");
    }
}
