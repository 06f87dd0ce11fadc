//! Optional offload collaborator for hashing and heavy slicing.
//!
//! Tracks active `spawn_blocking` tasks by an `AbortHandle` map keyed by
//! task id for cancellation. The pipeline must tolerate this pool's
//! absence or failure: fingerprinting falls back to the calling task on
//! a `spawn_blocking` panic.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{info, warn};

pub type WorkerTaskId = u64;

/// A pool of `spawn_blocking` slots used for CPU-bound offload (content
/// hashing, large-chunk precomputation) that would otherwise stall the
/// scheduler's cooperative loop.
pub struct TokioWorkerPool {
    max_workers: usize,
    active: Arc<Mutex<HashMap<WorkerTaskId, AbortHandle>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl TokioWorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            active: Arc::new(Mutex::new(HashMap::new())),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn has_capacity(&self) -> bool {
        self.active.lock().await.len() < self.max_workers
    }

    /// Submit a blocking computation. On panic or cancellation of the
    /// blocking task, returns `None` so the caller can fall back to
    /// computing `fallback` on the current task.
    pub async fn submit<F, T>(&self, work: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let handle = tokio::task::spawn_blocking(work);
        self.active.lock().await.insert(id, handle.abort_handle());
        let result = handle.await;
        self.active.lock().await.remove(&id);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(target: "worker_pool", error = %e, "worker task failed, caller should fall back");
                None
            }
        }
    }

    pub async fn cancel(&self, id: WorkerTaskId) -> bool {
        if let Some(handle) = self.active.lock().await.remove(&id) {
            handle.abort();
            true
        } else {
            false
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}

/// Runs `blocking` on the worker pool, falling back to running
/// `fallback` inline on failure — the pattern every offloadable step in
/// the pipeline (fingerprinting today) follows.
pub async fn offload_or_fallback<F, T, Fb>(pool: Option<&TokioWorkerPool>, blocking: F, fallback: Fb) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
    Fb: Future<Output = T>,
{
    if let Some(pool) = pool {
        if let Some(result) = pool.submit(blocking).await {
            return result;
        }
        info!(target: "worker_pool", "falling back to main-task computation after worker failure");
    }
    fallback.await
}
