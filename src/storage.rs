//! Narrow persistence interface for resumable upload state.
//!
//! Only the core's interface to storage is in scope: IndexedDB,
//! localStorage, and a platform key-value store are external
//! collaborators that implement this trait; this crate ships only the
//! in-memory default, the collaborator the pipeline falls back to when
//! no platform-specific adapter is wired in.

use crate::config::{StorageType, UploaderConfig};
use crate::error::StorageError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Persisted per-fingerprint resumable state, opaque to the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedUploadState {
    pub fingerprint: String,
    pub upload_id: String,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub completed_chunks: Vec<usize>,
    pub file_name: String,
    pub file_size: u64,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn load(&self, fingerprint: &str) -> Result<Option<PersistedUploadState>, StorageError>;
    async fn save(&self, state: PersistedUploadState) -> Result<(), StorageError>;
    async fn delete(&self, fingerprint: &str) -> Result<(), StorageError>;
}

/// Default in-process store. Keyed by fingerprint; writes to distinct
/// keys never race because the pipeline never issues concurrent writes
/// to the same fingerprint.
#[derive(Default, Clone)]
pub struct InMemoryStorageAdapter {
    entries: Arc<DashMap<String, PersistedUploadState>>,
}

impl InMemoryStorageAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStorageAdapter {
    async fn load(&self, fingerprint: &str) -> Result<Option<PersistedUploadState>, StorageError> {
        Ok(self.entries.get(fingerprint).map(|e| e.clone()))
    }

    async fn save(&self, state: PersistedUploadState) -> Result<(), StorageError> {
        self.entries.insert(state.fingerprint.clone(), state);
        Ok(())
    }

    async fn delete(&self, fingerprint: &str) -> Result<(), StorageError> {
        self.entries.remove(fingerprint);
        Ok(())
    }
}

/// Picks the storage adapter named by `config.storage_type`. `LocalStorage`
/// and `IndexedDb` are browser collaborators this crate doesn't implement;
/// both fall back to the in-memory adapter with a warning rather than
/// failing construction.
pub fn build_storage(config: &UploaderConfig) -> Arc<dyn StorageAdapter> {
    match config.storage_type {
        StorageType::Memory => Arc::new(InMemoryStorageAdapter::new()),
        StorageType::LocalStorage | StorageType::IndexedDb => {
            warn!(
                target: "storage",
                storage_type = ?config.storage_type,
                "browser storage backend requested but not available natively, falling back to in-memory"
            );
            Arc::new(InMemoryStorageAdapter::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn round_trips_persisted_state() {
        let adapter = InMemoryStorageAdapter::new();
        let state = PersistedUploadState {
            fingerprint: "abc".into(),
            upload_id: "u1".into(),
            chunk_size: 1024,
            total_chunks: 4,
            completed_chunks: vec![0, 1],
            file_name: "f.bin".into(),
            file_size: 4096,
            updated_at: Utc::now(),
        };
        adapter.save(state.clone()).await.unwrap();
        let loaded = adapter.load("abc").await.unwrap().unwrap();
        assert_eq!(loaded.completed_chunks, vec![0, 1]);
        adapter.delete("abc").await.unwrap();
        assert!(adapter.load("abc").await.unwrap().is_none());
    }
}
