//! Aggregated uploader configuration, validated once at construction
//! rather than scattered through the pipeline.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::time::Duration;

/// Either a fixed value or "figure it out at plan time".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoOr<T> {
    Auto,
    Fixed(T),
}

pub type ChunkSizeOption = AutoOr<u64>;
pub type ConcurrencyOption = AutoOr<usize>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    LocalStorage,
    IndexedDb,
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub endpoint: String,
    pub check_endpoint: Option<String>,
    pub merge_endpoint: Option<String>,
    pub chunk_size: ChunkSizeOption,
    pub concurrency: ConcurrencyOption,
    pub retries: u32,
    pub retry_delay: Duration,
    pub backoff_factor: f64,
    pub max_retry_delay: Duration,
    pub jitter: f64,
    pub timeout: Duration,
    pub use_worker: bool,
    pub headers: HashMap<String, String>,
    pub with_credentials: bool,
    pub enable_precheck: bool,
    pub hash_algorithm: HashAlgorithm,
    pub max_file_size: Option<u64>,
    pub min_file_size: Option<u64>,
    pub allow_empty_files: bool,
    pub allow_file_types: Vec<String>,
    pub disallow_file_types: Vec<String>,
    pub persist_queue: bool,
    pub storage_type: StorageType,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub concurrency_check_interval: Duration,
    pub max_idle_time: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            check_endpoint: None,
            merge_endpoint: None,
            chunk_size: AutoOr::Auto,
            concurrency: AutoOr::Auto,
            retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff_factor: 1.5,
            max_retry_delay: Duration::from_secs(30),
            jitter: 0.2,
            timeout: Duration::from_secs(60),
            use_worker: true,
            headers: HashMap::new(),
            with_credentials: false,
            enable_precheck: true,
            hash_algorithm: HashAlgorithm::Sha256,
            max_file_size: None,
            min_file_size: None,
            allow_empty_files: false,
            allow_file_types: vec!["*/*".to_string()],
            disallow_file_types: Vec::new(),
            persist_queue: true,
            storage_type: StorageType::Memory,
            min_chunk_size: 256 * 1024,
            max_chunk_size: 50 * 1024 * 1024,
            concurrency_check_interval: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(30),
        }
    }
}

impl UploaderConfig {
    pub fn builder() -> UploaderConfigBuilder {
        UploaderConfigBuilder::default()
    }

    /// Static misconfigurations are rejected eagerly; `Auto` fields are
    /// resolved later, per-file, by `FileManager`/the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(ConfigError::ChunkSizeRange {
                min: self.min_chunk_size,
                max: self.max_chunk_size,
            });
        }
        if let AutoOr::Fixed(0) = self.concurrency {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploaderConfigBuilder {
    inner: Option<UploaderConfig>,
}

impl UploaderConfigBuilder {
    fn cfg(&mut self) -> &mut UploaderConfig {
        self.inner.get_or_insert_with(UploaderConfig::default)
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.cfg().endpoint = endpoint.into();
        self
    }

    pub fn check_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.cfg().check_endpoint = Some(endpoint.into());
        self
    }

    pub fn merge_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.cfg().merge_endpoint = Some(endpoint.into());
        self
    }

    pub fn chunk_size(mut self, size: ChunkSizeOption) -> Self {
        self.cfg().chunk_size = size;
        self
    }

    pub fn concurrency(mut self, concurrency: ConcurrencyOption) -> Self {
        self.cfg().concurrency = concurrency;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.cfg().retries = retries;
        self
    }

    pub fn hash_algorithm(mut self, algo: HashAlgorithm) -> Self {
        self.cfg().hash_algorithm = algo;
        self
    }

    pub fn build(mut self) -> Result<UploaderConfig, ConfigError> {
        let cfg = self.cfg().clone();
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_endpoint_rejected() {
        let err = UploaderConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyEndpoint));
    }

    #[test]
    fn builder_roundtrip() {
        let cfg = UploaderConfig::builder()
            .endpoint("https://example.com/upload")
            .retries(5)
            .build()
            .unwrap();
        assert_eq!(cfg.retries, 5);
        assert_eq!(cfg.endpoint, "https://example.com/upload");
    }

    #[test]
    fn chunk_size_range_rejected() {
        let mut cfg = UploaderConfig::default();
        cfg.endpoint = "x".into();
        cfg.min_chunk_size = 100;
        cfg.max_chunk_size = 10;
        assert!(matches!(
            cfg.validate().unwrap_err(),
            ConfigError::ChunkSizeRange { .. }
        ));
    }
}
