//! Resumable, chunked large-file upload engine.
//!
//! Four subsystems compose the core: [`scheduler`] (bounded-concurrency
//! priority task queue), [`uploader`] (the per-file pipeline), [`error_center`]
//! (typed error classification and recovery), and [`event_bus`] (the
//! prioritized pub/sub fabric gluing them together and exposing plugin
//! hook points). [`file_manager`], [`network`], [`storage`], and
//! [`worker_pool`] are the narrow collaborator interfaces the pipeline
//! drives; this crate ships one concrete default for each.

pub mod config;
pub mod error;
pub mod error_center;
pub mod event_bus;
pub mod file_manager;
pub mod logging;
pub mod network;
pub mod scheduler;
pub mod storage;
pub mod uploader;
pub mod worker_pool;

pub use config::UploaderConfig;
pub use error::{ErrorKind, UploadError};
pub use event_bus::EventBus;
pub use network::ReqwestNetworkAdapter;
pub use storage::InMemoryStorageAdapter;
pub use uploader::{UploadOutcome, Uploader};
