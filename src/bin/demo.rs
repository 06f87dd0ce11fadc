//! Minimal CLI demonstrating the pipeline end to end against a real
//! endpoint: wires up the default network/storage adapters, a task
//! scheduler, an error center, and runs one file through `Uploader::upload`.
//!
//! ```bash
//! chunkflow-demo --endpoint https://example.com/upload --file ./big.bin
//! ```

use anyhow::{Context, Result};
use chunkflow::config::UploaderConfig;
use chunkflow::error_center::ErrorCenter;
use chunkflow::event_bus::EventBus;
use chunkflow::logging::{init_logging, LogConfig};
use chunkflow::network::{NetworkAdapter, ReqwestNetworkAdapter};
use chunkflow::scheduler::{SchedulerConfig, TaskScheduler};
use chunkflow::storage::{self, StorageAdapter};
use chunkflow::worker_pool::TokioWorkerPool;
use chunkflow::Uploader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

struct Args {
    endpoint: String,
    file: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut endpoint = None;
    let mut file = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--endpoint" => endpoint = args.next(),
            "--file" => file = args.next(),
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }
    Ok(Args {
        endpoint: endpoint.context("--endpoint is required")?,
        file: file.context("--file is required").map(PathBuf::from)?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let _log_guard = init_logging(LogConfig::default())?;

    let config = UploaderConfig::builder()
        .endpoint(args.endpoint.clone())
        .retries(3)
        .build()
        .context("invalid uploader configuration")?;

    let event_bus = EventBus::new();
    event_bus.on(
        "progress",
        |payload| info!(target: "chunkflow-demo", "{}", payload),
        Default::default(),
    );

    let scheduler = TaskScheduler::new(SchedulerConfig::from(&config), event_bus.clone());
    let error_center = Arc::new(ErrorCenter::default());
    let network: Arc<dyn NetworkAdapter> = Arc::new(ReqwestNetworkAdapter::from_config(&config));
    let storage: Arc<dyn StorageAdapter> = storage::build_storage(&config);
    let worker_pool = Arc::new(TokioWorkerPool::new(2));

    let uploader = Uploader::new(
        config,
        event_bus,
        scheduler,
        error_center,
        network,
        storage,
        Some(worker_pool),
    )?;

    let outcome = uploader.upload(&args.file, "demo-file").await?;
    println!("uploaded: {} (instant={})", outcome.url, outcome.instant);
    Ok(())
}
