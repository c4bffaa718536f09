use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;

use taskwheel::config::WorkerConfig;
use taskwheel::kvs::{Kvs, RedisKvs};
use taskwheel::worker::Worker;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker config file (defaults to configs/worker.toml)
    #[arg(long)]
    config: Option<String>,

    /// Connect to a sharded KVS
    #[arg(short = 'c', long)]
    cluster: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => WorkerConfig::load_from_path(Some(path))?,
        None => WorkerConfig::load()?,
    };
    taskwheel::init_tracing(&cfg.log_level, &cfg.log_path)?;

    info!(
        version = taskwheel::VERSION,
        cluster = args.cluster,
        kvs = %cfg.kvs_addr,
        bin_path = %cfg.bin_path,
        "worker starting"
    );

    let kvs: Arc<dyn Kvs> = Arc::new(RedisKvs::connect(&cfg.kvs_addr, args.cluster).await?);
    let worker = Arc::new(Worker::new(cfg, kvs));

    let run = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move { worker.run().await }
    });

    shutdown_signal().await;
    worker.close().await;
    run.await?;
    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
