use clap::Parser;
use dotenvy::dotenv;
use std::sync::Arc;
use tracing::info;

use taskwheel::broker::Broker;
use taskwheel::config::BrokerConfig;
use taskwheel::kvs::{Kvs, RedisKvs};
use taskwheel::web;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Broker config file (defaults to configs/broker.toml)
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
        Some(path) => BrokerConfig::load_from_path(Some(path))?,
        None => BrokerConfig::load()?,
    };
    taskwheel::init_tracing(&cfg.log_level, &cfg.log_path)?;

    info!(
        version = taskwheel::VERSION,
        cluster = args.cluster,
        kvs = %cfg.kvs_addr,
        "broker starting"
    );

    let kvs: Arc<dyn Kvs> = Arc::new(RedisKvs::connect(&cfg.kvs_addr, args.cluster).await?);
    let broker = Broker::new(kvs);

    tokio::spawn({
        let broker = Arc::clone(&broker);
        async move { broker.run_fail_recovery().await }
    });

    let app = web::router(Arc::clone(&broker));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    info!(port = cfg.port, "broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    broker.close().await;
    info!("broker stopped");
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
