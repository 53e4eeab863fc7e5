use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

mod chain;
mod config;
mod coordinator;
mod miner;
mod monitor;
mod notify;
mod relay;
mod scheduler;
mod server;
mod types;

use chain::KaleChain;
use config::Config;
use coordinator::Coordinator;
use miner::MinerRunner;
use monitor::{BlockMonitor, MonitorStats};
use notify::BackendNotifier;
use relay::LaunchtubeSubmitter;
use server::AppState;

/// Everything still in flight gets this long to wind down after a signal.
const SHUTDOWN_GRACE_SECS: u64 = 30;

fn init_logger() {
    tracing_subscriber::registry()
        .with(
            fmt::layer().with_filter(
                EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            ),
        )
        .init();
}

#[cfg(unix)]
async fn shutdown_signal() {
    use futures::FutureExt;
    use tokio::signal::unix::{signal, SignalKind};

    futures::future::select(
        Box::pin(
            signal(SignalKind::interrupt())
                .expect("setting signal handlers must never fail")
                .recv()
                .map(|_| info!("received SIGINT, shutting down")),
        ),
        Box::pin(
            signal(SignalKind::terminate())
                .expect("setting signal handlers must never fail")
                .recv()
                .map(|_| info!("received SIGTERM, shutting down")),
        ),
    )
    .await;
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("setting signal handlers must never fail");
    info!("received Ctrl+C, shutting down");
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };
    if let Err(err) = config.validate() {
        error!(%err, "configuration rejected");
        std::process::exit(1);
    }

    info!(
        pooler_id = %config.pooler_id,
        contract = %config.contract_id,
        rpc = %config.rpc_url,
        port = config.port,
        "kale pooler starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(MonitorStats::default());

    let chain = KaleChain::new(&config.rpc_url, &config.contract_id)
        .map_err(|e| anyhow::anyhow!("chain reader: {e}"))?;
    let notifier = Arc::new(
        BackendNotifier::new(&config).map_err(|e| anyhow::anyhow!("backend notifier: {e}"))?,
    );
    let submitter = Arc::new(
        LaunchtubeSubmitter::new(&config).map_err(|e| anyhow::anyhow!("relay submitter: {e}"))?,
    );
    let miner = Arc::new(MinerRunner::new(
        config.miner_path.clone(),
        Duration::from_secs(config.miner_timeout_secs),
        shutdown_rx.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        &config,
        miner,
        submitter,
        notifier.clone(),
    ));

    let monitor = BlockMonitor::new(&config, chain, notifier, stats.clone());
    let monitor_task = actix_web::rt::spawn(monitor.run(shutdown_rx.clone()));

    let http = server::build(
        AppState {
            coordinator: coordinator.clone(),
            stats,
            auth_token: config.auth_token.clone(),
            max_error_count: config.max_error_count,
        },
        config.port,
    )?;
    let http_handle = http.handle();
    let http_task = actix_web::rt::spawn(http);

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = monitor_task => {
            warn!("block monitor exited");
        }
        result = http_task => {
            warn!(?result, "http server exited");
        }
    }

    // stop accepting, kill the miner child, drop queued batches, then give
    // in-flight tasks the grace window to unwind
    let _ = shutdown_tx.send(true);
    coordinator.emergency_stop();
    let _ = tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_GRACE_SECS),
        http_handle.stop(true),
    )
    .await;

    info!("kale pooler stopped");
    Ok(())
}
