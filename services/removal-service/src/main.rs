use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::serve;
use backdrop_removal_service::{
    config::RemovalServiceConfig, create_router, ApiState, Dispatcher, LocalRemover,
    PacingPolicy, QuotaStore, RemoteRemover, SystemClock, UsageDatabase,
};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RemovalServiceConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config);

    info!(
        data_dir = %config.data_dir.display(),
        api_monthly_limit = config.api_monthly_limit,
        pacing_floor = config.pacing_floor,
        local_configured = config.local_command.is_some(),
        remote_configured = config.remote_api_key.is_some(),
        "removal-service starting"
    );

    let database = Arc::new(
        UsageDatabase::new(config.data_dir.clone()).context("failed to open usage database")?,
    );
    let quota = Arc::new(
        QuotaStore::open(database, Arc::new(SystemClock), config.api_monthly_limit)
            .context("failed to restore usage counters")?,
    );
    let report = quota.usage_report();
    info!(
        period = %report.period,
        used = report.used,
        limit = report.limit,
        "usage counters restored"
    );

    let local = Arc::new(LocalRemover::from_command_line(
        config.local_command.as_deref(),
        config.local_timeout(),
    ));
    let remote = Arc::new(
        RemoteRemover::new(
            config.remote_api_url.clone(),
            config.remote_api_key.clone(),
            config.remote_timeout_secs,
        )
        .context("failed to build remote provider client")?,
    );

    if remote.is_configured() {
        let probe = Arc::clone(&remote);
        tokio::spawn(async move {
            if !probe.check_health().await {
                warn!("remote background removal api is not reachable");
            }
        });
    } else {
        warn!("REMOVE_BG_API_KEY not set, remote fallback disabled");
    }
    if !local.is_configured() {
        warn!("LOCAL_REMOVER_COMMAND not set, local processing disabled");
    }

    let dispatcher = Dispatcher::new(
        quota,
        PacingPolicy::new(config.pacing_floor),
        local,
        remote,
    );

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .context("invalid server bind address")?;
    let state = Arc::new(ApiState::new(dispatcher, config));
    let router = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;
    let local_addr = listener
        .local_addr()
        .context("failed to read bound address")?;
    info!(%local_addr, "removal-service listening");

    serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server encountered an unrecoverable error")?;

    info!("removal-service shutdown complete");
    Ok(())
}

fn init_tracing(config: &RemovalServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
