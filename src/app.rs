//! Application lifecycle: initialization, task orchestration, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::config::Config;
use crate::proxy::server;
use crate::state::AppState;

/// Run the full application lifecycle after config has been parsed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        rate_limit = config.rate_limit,
        burst_limit = config.burst_limit,
        trust_proxy = config.trust_proxy,
        auth = !config.access_password.is_empty(),
        "streamgate starting"
    );

    let state = Arc::new(AppState::new(config)?);

    // Shutdown signal channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = state.gate.limiter().spawn_sweeper(
        Duration::from_secs(state.config.rate_limit_sweep_interval_secs),
        shutdown_rx.clone(),
    );

    let listener = TcpListener::bind(state.config.listen)
        .await
        .with_context(|| format!("failed to bind {}", state.config.listen))?;
    let mut server = tokio::spawn(server::run(listener, Arc::clone(&state), shutdown_rx));

    tokio::select! {
        signal = wait_for_shutdown() => {
            signal.context("failed to install signal handlers")?;
            info!("shutdown signal received, draining connections");
        }
        joined = &mut server => {
            let _ = shutdown_tx.send(true);
            let _ = sweeper.await;
            return joined?;
        }
    }

    let _ = shutdown_tx.send(true);
    server.await??;
    let _ = sweeper.await;

    info!("streamgate stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
