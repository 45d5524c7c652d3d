//! Food ordering backend.
//!
//! Storefront checkout through a hosted payment page, the signed payment
//! webhook that turns paid sessions into orders, the staff order workflow,
//! per-shop inventory, delivery route planning, post-delivery feedback
//! coupons and event ticketing. [`run`] wires configuration, logging, the
//! HTTP router and the daily discount job together.

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod auth;
pub mod checkout;
pub mod config;
pub mod cron;
pub mod db;
pub mod delivery;
pub mod diagnostics;
pub mod discounts;
pub mod error;
pub mod events;
pub mod feedback;
pub mod gateway;
pub mod inventory;
pub mod models;
pub mod notify;
pub mod orders;
pub mod products;
pub mod routes;
pub mod state;
pub mod webhook;

#[cfg(test)]
mod test_support;

use config::{Config, LogFormat};
use state::AppState;

/// Install the global subscriber: console (pretty or JSON) plus a daily
/// rolling file. The returned guard flushes the file writer on drop.
fn init_tracing(config: &Config) -> tracing_appender::non_blocking::WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,food_order_lib=debug,tower_http=info"));

    // Prune old log files before setting up the appender
    diagnostics::prune_old_logs(&config.log_dir);
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("cannot create log dir {}: {e}", config.log_dir.display());
    }

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let json = config.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(env_filter)
        .with((!json).then(|| fmt::layer().with_target(true)))
        .with(json.then(|| fmt::layer().json().with_target(true)))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    token.cancel();
}

/// Load configuration, open the database and serve until a shutdown signal.
pub async fn run() -> anyhow::Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("no .env loaded: {e}");
    }
    let config = Config::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("BUILD_GIT_SHA"),
        "starting food ordering server"
    );

    let port = config.port;
    let state = AppState::from_config(config).context("failed to build application state")?;

    if let Some((email, password)) = state.config.bootstrap_admin.clone() {
        match auth::ensure_bootstrap_admin(&state.db, &email, &password) {
            Ok(true) => info!(email = %email, "bootstrap admin ready"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "bootstrap admin not created"),
        }
    }

    let shutdown = CancellationToken::new();
    let job = cron::start_discount_job(state.clone(), shutdown.clone());

    let app = routes::router(state);
    let address = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Err(e) = job.await {
        warn!(error = %e, "discount job ended abnormally");
    }
    info!("Server stopped");
    Ok(())
}
