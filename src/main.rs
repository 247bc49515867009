mod config;
mod cron;
mod engine;
mod errors;
mod logging;
mod mutation;
mod paths;
mod plan;
mod registry;
mod server;
mod state;
mod workflow;

use crate::config::Config;
use crate::cron::ConcurrencySlots;
use crate::engine::Engine;
use crate::mutation::MutationStore;
use crate::registry::Registries;
use crate::server::ServerState;
use crate::state::Dependencies;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = run().await {
        eprintln!("nextai-gateway: fatal startup error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load nextai.toml, using defaults: {e}");
        Config::default()
    });

    let log_dir = logging::setup_tracing_with_settings(logging::LoggingSettings {
        level: None,
        directory: None,
        retention_days: None,
    })
    .context("initializing logging")?;

    tracing::info!("--- NextAI Gateway Startup ---");
    tracing::info!("Data Dir: {}", config.server.data_dir.display());
    tracing::info!("Log Dir: {}", log_dir.display());
    tracing::info!("Listen: {}:{}", config.server.host, config.server.port);
    if !config.disabled_tools.is_empty() {
        tracing::info!("Disabled Tools: {:?}", config.disabled_tools);
    }

    let deps = Dependencies::open(&config.server.data_dir).context("opening state store")?;

    // Seed the protected defaults (spec §3: chat-default / cron-default can
    // never be deleted, so they must always exist).
    deps.chats
        .write(|agg| {
            agg.ensure_default_chat();
            Ok(())
        })
        .await
        .context("seeding default chat")?;
    deps.cron
        .write(|agg| {
            agg.ensure_default_job();
            Ok(())
        })
        .await
        .context("seeding default cron job")?;

    let registries = Arc::new(Registries::default_set());
    let engine = Arc::new(Engine::new(
        Arc::clone(&deps),
        Arc::clone(&registries),
        config.disabled_tools.clone(),
    ));
    let mutation_store = Arc::new(MutationStore::new());
    let cron_slots = ConcurrencySlots::new();

    let tick_loop = cron::spawn_tick_loop(
        Arc::clone(&deps),
        Arc::clone(&registries.channels),
        Arc::clone(&registries.node_handlers),
        Arc::clone(&cron_slots),
        Duration::from_secs(1),
    );

    let state = Arc::new(ServerState {
        deps,
        registries,
        engine,
        mutation_store,
        cron_slots,
        config: config.clone(),
        started_at: Utc::now(),
    });

    let app = server::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Server running on http://{addr}");

    let shutdown_timeout = config.http.shutdown_timeout();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tick_loop.abort();
    tracing::info!("Shutdown complete (grace period {:?})", shutdown_timeout);
    Ok(())
}

/// Waits for SIGINT or SIGTERM so the gateway can drain in-flight requests
/// before exiting 0 (spec §6 "Exit codes").
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
