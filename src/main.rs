//! SommOS backend server.
//!
//! Lifecycle: load config, build the application context, spawn maintenance
//! tasks, serve HTTP + WebSocket until ctrl-c, then drain and shut down.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use sommos_backend::events::{EventSink, ROOM_SYSTEM};
use sommos_backend::models::ServerFrame;
use sommos_backend::{api, AppState, Config};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Retention for produced pairings.
const RECOMMENDATION_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Parser)]
#[command(name = "sommos", about = "Yacht wine cellar management backend")]
struct Cli {
    /// Override the configured listen port.
    #[arg(long, env = "SOMMOS_PORT")]
    port: Option<u16>,

    /// Override the configured database path.
    #[arg(long, env = "DATABASE_PATH")]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    info!(
        port = config.listen_port,
        database = %config.database_path,
        external_calls_disabled = config.external_calls_disabled,
        "🍷 SommOS backend starting"
    );

    let state = AppState::build(config)?;

    tokio::spawn(maintenance_polling(state.clone()));
    tokio::spawn(weather_sweep_polling(state.clone()));

    let app = api::router(state.clone());
    let addr = format!("0.0.0.0:{}", state.config.listen_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("🎯 API server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("server error")?;

    info!("👋 SommOS backend stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sommos_backend=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "shutdown signal listener failed");
        return;
    }
    info!("🛑 Shutdown requested, draining connections");
    state.hub.publish(
        ROOM_SYSTEM,
        ServerFrame::SystemNotification {
            message: "server shutting down".to_string(),
            timestamp: Utc::now().timestamp(),
        },
    );
}

/// Daily retention sweep: applied sync ops and stored pairings.
async fn maintenance_polling(state: AppState) {
    let mut ticker = interval(Duration::from_secs(86_400));
    loop {
        ticker.tick().await;
        let now = Utc::now().timestamp();

        let ops_cutoff = now - state.config.applied_ops_retention_days * 86_400;
        match state.store.prune_applied_ops_before(ops_cutoff) {
            Ok(deleted) if deleted > 0 => {
                info!(
                    deleted,
                    retention_days = state.config.applied_ops_retention_days,
                    "🧹 Pruned applied sync ops"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "applied-ops prune failed"),
        }

        let rec_cutoff = now - RECOMMENDATION_RETENTION_DAYS * 86_400;
        match state.store.prune_recommendations_before(rec_cutoff) {
            Ok(deleted) if deleted > 0 => {
                info!(deleted, "🧹 Pruned aged pairing recommendations");
                let _ = state.store.optimize();
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "recommendation prune failed"),
        }
    }
}

/// Hourly best-effort weather enrichment for unscored vintages.
async fn weather_sweep_polling(state: AppState) {
    let mut ticker = interval(Duration::from_secs(3_600));
    loop {
        ticker.tick().await;
        let items = match state.weather.missing_enrichment() {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "weather sweep query failed");
                continue;
            }
        };
        if items.is_empty() {
            continue;
        }
        info!(pending = items.len(), "🌤️ Weather enrichment sweep starting");
        let enriched = state.weather.enrich_batch(&items).await;
        if enriched > 0 {
            state.hub.publish(
                ROOM_SYSTEM,
                ServerFrame::SystemNotification {
                    message: format!("weather enrichment updated {enriched} vintages"),
                    timestamp: Utc::now().timestamp(),
                },
            );
        }
    }
}
