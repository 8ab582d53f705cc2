// Taskforge demo server
// Runs a task manager over the in-memory document store and exposes it over HTTP

mod api;
mod demo_tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use taskforge::{InMemoryDocumentStore, Interval, ScheduleRequest, TaskManager, TaskManagerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::api::AppState;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9100";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("taskforge=debug,taskforge_server=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    init_tracing();

    tracing::info!("taskforge-server starting...");

    let mut config = TaskManagerConfig::from_env();
    if config.owner_id.trim().is_empty() {
        config.owner_id = format!("taskforge-{}", Uuid::now_v7());
        tracing::warn!(owner_id = %config.owner_id, "TASKFORGE_OWNER_ID not set, generated one");
    }

    let registry = demo_tasks::registry().context("Failed to register task types")?;
    let manager = Arc::new(
        TaskManager::new(config, Arc::new(InMemoryDocumentStore::new()), registry)
            .context("Failed to create task manager")?,
    );
    manager.start().context("Failed to start task manager")?;

    manager
        .ensure_scheduled(
            ScheduleRequest::new("heartbeat", json!({})).with_interval(Interval::from_secs(30)),
        )
        .await
        .context("Failed to schedule heartbeat")?;

    let app = api::routes(AppState {
        manager: Arc::clone(&manager),
    });

    let addr =
        std::env::var("TASKFORGE_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("Server error")?;

    manager.shutdown().await;
    tracing::info!("Server shutdown complete");
    Ok(())
}
