use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::manager::AgentManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<AgentManager>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/config", get(handlers::get_config))
        .route("/agents", post(handlers::register_agent))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/health", get(handlers::agents_health))
        .route("/agents/:id", get(handlers::get_agent))
        .route("/agents/:id", delete(handlers::unregister_agent))
        .route("/agents/:id/heartbeat", post(handlers::heartbeat))
        .route("/analysis", post(handlers::execute_analysis))
        .route("/metrics", get(handlers::get_metrics))
        .route("/messages", get(handlers::list_messages))
        .route("/events", get(handlers::stream_events))
        .layer(CorsLayer::permissive())
        .with_state(state.manager)
}

/// Serves the API until ctrl-c, then shuts the manager down.
pub async fn serve(state: AppState) -> Result<()> {
    let manager = Arc::clone(&state.manager);
    let address = format!(
        "{}:{}",
        manager.config().server.host,
        manager.config().server.port
    );
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;

    log::info!("Athena orchestrator API listening on {}", address);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
