use axum::{routing::post, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agcommon::{AppError, Result};

use super::handlers::{self, AppState};

/// Build the API router. Split from `start_web_server` so tests can drive
/// the routes without binding a socket.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/address", post(handlers::address_stats))
        .route("/address/tvl", post(handlers::address_tvl))
        .route("/total/tvl", post(handlers::total_tvl))
        .route("/total/activity", post(handlers::total_activity))
        // the static /tvl route takes precedence over the :metric capture
        .route("/top/agent/tvl", post(handlers::top_agents_tvl))
        .route("/top/agent/:metric", post(handlers::top_agents_by_metric))
        .route("/top/asset/tvl", post(handlers::top_assets_tvl))
        .route("/top/asset/amount_in", post(handlers::top_assets_volume));

    Router::new()
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the query API server and serve until the process exits.
pub async fn start_web_server(state: AppState, listen_addr: SocketAddr) -> Result<()> {
    let app = build_router(state);

    info!("query API listening on http://{}", listen_addr);
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(AppError::IoError)?;
    axum::serve(listener, app)
        .await
        .map_err(|e| AppError::WebServerError(format!("server error: {}", e)))?;
    Ok(())
}
