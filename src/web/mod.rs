//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::engine::HealthEngine;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub engine: Arc<HealthEngine>,
}

/// JSON API server for LanPulse.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, engine: Arc<HealthEngine>) -> Self {
        Self {
            state: AppState {
                config,
                store,
                engine,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/targets", get(handlers::handle_get_targets))
            .route("/api/targets", post(handlers::handle_create_target))
            .route("/api/targets/{id}", put(handlers::handle_update_target))
            .route("/api/targets/{id}", delete(handlers::handle_delete_target))
            .route("/api/targets/{id}/enable", post(handlers::handle_enable_target))
            .route("/api/targets/{id}/disable", post(handlers::handle_disable_target))
            .route("/api/targets/{id}/health", get(handlers::handle_get_target_health))
            .route("/api/targets/{id}/history", get(handlers::handle_get_history))
            .route("/api/health", get(handlers::handle_get_fleet_health))
            .route("/api/events", get(handlers::handle_get_events))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
