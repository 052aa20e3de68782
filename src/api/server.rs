//! HTTP server

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::service::Service;

/// Builds the zdap router. Public so tests can drive it without a socket.
pub fn build_router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/status", get(handlers::get_status))
        .route("/resources", get(handlers::get_resources))
        .route("/resources/:resource", get(handlers::get_resource))
        .route(
            "/resources/:resource/snaps",
            get(handlers::get_snaps).post(handlers::post_clone_latest),
        )
        .route(
            "/resources/:resource/snaps/:ts",
            get(handlers::get_snap).post(handlers::post_clone_at),
        )
        .route(
            "/resources/:resource/clones",
            get(handlers::get_clones).delete(handlers::delete_clones),
        )
        .route(
            "/resources/:resource/clones/:ts",
            delete(handlers::delete_clone_at),
        )
        .route("/resources/:resource/claim", post(handlers::post_claim))
        .route(
            "/resources/:resource/claims/:id",
            delete(handlers::delete_claim),
        )
        .layer(middleware::from_fn(handlers::require_auth))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// HTTP API Server
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    pub fn new(service: Arc<Service>, addr: SocketAddr) -> Self {
        Self {
            router: build_router(service),
            addr,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        tracing::info!("starting API server on {}", self.addr);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router).await
    }
}
