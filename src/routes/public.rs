use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Public Router Module
///
/// Endpoints reachable without an API key.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Liveness probe for monitoring and load balancers.
        .route("/health", get(|| async { "ok" }))
        // POST /api/v1/auth/register
        // Creates a `user`-role account and returns its generated API key.
        .route("/api/v1/auth/register", post(handlers::register_user))
}
