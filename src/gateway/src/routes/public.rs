//! Unauthenticated routes: health, webhook ingress, and org bootstrap

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/webhooks/:slug/:source",
            post(handlers::webhooks::receive),
        )
        .route("/v1/setup/org", post(handlers::setup::create_org))
}
