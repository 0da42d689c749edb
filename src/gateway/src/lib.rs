//! RevWatch gateway
//!
//! The HTTP surface over the core pipeline: per-tenant webhook ingress,
//! the authenticated API (issues, access checks, setup, backfill), the
//! scheduler loops, and process assembly. Handlers stay thin; the domain
//! lives in the service crates.

pub mod error;
pub mod handlers;
pub mod middleware_layer;
pub mod routes;
pub mod scheduler;
pub mod state;

use axum::middleware;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub use error::{ApiError, Result};
pub use state::{AppState, Bootstrap};

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    let api_routes = routes::api::router()
        // Rate limiting keys off the auth context, so auth runs first
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_layer::rate_limit::rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_layer::auth::auth_middleware,
        ));

    Router::new()
        .nest("/v1", api_routes)
        .merge(routes::public::router())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
