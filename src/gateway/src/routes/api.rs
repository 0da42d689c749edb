//! Authenticated API routes (nested under /v1)

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        // Access checks (tier-2 detector input)
        .route("/access-checks", post(handlers::access_checks::report))
        .route(
            "/access-checks/batch",
            post(handlers::access_checks::report_batch),
        )
        // Issues
        .route("/issues", get(handlers::issues::list))
        .route("/issues/summary", get(handlers::issues::summary))
        .route("/issues/:id", get(handlers::issues::get))
        .route("/issues/:id/acknowledge", post(handlers::issues::acknowledge))
        .route("/issues/:id/resolve", post(handlers::issues::resolve))
        .route("/issues/:id/dismiss", post(handlers::issues::dismiss))
        // Setup & credentials
        .route("/setup/status", get(handlers::setup::status))
        .route("/setup/verify/:source", post(handlers::setup::verify_source))
        .route("/setup/keys/:id", delete(handlers::setup::revoke_key))
        .route(
            "/setup/backfill/progress",
            get(handlers::backfill::progress),
        )
        .route("/setup/backfill/:source", post(handlers::backfill::start))
        .route(
            "/setup/backfill/:source/cancel",
            post(handlers::backfill::cancel),
        )
        .route("/setup/:source", post(handlers::setup::install_source))
        // Reads
        .route("/users/:id/entitlements", get(handlers::users::entitlements))
        .route("/webhook-logs", get(handlers::users::webhook_logs))
        .route("/integrations/health", get(handlers::setup::integration_health))
        .route("/admin/breakers", get(handlers::admin::breakers))
}
