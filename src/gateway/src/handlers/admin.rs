//! Admin reads

use axum::extract::State;
use axum::{Extension, Json};
use serde_json::{json, Value};

use revwatch_shared::ApiScope;

use crate::error::Result;
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

/// Snapshot of every registered circuit breaker
pub async fn breakers(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::AdminRead)?;
    Ok(Json(json!({ "breakers": state.breakers.snapshots() })))
}
