//! User-centric reads: entitlement feed and delivery log listing

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use revwatch_database::WebhookLogFilter;
use revwatch_shared::{ApiScope, ProcessingStatus, Source};

use crate::error::{ApiError, Result};
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

pub async fn entitlements(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesRead)?;

    let user = state
        .store
        .get_user(ctx.org_id, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))?;
    let entitlements = state
        .store
        .list_entitlements_for_user(ctx.org_id, user_id)
        .await?;
    let identities = state
        .store
        .list_identities_for_user(ctx.org_id, user_id)
        .await?;

    Ok(Json(json!({
        "user": user,
        "entitlements": entitlements,
        "identities": identities,
    })))
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub source: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
}

pub async fn webhook_logs(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesRead)?;

    let filter = WebhookLogFilter {
        source: query
            .source
            .as_deref()
            .map(|raw| raw.parse::<Source>())
            .transpose()
            .map_err(|e| ApiError::validation_with("invalid source", json!(e)))?,
        status: query
            .status
            .as_deref()
            .map(|raw| raw.parse::<ProcessingStatus>())
            .transpose()
            .map_err(|e| ApiError::validation_with("invalid status", json!(e)))?,
        limit: query.limit.unwrap_or(50),
    };

    let logs = state.store.list_webhook_logs(ctx.org_id, filter).await?;
    Ok(Json(json!({ "webhookLogs": logs })))
}
