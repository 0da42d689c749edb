//! Access-check ingestion (tier-2 detector input)
//!
//! The customer application reports what access it actually served. The
//! `user` field resolves through the identity graph by external id.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use revwatch_shared::{AccessCheck, ApiScope, Source};

use crate::error::{ApiError, Result};
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

pub const MAX_BATCH: usize = 100;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheckRequest {
    #[validate(length(min = 1, max = 255))]
    pub user: String,
    pub product_id: Option<String>,
    pub has_access: bool,
    pub checked_at: Option<DateTime<Utc>>,
}

pub async fn report(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<AccessCheckRequest>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::AccessChecksWrite)?;
    let check = ingest_one(&state, ctx.org_id, request).await?;
    Ok(Json(json!({ "ok": true, "accessCheckId": check.id })))
}

pub async fn report_batch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(requests): Json<Vec<AccessCheckRequest>>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::AccessChecksWrite)?;
    if requests.len() > MAX_BATCH {
        return Err(ApiError::validation_with(
            "batch too large",
            json!({ "max": MAX_BATCH, "got": requests.len() }),
        ));
    }

    let mut ids = Vec::with_capacity(requests.len());
    for request in requests {
        let check = ingest_one(&state, ctx.org_id, request).await?;
        ids.push(check.id);
    }
    Ok(Json(json!({ "ok": true, "accessCheckIds": ids })))
}

async fn ingest_one(
    state: &AppState,
    org_id: Uuid,
    request: AccessCheckRequest,
) -> Result<AccessCheck> {
    request
        .validate()
        .map_err(|e| ApiError::validation_with("invalid access check", json!(e.to_string())))?;

    let user_id = state
        .resolver
        .resolve_external(org_id, &request.user)
        .await?;

    let product_id = match &request.product_id {
        Some(raw) => resolve_product(state, org_id, raw).await?,
        None => None,
    };

    let now = Utc::now();
    let check = state
        .store
        .insert_access_check(AccessCheck {
            id: Uuid::new_v4(),
            org_id,
            user_id: Some(user_id),
            product_id,
            external_user_id: request.user,
            has_access: request.has_access,
            reported_at: request.checked_at.unwrap_or(now),
            created_at: now,
        })
        .await?;
    Ok(check)
}

/// Accept either our product uuid or a provider-side product identifier
async fn resolve_product(state: &AppState, org_id: Uuid, raw: &str) -> Result<Option<Uuid>> {
    if let Ok(id) = raw.parse::<Uuid>() {
        return Ok(Some(id));
    }
    for source in Source::ALL {
        if let Some(product) = state
            .store
            .find_product_by_external_id(org_id, source, raw)
            .await?
        {
            return Ok(Some(product.id));
        }
    }
    Ok(None)
}
