//! Backfill start/progress endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use revwatch_backfill::{BackfillError, BackfillParams};
use revwatch_shared::{ApiScope, Source};

use crate::error::{ApiError, Result};
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartBackfillRequest {
    #[serde(default)]
    pub purchase_tokens: Vec<String>,
}

pub async fn start(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(source_raw): Path<String>,
    body: Option<Json<StartBackfillRequest>>,
) -> Result<Response> {
    ctx.require(ApiScope::SetupManage)?;
    let source: Source = source_raw
        .parse()
        .map_err(|_| ApiError::not_found("source"))?;

    let params = BackfillParams {
        purchase_tokens: body.map(|Json(b)| b.purchase_tokens).unwrap_or_default(),
    };

    match state.backfill.clone().start(ctx.org_id, source, params).await {
        Ok(progress) => Ok(Json(json!({
            "jobId": progress.job_id,
            "status": "started",
        }))
        .into_response()),
        Err(BackfillError::AlreadyRunning { .. }) => {
            let progress = state.backfill.progress(ctx.org_id, source).await.ok().flatten();
            Ok((
                StatusCode::CONFLICT,
                Json(json!({
                    "error": "backfill already running",
                    "progress": progress,
                })),
            )
                .into_response())
        }
        Err(BackfillError::MissingConnection { .. }) => {
            Err(ApiError::not_found("billing connection"))
        }
        Err(BackfillError::Unsupported { source }) => Err(ApiError::validation(format!(
            "backfill is not supported for {}",
            source
        ))),
        Err(other) => Err(ApiError::internal(other.to_string())),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ProgressQuery {
    pub source: Option<String>,
}

pub async fn progress(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::SetupManage)?;

    let sources: Vec<Source> = match query.source.as_deref() {
        Some(raw) => vec![raw.parse().map_err(|_| ApiError::not_found("source"))?],
        None => vec![Source::Stripe, Source::Recurly, Source::Google],
    };

    let mut out = serde_json::Map::new();
    for source in sources {
        let progress = state
            .backfill
            .progress(ctx.org_id, source)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        out.insert(
            source.as_str().to_string(),
            serde_json::to_value(progress).map_err(|e| ApiError::internal(e.to_string()))?,
        );
    }
    Ok(Json(Value::Object(out)))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(source_raw): Path<String>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::SetupManage)?;
    let source: Source = source_raw
        .parse()
        .map_err(|_| ApiError::not_found("source"))?;
    let cancelled = state
        .backfill
        .request_cancel(ctx.org_id, source)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "ok": cancelled })))
}
