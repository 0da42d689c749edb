//! Issue read/write surface

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use revwatch_database::IssueFilter;
use revwatch_shared::{
    AlertEventType, ApiScope, AuditEntry, IssueSeverity, IssueStatus, IssueType,
};

use crate::error::{ApiError, Result};
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct IssueListQuery {
    pub status: Option<String>,
    pub severity: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<IssueListQuery>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesRead)?;

    let filter = IssueFilter {
        status: parse_filter::<IssueStatus>(query.status.as_deref(), "status")?,
        severity: parse_filter::<IssueSeverity>(query.severity.as_deref(), "severity")?,
        issue_type: parse_filter::<IssueType>(query.issue_type.as_deref(), "type")?,
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    };

    let issues = state.store.list_issues(ctx.org_id, filter).await?;
    Ok(Json(json!({ "issues": issues })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(issue_id): Path<Uuid>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesRead)?;
    let issue = state
        .store
        .get_issue(ctx.org_id, issue_id)
        .await?
        .ok_or_else(|| ApiError::not_found("issue"))?;
    Ok(Json(json!({ "issue": issue })))
}

pub async fn summary(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesRead)?;
    let summary = state.store.issue_summary(ctx.org_id).await?;
    Ok(Json(serde_json::to_value(summary).map_err(|e| {
        ApiError::internal(e.to_string())
    })?))
}

#[derive(Debug, Deserialize, Default)]
pub struct TransitionBody {
    pub resolution: Option<String>,
}

pub async fn acknowledge(
    state: State<AppState>,
    ctx: Extension<AuthContext>,
    path: Path<Uuid>,
    body: Option<Json<TransitionBody>>,
) -> Result<Json<Value>> {
    transition(state, ctx, path, body, IssueStatus::Acknowledged).await
}

pub async fn resolve(
    state: State<AppState>,
    ctx: Extension<AuthContext>,
    path: Path<Uuid>,
    body: Option<Json<TransitionBody>>,
) -> Result<Json<Value>> {
    transition(state, ctx, path, body, IssueStatus::Resolved).await
}

pub async fn dismiss(
    state: State<AppState>,
    ctx: Extension<AuthContext>,
    path: Path<Uuid>,
    body: Option<Json<TransitionBody>>,
) -> Result<Json<Value>> {
    transition(state, ctx, path, body, IssueStatus::Dismissed).await
}

async fn transition(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(issue_id): Path<Uuid>,
    body: Option<Json<TransitionBody>>,
    target: IssueStatus,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesWrite)?;

    let resolution = body.and_then(|Json(b)| b.resolution);
    let issue = state
        .store
        .update_issue_status(ctx.org_id, issue_id, target, resolution, Utc::now())
        .await?
        .ok_or_else(|| ApiError::not_found("issue"))?;

    let event_type = match target {
        IssueStatus::Acknowledged => AlertEventType::IssueAcknowledged,
        IssueStatus::Resolved => AlertEventType::IssueResolved,
        IssueStatus::Dismissed => AlertEventType::IssueDismissed,
        IssueStatus::Open => AlertEventType::IssueCreated,
    };
    state
        .dispatcher
        .dispatch(ctx.org_id, issue.clone(), event_type);

    state
        .store
        .insert_audit(AuditEntry {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            actor: format!("api_key:{}", ctx.api_key_id),
            action: format!("issue.{}", target.as_str()),
            entity_type: "issue".to_string(),
            entity_id: Some(issue.id.to_string()),
            detail: json!({ "status": target.as_str() }),
            created_at: Utc::now(),
        })
        .await?;

    Ok(Json(json!({ "issue": issue })))
}

fn parse_filter<T: std::str::FromStr<Err = String>>(
    raw: Option<&str>,
    field: &str,
) -> Result<Option<T>> {
    raw.map(|value| {
        value
            .parse::<T>()
            .map_err(|e| ApiError::validation_with(format!("invalid {}", field), json!(e)))
    })
    .transpose()
}
