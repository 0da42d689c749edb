//! Onboarding and credential installation
//!
//! `POST /v1/setup/org` is the only unauthenticated write: it creates the
//! tenant and returns the API key plaintext exactly once. Everything else
//! requires the `setup:manage` scope.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;
use validator::Validate;

use revwatch_security::generate_api_key;
use revwatch_shared::{
    ApiKey, ApiScope, AuditEntry, BillingConnection, Organization, Source, SyncStatus,
};

use crate::error::{ApiError, Result};
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrgRequest {
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 3, max = 64))]
    pub slug: String,
}

pub async fn create_org(
    State(state): State<AppState>,
    Json(request): Json<CreateOrgRequest>,
) -> Result<Json<Value>> {
    request
        .validate()
        .map_err(|e| ApiError::validation_with("invalid organization", json!(e.to_string())))?;
    if !Organization::is_valid_slug(&request.slug) {
        return Err(ApiError::validation_with(
            "invalid slug",
            json!({ "pattern": "[a-z0-9][a-z0-9-]*[a-z0-9]", "length": "3-64" }),
        ));
    }

    let now = Utc::now();
    let org = state
        .store
        .create_org(Organization {
            id: Uuid::new_v4(),
            slug: request.slug,
            name: request.name,
            created_at: now,
        })
        .await
        .map_err(|err| {
            if err.is_conflict() {
                ApiError::conflict("organization slug already taken")
            } else {
                err.into()
            }
        })?;

    let generated = generate_api_key();
    state
        .store
        .insert_api_key(ApiKey {
            id: Uuid::new_v4(),
            org_id: org.id,
            key_hash: generated.key_hash.clone(),
            key_prefix: generated.key_prefix.clone(),
            scopes: Vec::new(),
            expires_at: None,
            revoked_at: None,
            created_at: now,
        })
        .await?;

    state
        .store
        .insert_audit(AuditEntry {
            id: Uuid::new_v4(),
            org_id: org.id,
            actor: "setup".to_string(),
            action: "org.create".to_string(),
            entity_type: "organization".to_string(),
            entity_id: Some(org.id.to_string()),
            detail: json!({ "slug": org.slug }),
            created_at: now,
        })
        .await?;

    // The plaintext key leaves the process exactly here, once
    Ok(Json(json!({
        "organization": { "id": org.id, "slug": org.slug, "name": org.name },
        "apiKey": generated.plaintext,
        "keyPrefix": generated.key_prefix,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSourceRequest {
    pub credentials: Value,
    pub webhook_secret: Option<String>,
    pub proxy_url: Option<String>,
}

pub async fn install_source(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(source_raw): Path<String>,
    Json(request): Json<InstallSourceRequest>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::SetupManage)?;
    let source: Source = source_raw
        .parse()
        .map_err(|_| ApiError::not_found("source"))?;

    let credentials_plain = match &request.credentials {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };
    let credentials_enc = state.vault.encrypt(&credentials_plain)?;
    let webhook_secret_enc = request
        .webhook_secret
        .as_deref()
        .map(|secret| state.vault.encrypt(secret))
        .transpose()?;

    let now = Utc::now();
    let connection = state
        .store
        .upsert_connection(BillingConnection {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            source,
            credentials_enc,
            webhook_secret_enc,
            proxy_url: request.proxy_url,
            is_active: true,
            last_sync_at: None,
            last_webhook_at: None,
            sync_status: SyncStatus::Pending,
            created_at: now,
            updated_at: now,
        })
        .await?;

    state
        .store
        .insert_audit(AuditEntry {
            id: Uuid::new_v4(),
            org_id: ctx.org_id,
            actor: format!("api_key:{}", ctx.api_key_id),
            action: "connection.install".to_string(),
            entity_type: "billing_connection".to_string(),
            entity_id: Some(source.as_str().to_string()),
            detail: json!({ "source": source.as_str() }),
            created_at: now,
        })
        .await?;

    Ok(Json(json!({
        "ok": true,
        "source": connection.source.as_str(),
        "webhookPath": format!("/webhooks/{{org_slug}}/{}", connection.source),
    })))
}

pub async fn verify_source(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(source_raw): Path<String>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::SetupManage)?;
    let source: Source = source_raw
        .parse()
        .map_err(|_| ApiError::not_found("source"))?;

    let connection = state
        .store
        .get_connection(ctx.org_id, source)
        .await?
        .ok_or_else(|| ApiError::not_found("billing connection"))?;

    // Credentials must decrypt under the current key set
    state.vault.decrypt(&connection.credentials_enc)?;
    if let Some(secret) = &connection.webhook_secret_enc {
        state.vault.decrypt(secret)?;
    }

    Ok(Json(json!({
        "ok": true,
        "source": source.as_str(),
        "webhookSecretInstalled": connection.webhook_secret_enc.is_some(),
    })))
}

pub async fn status(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::SetupManage)?;

    let connections = state.store.list_connections(ctx.org_id).await?;
    let sources: Vec<Value> = connections
        .iter()
        .map(|c| {
            json!({
                "source": c.source.as_str(),
                "isActive": c.is_active,
                "syncStatus": c.sync_status.as_str(),
                "lastWebhookAt": c.last_webhook_at,
                "lastSyncAt": c.last_sync_at,
                "webhookSecretInstalled": c.webhook_secret_enc.is_some(),
            })
        })
        .collect();

    let keys = state.store.list_api_keys(ctx.org_id).await?;
    let keys: Vec<Value> = keys
        .iter()
        .map(|k| {
            json!({
                "id": k.id,
                "prefix": k.key_prefix,
                "scopes": k.scopes,
                "expiresAt": k.expires_at,
                "revokedAt": k.revoked_at,
            })
        })
        .collect();

    Ok(Json(json!({ "sources": sources, "apiKeys": keys })))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(key_id): Path<Uuid>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::SetupManage)?;
    let revoked = state.store.revoke_api_key(ctx.org_id, key_id).await?;
    if !revoked {
        return Err(ApiError::not_found("api key"));
    }
    Ok(Json(json!({ "ok": true })))
}

pub async fn integration_health(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>> {
    ctx.require(ApiScope::IssuesRead)?;
    let health = state
        .store
        .integration_health(ctx.org_id, Utc::now())
        .await?;
    Ok(Json(json!({ "integrations": health })))
}
