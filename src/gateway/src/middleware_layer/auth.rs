//! API key authentication
//!
//! `Authorization: Bearer rev_{64-hex}`. The presented key is hashed with
//! SHA-256 and looked up; the row binds the tenant. Expired keys get a
//! distinct 401; a key whose organization row vanished is 404.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use revwatch_security::{api_keys, API_KEY_PREFIX};
use revwatch_shared::ApiScope;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated tenant context attached to the request
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub org_id: Uuid,
    pub api_key_id: Uuid,
    pub scopes: Vec<ApiScope>,
}

impl AuthContext {
    /// Empty scope set = full access (legacy keys)
    pub fn require(&self, scope: ApiScope) -> Result<(), ApiError> {
        if self.scopes.is_empty() || self.scopes.contains(&scope) {
            Ok(())
        } else {
            Err(ApiError::Scope {
                scope: scope.as_str(),
            })
        }
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::auth("missing Authorization header"))?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::auth("expected Bearer token"))?;
    if !token.starts_with(API_KEY_PREFIX) {
        return Err(ApiError::auth("unrecognized API key format"));
    }

    let key = state
        .store
        .find_api_key_by_hash(&api_keys::hash_api_key(token))
        .await?
        .ok_or_else(|| ApiError::auth("invalid API key"))?;

    if key.is_expired(Utc::now()) {
        return Err(ApiError::auth("expired"));
    }

    // The key must still bind to a live tenant
    state
        .store
        .get_org(key.org_id)
        .await?
        .ok_or_else(|| ApiError::not_found("organization"))?;

    request.extensions_mut().insert(AuthContext {
        org_id: key.org_id,
        api_key_id: key.id,
        scopes: key.scopes,
    });

    Ok(next.run(request).await)
}
