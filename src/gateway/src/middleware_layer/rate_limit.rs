//! Inbound burst guard
//!
//! A per-key token bucket refilled once a minute. The webhook receiver
//! keys by tenant so a noisy integration cannot starve its neighbors;
//! the API layer keys by API key.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::ApiError;
use crate::middleware_layer::auth::AuthContext;
use crate::state::AppState;

pub struct TokenBucketLimiter {
    buckets: DashMap<String, (u32, i64)>,
    max_tokens: u32,
    refill_interval_secs: i64,
}

impl TokenBucketLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens: max_per_minute,
            refill_interval_secs: 60,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        let now = Utc::now().timestamp();
        let mut entry = self
            .buckets
            .entry(key.to_string())
            .or_insert((self.max_tokens, now));

        if now - entry.1 >= self.refill_interval_secs {
            entry.0 = self.max_tokens;
            entry.1 = now;
        }

        if entry.0 > 0 {
            entry.0 -= 1;
            true
        } else {
            false
        }
    }
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = request
        .extensions()
        .get::<AuthContext>()
        .map(|ctx| ctx.api_key_id.to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    if !state.api_limiter.check(&key) {
        return Err(ApiError::RateLimit);
    }
    Ok(next.run(request).await)
}
