//! The webhook receiver
//!
//! `POST /webhooks/{org_slug}/{source}`. Accepts the raw bytes, writes a
//! sanitized log row, verifies the signature when the connection has a
//! secret, and enqueues for the worker pool. The 200 goes out before any
//! heavy processing; under burst load the queue is the shock absorber.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use revwatch_ingestion::WebhookJob;
use revwatch_normalizer::dispatch as normalizer;
use revwatch_shared::{sanitize, ProcessingStatus, Source, WebhookLog};

use crate::error::{ApiError, Result};
use crate::state::AppState;

pub async fn receive(
    State(state): State<AppState>,
    Path((slug, source_raw)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let org = state
        .store
        .get_org_by_slug(&slug)
        .await?
        .ok_or_else(|| ApiError::not_found("organization"))?;

    let source: Source = source_raw
        .parse()
        .map_err(|_| ApiError::not_found("source"))?;

    if !state.webhook_limiter.check(&org.id.to_string()) {
        return Err(ApiError::RateLimit);
    }

    let connection = state
        .store
        .get_connection(org.id, source)
        .await?
        .filter(|c| c.is_active)
        .ok_or_else(|| ApiError::not_found("billing connection"))?;

    let raw_headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let received_at = Utc::now();
    let log = state
        .store
        .insert_webhook_log(WebhookLog {
            id: Uuid::new_v4(),
            org_id: org.id,
            source,
            processing_status: ProcessingStatus::Received,
            event_type: None,
            external_event_id: None,
            error_message: None,
            headers: sanitize::sanitize_headers(
                raw_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            ),
            body: sanitize::body_for_storage(&body),
            created_at: received_at,
            processed_at: None,
        })
        .await?;

    // Verification is skipped only when no secret is installed (dev mode)
    if let Some(secret_enc) = &connection.webhook_secret_enc {
        let secret = state.vault.decrypt(secret_enc)?;
        let valid =
            normalizer::verify_signature(source, &body, &raw_headers, &secret, received_at);
        if !valid {
            warn!(org = %org.slug, source = %source, "webhook signature rejected");
            state
                .store
                .update_webhook_log(
                    org.id,
                    log.id,
                    ProcessingStatus::Failed,
                    Some("signature_invalid".to_string()),
                    None,
                )
                .await?;
            return Err(ApiError::auth("signature_invalid"));
        }
    } else {
        debug!(org = %org.slug, source = %source, "no webhook secret installed, skipping verification");
    }

    state
        .store
        .touch_connection_webhook(org.id, source, received_at)
        .await?;

    state
        .queue
        .enqueue(WebhookJob {
            org_id: org.id,
            source,
            webhook_log_id: log.id,
            raw_body: body.to_vec(),
            raw_headers,
            received_at,
            trusted: false,
            attempt: 0,
        })
        .await
        .map_err(|err| ApiError::Dependency {
            service: format!("webhook queue: {}", err),
        })?;

    // Optional customer-side mirror, after the fact and best effort
    if let Some(proxy_url) = connection.proxy_url.clone() {
        let bytes = body.to_vec();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            if let Err(err) = client
                .post(&proxy_url)
                .timeout(std::time::Duration::from_secs(10))
                .body(bytes)
                .send()
                .await
            {
                debug!(error = %err, "webhook proxy forward failed");
            }
        });
    }

    Ok(Json(json!({ "ok": true, "webhookLogId": log.id })))
}
