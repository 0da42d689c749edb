//! Signed outbound webhooks
//!
//! Envelope: `{id, eventType, timestamp, apiVersion, data: {issue}}`.
//! Signature header `X-Sig-Signature: t={unix},v1={hex_hmac_sha256}` over
//! `"{t}.{body}"` with the config's signing secret (a `whsec_` prefix is
//! stripped before the HMAC). Receivers verify within a 300 s window and
//! dedupe on `X-Sig-Delivery`.

use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

use revwatch_security::build_signature_header;
use revwatch_shared::{AlertConfig, AlertEventType, Issue};

use crate::error::{AlertError, Result};

pub const API_VERSION: &str = "2024-11-01";
const TIMEOUT: Duration = Duration::from_secs(10);

/// The serialized envelope plus the headers it must ship with
#[derive(Debug, Clone)]
pub struct SignedDelivery {
    pub body: String,
    pub delivery_id: Uuid,
    pub event_type: AlertEventType,
    pub signature: Option<String>,
}

/// Build the envelope and signature for one delivery. Pure; the HTTP
/// POST happens in [`deliver`].
pub fn build_delivery(
    config: &AlertConfig,
    issue: &Issue,
    event_type: AlertEventType,
    dashboard_url: Option<&str>,
    delivery_id: Uuid,
) -> Result<SignedDelivery> {
    let mut issue_json = serde_json::to_value(issue)
        .map_err(|e| AlertError::transport(format!("issue serialization: {}", e)))?;
    if let (Some(base), Value::Object(map)) = (dashboard_url, &mut issue_json) {
        map.insert(
            "dashboardUrl".to_string(),
            json!(format!("{}/issues/{}", base.trim_end_matches('/'), issue.id)),
        );
    }

    let envelope = json!({
        "id": delivery_id,
        "eventType": event_type.as_str(),
        "timestamp": Utc::now().to_rfc3339(),
        "apiVersion": API_VERSION,
        "data": { "issue": issue_json },
    });
    let body = envelope.to_string();

    let signature = config
        .signing_secret
        .as_deref()
        .map(|secret| build_signature_header(secret, Utc::now().timestamp(), body.as_bytes()));

    Ok(SignedDelivery {
        body,
        delivery_id,
        event_type,
        signature,
    })
}

pub async fn deliver(client: &Client, config: &AlertConfig, delivery: &SignedDelivery) -> Result<()> {
    let url = config
        .endpoint_url
        .as_deref()
        .ok_or_else(|| AlertError::misconfigured("webhook", "missing endpoint_url"))?;

    let mut request = client
        .post(url)
        .timeout(TIMEOUT)
        .header("Content-Type", "application/json")
        .header("X-Sig-Event", delivery.event_type.as_str())
        .header("X-Sig-Delivery", delivery.delivery_id.to_string());
    if let Some(signature) = &delivery.signature {
        request = request.header("X-Sig-Signature", signature);
    }

    let response = request.body(delivery.body.clone()).send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(AlertError::HttpStatus {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}
