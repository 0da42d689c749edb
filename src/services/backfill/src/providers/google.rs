//! Google Play import
//!
//! Play has no subscription list API. The caller supplies known purchase
//! tokens; each is resolved via `purchases/subscriptionsv2/tokens/{token}`
//! and the Voided Purchases API fills in refunds. API auth is an OAuth2
//! service-account JWT exchange against the Google token endpoint.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use revwatch_breaker::CircuitBreaker;

use crate::error::{BackfillError, Result};
use crate::providers::{read_json_response, Page};

pub const API_BASE: &str = "https://androidpublisher.googleapis.com";
pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/androidpublisher";
const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccount {
    pub client_email: String,
    pub private_key: String,
}

#[derive(Debug, Serialize)]
struct TokenClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

pub struct GoogleClient {
    client: Client,
    base_url: String,
    token_url: String,
    package_name: String,
    service_account: ServiceAccount,
    breaker: Arc<CircuitBreaker>,
}

impl GoogleClient {
    pub fn new(
        client: Client,
        package_name: String,
        service_account: ServiceAccount,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            client,
            base_url: API_BASE.to_string(),
            token_url: TOKEN_URL.to_string(),
            package_name,
            service_account,
            breaker,
        }
    }

    pub fn with_base_url(mut self, base_url: String, token_url: String) -> Self {
        self.base_url = base_url;
        self.token_url = token_url;
        self
    }

    /// Exchange a signed service-account JWT for an access token
    pub async fn oauth_token(&self) -> Result<String> {
        self.breaker.try_acquire()?;
        let result = async {
            let now = Utc::now().timestamp();
            let claims = TokenClaims {
                iss: &self.service_account.client_email,
                scope: SCOPE,
                aud: &self.token_url,
                exp: now + 3600,
                iat: now,
            };
            let key = EncodingKey::from_rsa_pem(self.service_account.private_key.as_bytes())
                .map_err(|e| BackfillError::credentials(format!("service account key: {}", e)))?;
            let assertion = encode(&Header::new(Algorithm::RS256), &claims, &key)
                .map_err(|e| BackfillError::credentials(format!("JWT signing: {}", e)))?;

            let response = self
                .client
                .post(&self.token_url)
                .timeout(TIMEOUT)
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
                .send()
                .await?;
            let body = read_json_response(response).await?;
            body.get("access_token")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| BackfillError::credentials("token response missing access_token"))
        }
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    /// Resolve one purchase token to its subscription state
    pub async fn get_subscription(&self, access_token: &str, purchase_token: &str) -> Result<Value> {
        self.breaker.try_acquire()?;
        let result = async {
            let url = format!(
                "{}/androidpublisher/v3/applications/{}/purchases/subscriptionsv2/tokens/{}",
                self.base_url, self.package_name, purchase_token
            );
            let response = self
                .client
                .get(url)
                .timeout(TIMEOUT)
                .bearer_auth(access_token)
                .send()
                .await?;
            read_json_response(response).await
        }
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    /// One page of the Voided Purchases API
    pub async fn list_voided_purchases(
        &self,
        access_token: &str,
        page_token: Option<&str>,
    ) -> Result<Page> {
        self.breaker.try_acquire()?;
        let result = async {
            let mut url = format!(
                "{}/androidpublisher/v3/applications/{}/purchases/voidedpurchases",
                self.base_url, self.package_name
            );
            if let Some(token) = page_token {
                url.push_str(&format!("?token={}", token));
            }
            let response = self
                .client
                .get(url)
                .timeout(TIMEOUT)
                .bearer_auth(access_token)
                .send()
                .await?;
            let body = read_json_response(response).await?;
            let items = body
                .get("voidedPurchases")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let next_cursor = body
                .get("tokenPagination")
                .and_then(|p| p.get("nextPageToken"))
                .and_then(Value::as_str)
                .map(String::from);
            Ok::<Page, BackfillError>(Page { items, next_cursor })
        }
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }
}

/// Map a subscriptionsv2 resource onto an RTDN notification type
fn notification_type_for_state(state: Option<&str>) -> i64 {
    match state {
        Some("SUBSCRIPTION_STATE_ACTIVE") => 4,
        Some("SUBSCRIPTION_STATE_IN_GRACE_PERIOD") => 6,
        Some("SUBSCRIPTION_STATE_ON_HOLD") => 5,
        Some("SUBSCRIPTION_STATE_PAUSED") => 10,
        Some("SUBSCRIPTION_STATE_CANCELED") => 3,
        Some("SUBSCRIPTION_STATE_EXPIRED") => 13,
        _ => 4,
    }
}

/// Wrap a resolved subscription as a Pub/Sub RTDN envelope
pub fn synthesize_subscription_payload(
    package_name: &str,
    purchase_token: &str,
    subscription: &Value,
    run_id: &str,
) -> Vec<u8> {
    let state = subscription
        .get("subscriptionState")
        .and_then(Value::as_str);
    let subscription_id = subscription
        .get("lineItems")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("productId"))
        .and_then(Value::as_str)
        .unwrap_or_default();

    let notification = json!({
        "version": "1.0",
        "packageName": package_name,
        "eventTimeMillis": Utc::now().timestamp_millis().to_string(),
        "subscriptionNotification": {
            "version": "1.0",
            "notificationType": notification_type_for_state(state),
            "purchaseToken": purchase_token,
            "subscriptionId": subscription_id,
        },
    });
    envelope(&notification, purchase_token, run_id)
}

/// Wrap a voided purchase as a refund notification
pub fn synthesize_voided_payload(package_name: &str, voided: &Value, run_id: &str) -> Option<Vec<u8>> {
    let purchase_token = voided.get("purchaseToken").and_then(Value::as_str)?;
    let notification = json!({
        "version": "1.0",
        "packageName": package_name,
        "eventTimeMillis": Utc::now().timestamp_millis().to_string(),
        "voidedPurchaseNotification": {
            "purchaseToken": purchase_token,
            "orderId": voided.get("orderId").cloned().unwrap_or(Value::Null),
            "productType": voided.get("productType").cloned().unwrap_or(Value::Null),
        },
    });
    Some(envelope(&notification, purchase_token, run_id))
}

fn envelope(notification: &Value, purchase_token: &str, run_id: &str) -> Vec<u8> {
    json!({
        "message": {
            "data": BASE64.encode(notification.to_string().as_bytes()),
            "messageId": format!("backfill_{}_{}", purchase_token, run_id),
        },
        "subscription": "backfill",
    })
    .to_string()
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            notification_type_for_state(Some("SUBSCRIPTION_STATE_ACTIVE")),
            4
        );
        assert_eq!(
            notification_type_for_state(Some("SUBSCRIPTION_STATE_EXPIRED")),
            13
        );
        assert_eq!(notification_type_for_state(None), 4);
    }

    #[test]
    fn test_synthesized_envelope_normalizes() {
        let subscription = json!({
            "subscriptionState": "SUBSCRIPTION_STATE_ACTIVE",
            "lineItems": [{"productId": "monthly_pro"}]
        });
        let raw = synthesize_subscription_payload("com.example.app", "tok-1", &subscription, "run5");
        let events = revwatch_normalizer::google::normalize(
            uuid::Uuid::new_v4(),
            &raw,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].idempotency_key, "google:backfill_tok-1_run5:4");
    }

    #[test]
    fn test_voided_purchase_becomes_refund() {
        let voided = json!({"purchaseToken": "tok-2", "orderId": "GPA.1"});
        let raw = synthesize_voided_payload("com.example.app", &voided, "run5").unwrap();
        let events = revwatch_normalizer::google::normalize(
            uuid::Uuid::new_v4(),
            &raw,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            events[0].event_type,
            revwatch_shared::CanonicalEventType::Refund
        );
    }
}
