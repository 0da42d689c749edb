//! Stripe import
//!
//! Subscriptions via `GET /v1/subscriptions?status=all` expanded with
//! customer and latest invoice, cursor-paginated on `starting_after`;
//! then 30 days of historical events via `GET /v1/events`.

use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use revwatch_breaker::CircuitBreaker;

use crate::error::{BackfillError, Result};
use crate::providers::{read_json_response, Page};

pub const API_BASE: &str = "https://api.stripe.com";
const PAGE_LIMIT: u32 = 100;
const TIMEOUT: Duration = Duration::from_secs(10);

/// Historical event types worth replaying
pub const EVENT_TYPES: [&str; 4] = [
    "charge.refunded",
    "charge.dispute.created",
    "customer.subscription.deleted",
    "invoice.payment_failed",
];

pub struct StripeClient {
    client: Client,
    base_url: String,
    secret_key: String,
    breaker: Arc<CircuitBreaker>,
}

impl StripeClient {
    pub fn new(client: Client, secret_key: String, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client,
            base_url: API_BASE.to_string(),
            secret_key,
            breaker,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    pub async fn list_subscriptions(&self, starting_after: Option<&str>) -> Result<Page> {
        let mut query: Vec<(String, String)> = vec![
            ("status".into(), "all".into()),
            ("limit".into(), PAGE_LIMIT.to_string()),
            ("expand[]".into(), "data.customer".into()),
            ("expand[]".into(), "data.latest_invoice".into()),
        ];
        if let Some(cursor) = starting_after {
            query.push(("starting_after".into(), cursor.into()));
        }
        self.list("/v1/subscriptions", &query).await
    }

    pub async fn list_events(&self, created_gte: i64, starting_after: Option<&str>) -> Result<Page> {
        let mut query: Vec<(String, String)> = vec![
            ("limit".into(), PAGE_LIMIT.to_string()),
            ("created[gte]".into(), created_gte.to_string()),
        ];
        for event_type in EVENT_TYPES {
            query.push(("types[]".into(), event_type.into()));
        }
        if let Some(cursor) = starting_after {
            query.push(("starting_after".into(), cursor.into()));
        }
        self.list("/v1/events", &query).await
    }

    async fn list(&self, path: &str, query: &[(String, String)]) -> Result<Page> {
        self.breaker.try_acquire()?;
        let result = async {
            let response = self
                .client
                .get(format!("{}{}", self.base_url, path))
                .timeout(TIMEOUT)
                .basic_auth(&self.secret_key, None::<&str>)
                .query(query)
                .send()
                .await?;
            let body = read_json_response(response).await?;
            let items = body
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            let next_cursor = if has_more {
                items
                    .last()
                    .and_then(|item| item.get("id"))
                    .and_then(Value::as_str)
                    .map(String::from)
            } else {
                None
            };
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

/// Wrap a live subscription object as a `customer.subscription.created`
/// delivery. The synthetic event id carries the run id so a later live
/// webhook for the same subscription never collides.
pub fn synthesize_subscription_payload(subscription: &Value, run_id: &str) -> Option<Vec<u8>> {
    let sub_id = subscription.get("id").and_then(Value::as_str)?;
    let created = subscription
        .get("created")
        .and_then(Value::as_i64)
        .unwrap_or_default();
    let payload = json!({
        "id": format!("backfill_sub_{}_{}", sub_id, run_id),
        "type": "customer.subscription.created",
        "created": created,
        "livemode": subscription.get("livemode").and_then(Value::as_bool).unwrap_or(true),
        "data": { "object": subscription },
    });
    Some(payload.to_string().into_bytes())
}

/// Re-wrap a historical event under a run-suffixed id
pub fn synthesize_event_payload(event: &Value, run_id: &str) -> Option<Vec<u8>> {
    let event_id = event.get("id").and_then(Value::as_str)?;
    let mut payload = event.clone();
    payload["id"] = json!(format!("backfill_evt_{}_{}", event_id, run_id));
    Some(payload.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use revwatch_breaker::BreakerConfig;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("stripe-backfill", BreakerConfig::default()))
    }

    #[tokio::test]
    async fn test_pagination_follows_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/subscriptions"))
            .and(query_param("status", "all"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "sub_1"}, {"id": "sub_2"}],
                "has_more": true
            })))
            .mount(&server)
            .await;

        let client = StripeClient::new(Client::new(), "sk_test".into(), breaker())
            .with_base_url(server.uri());
        let page = client.list_subscriptions(None).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("sub_2"));
    }

    #[tokio::test]
    async fn test_api_error_trips_breaker_counter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let breaker = breaker();
        let client = StripeClient::new(Client::new(), "sk_test".into(), breaker.clone())
            .with_base_url(server.uri());
        let err = client.list_subscriptions(None).await.unwrap_err();
        assert!(matches!(err, BackfillError::ProviderApi { status: 500, .. }));
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[test]
    fn test_synthesized_payload_normalizes_with_run_suffix() {
        let subscription = json!({
            "id": "sub_123",
            "created": 1700000000,
            "customer": "cus_abc",
            "status": "active",
            "plan": {"amount": 1999},
            "currency": "usd"
        });
        let raw = synthesize_subscription_payload(&subscription, "run9").unwrap();
        let events = revwatch_normalizer::stripe::normalize(
            uuid::Uuid::new_v4(),
            &raw,
            chrono::Utc::now(),
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].idempotency_key, "stripe:backfill_sub_sub_123_run9");
    }
}
