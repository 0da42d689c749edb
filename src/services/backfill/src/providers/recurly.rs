//! Recurly import
//!
//! `GET /subscriptions?state=all&limit=200&sort=created_at&order=asc`
//! paginated via `has_more` and the `next` path.

use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use revwatch_breaker::CircuitBreaker;

use crate::error::{BackfillError, Result};
use crate::providers::{read_json_response, Page};

pub const API_BASE: &str = "https://v3.recurly.com";
const PAGE_LIMIT: u32 = 200;
const TIMEOUT: Duration = Duration::from_secs(10);

pub struct RecurlyClient {
    client: Client,
    base_url: String,
    api_key: String,
    breaker: Arc<CircuitBreaker>,
}

impl RecurlyClient {
    pub fn new(client: Client, api_key: String, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            client,
            base_url: API_BASE.to_string(),
            api_key,
            breaker,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// `cursor` is the `next` path returned by the previous page
    pub async fn list_subscriptions(&self, cursor: Option<&str>) -> Result<Page> {
        self.breaker.try_acquire()?;
        let result = async {
            let url = match cursor {
                Some(next) => format!("{}{}", self.base_url, next),
                None => format!(
                    "{}/subscriptions?state=all&limit={}&sort=created_at&order=asc",
                    self.base_url, PAGE_LIMIT
                ),
            };
            let response = self
                .client
                .get(url)
                .timeout(TIMEOUT)
                .basic_auth(&self.api_key, None::<&str>)
                .header("Accept", "application/vnd.recurly.v2021-02-25")
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
                body.get("next").and_then(Value::as_str).map(String::from)
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

/// Wrap a subscription object as a `new_subscription_notification`
pub fn synthesize_subscription_payload(subscription: &Value, run_id: &str) -> Option<Vec<u8>> {
    let uuid = subscription
        .get("uuid")
        .or_else(|| subscription.get("id"))
        .and_then(Value::as_str)?;
    let payload = json!({
        "id": format!("backfill_sub_{}_{}", uuid, run_id),
        "event_type": "new_subscription_notification",
        "account": subscription.get("account").cloned().unwrap_or(Value::Null),
        "subscription": {
            "uuid": uuid,
            "unit_amount_in_cents": subscription
                .get("unit_amount")
                .and_then(Value::as_f64)
                .map(|units| (units * 100.0).round() as i64),
            "current_period_ends_at": subscription
                .get("current_period_ends_at")
                .cloned()
                .unwrap_or(Value::Null),
        },
    });
    Some(payload.to_string().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use revwatch_breaker::BreakerConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_follows_next_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"uuid": "r-1"}],
                "has_more": true,
                "next": "/subscriptions?cursor=abc"
            })))
            .mount(&server)
            .await;

        let client = RecurlyClient::new(
            Client::new(),
            "key".into(),
            Arc::new(CircuitBreaker::new("recurly-backfill", BreakerConfig::default())),
        )
        .with_base_url(server.uri());

        let page = client.list_subscriptions(None).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("/subscriptions?cursor=abc"));
    }

    #[test]
    fn test_synthesized_payload_has_run_suffix() {
        let subscription = json!({
            "uuid": "r-uuid-1",
            "unit_amount": 19.99,
            "account": {"account_code": "acct-1"}
        });
        let raw = synthesize_subscription_payload(&subscription, "run3").unwrap();
        let parsed: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(parsed["id"], "backfill_sub_r-uuid-1_run3");
        assert_eq!(parsed["subscription"]["unit_amount_in_cents"], 1999);
    }
}
