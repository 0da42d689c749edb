//! Webhook delivery gap: an active connection has gone quiet for longer
//! than the provider's expected delivery cadence.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{DetectedIssue, DetectionTier, IssueSeverity, IssueType, Source};

use crate::error::Result;
use crate::Detector;

const CONFIDENCE: f64 = 0.75;
/// Gap beyond which the aggregate issue escalates to critical
const CRITICAL_HOURS: i64 = 24;

pub struct WebhookDeliveryGap {
    default_threshold_hours: i64,
}

impl Default for WebhookDeliveryGap {
    fn default() -> Self {
        Self {
            default_threshold_hours: 6,
        }
    }
}

impl WebhookDeliveryGap {
    /// High-volume providers are expected to deliver far more often than
    /// store platforms that only notify on subscription lifecycle edges
    fn threshold_hours(&self, source: Source) -> i64 {
        match source {
            Source::Stripe => self.default_threshold_hours,
            Source::Recurly | Source::Braintree => 12,
            Source::Apple | Source::Google => 24,
        }
    }
}

#[async_trait]
impl Detector for WebhookDeliveryGap {
    fn id(&self) -> &'static str {
        "webhook_delivery_gap"
    }

    fn name(&self) -> &'static str {
        "Webhook delivery gap"
    }

    fn description(&self) -> &'static str {
        "Active connections that have stopped receiving webhooks"
    }

    async fn scheduled_scan(&self, store: &dyn Store, org_id: Uuid) -> Result<Vec<DetectedIssue>> {
        let now = Utc::now();
        let mut found = Vec::new();

        for conn in store.list_connections(org_id).await? {
            if !conn.is_active {
                continue;
            }
            // A connection that never received anything is a setup issue,
            // not a delivery gap; measure from the last delivery only
            let Some(last) = conn.last_webhook_at else {
                continue;
            };

            let hours = (now - last).num_hours();
            let threshold = self.threshold_hours(conn.source);
            if hours < threshold {
                continue;
            }

            let severity = if hours >= CRITICAL_HOURS {
                IssueSeverity::Critical
            } else {
                IssueSeverity::Warning
            };

            found.push(DetectedIssue {
                user_id: None,
                issue_type: IssueType::WebhookDeliveryGap,
                severity,
                title: format!("No {} webhooks for {} hours", conn.source, hours),
                description: format!(
                    "The {} connection is active but has not received a webhook \
                     since {}. Deliveries may be failing upstream or the endpoint \
                     registration may have been removed.",
                    conn.source,
                    last.to_rfc3339()
                ),
                estimated_revenue_cents: None,
                confidence: CONFIDENCE,
                detector_id: self.id().to_string(),
                detection_tier: DetectionTier::BillingOnly,
                evidence: json!({
                    "source": conn.source.as_str(),
                    "hoursSinceLastWebhook": hours,
                    "thresholdHours": threshold,
                    "lastWebhookAt": last.to_rfc3339(),
                }),
                scope_key: Some(conn.source.as_str().to_string()),
            });
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use revwatch_database::MemoryStore;
    use revwatch_shared::*;
    use std::sync::Arc;

    async fn connection_with_gap(
        store: &MemoryStore,
        org: Uuid,
        source: Source,
        hours_ago: i64,
        active: bool,
    ) {
        store
            .upsert_connection(BillingConnection {
                id: Uuid::new_v4(),
                org_id: org,
                source,
                credentials_enc: "enc:v1:x:y:z".into(),
                webhook_secret_enc: None,
                proxy_url: None,
                is_active: active,
                last_sync_at: None,
                last_webhook_at: Some(Utc::now() - Duration::hours(hours_ago)),
                sync_status: SyncStatus::Synced,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_seven_hour_stripe_gap_is_warning() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        connection_with_gap(&store, org, Source::Stripe, 7, true).await;

        let found = WebhookDeliveryGap::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, IssueSeverity::Warning);
        assert_eq!(found[0].evidence["hoursSinceLastWebhook"], json!(7));
        assert_eq!(found[0].scope_key.as_deref(), Some("stripe"));
    }

    #[tokio::test]
    async fn test_day_long_gap_is_critical() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        connection_with_gap(&store, org, Source::Stripe, 30, true).await;

        let found = WebhookDeliveryGap::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert_eq!(found[0].severity, IssueSeverity::Critical);
    }

    #[tokio::test]
    async fn test_apple_tolerates_longer_gaps() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        connection_with_gap(&store, org, Source::Apple, 7, true).await;

        let found = WebhookDeliveryGap::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_inactive_connection_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let org = Uuid::new_v4();
        connection_with_gap(&store, org, Source::Stripe, 48, false).await;

        let found = WebhookDeliveryGap::default()
            .scheduled_scan(store.as_ref(), org)
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
