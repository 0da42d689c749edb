//! Tenant-scoped entity definitions
//!
//! Every entity is owned by an [`Organization`] through its `org_id`; no
//! query path may cross tenants. These structs are the storage contract's
//! vocabulary — the database crate maps them to and from rows, the
//! services operate on them directly.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::core::*;

static SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").expect("slug regex"));

/// Isolation unit. Slug uniqueness is global.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    /// URL-safe slug: 3-64 chars, lowercase alphanumeric with interior dashes
    pub fn is_valid_slug(slug: &str) -> bool {
        (3..=64).contains(&slug.len()) && SLUG_RE.is_match(slug)
    }
}

/// API key row. The plaintext is returned exactly once at creation; only
/// the SHA-256 hash and an 8-char prefix are persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub org_id: Uuid,
    pub key_hash: String,
    pub key_prefix: String,
    pub scopes: Vec<ApiScope>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Empty scope set = full access (legacy keys)
    pub fn allows(&self, scope: ApiScope) -> bool {
        self.scopes.is_empty() || self.scopes.contains(&scope)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Provider connection for one (org, source) pair. Credentials and the
/// webhook secret are stored through the credential vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConnection {
    pub id: Uuid,
    pub org_id: Uuid,
    pub source: Source,
    pub credentials_enc: String,
    pub webhook_secret_enc: Option<String>,
    /// Customer-configured forwarding URL; deliveries are mirrored there
    /// fire-and-forget after the 200 response
    pub proxy_url: Option<String>,
    pub is_active: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_webhook_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Canonical person. Provider identities hang off this row through
/// [`UserIdentity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub email: Option<String>,
    pub external_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One edge of the cross-platform identity graph. Unique on
/// (org_id, source, id_type, external_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub source: Source,
    pub id_type: IdentityType,
    pub external_id: String,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Identifier tuple emitted by a normalizer to drive identity resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityHint {
    pub source: Source,
    pub id_type: IdentityType,
    pub external_id: String,
    pub metadata: Option<Value>,
}

impl IdentityHint {
    pub fn new(source: Source, id_type: IdentityType, external_id: impl Into<String>) -> Self {
        Self {
            source,
            id_type,
            external_id: external_id.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Product catalog entry; `external_ids` maps source name to the
/// provider-side product/plan identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub external_ids: HashMap<String, String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// One append-only entry of an entitlement's state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementTransition {
    pub from: EntitlementState,
    pub to: EntitlementState,
    pub event_id: Option<Uuid>,
    pub at: DateTime<Utc>,
}

/// Authoritative per-platform subscription view. Unique on
/// (org_id, user_id, product_id, source); created on first event touching
/// the tuple and never destroyed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub product_id: Option<Uuid>,
    pub source: Source,
    pub state: EntitlementState,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub plan_amount_cents: Option<i64>,
    pub state_history: Vec<EntitlementTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Provider-agnostic normalized event. Immutable once written; unique on
/// (org_id, idempotency_key).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub source: Source,
    pub source_event_type: String,
    pub event_type: CanonicalEventType,
    pub event_time: DateTime<Utc>,
    pub status: EventStatus,
    pub user_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub external_subscription_id: Option<String>,
    pub external_event_id: Option<String>,
    pub idempotency_key: String,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub period_type: Option<PeriodType>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub environment: Environment,
    pub raw_payload: Value,
    pub ingested_at: DateTime<Utc>,
}

/// An anomaly as produced by a detector, before dedup and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedIssue {
    pub user_id: Option<Uuid>,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub title: String,
    pub description: String,
    pub estimated_revenue_cents: Option<i64>,
    pub confidence: f64,
    pub detector_id: String,
    pub detection_tier: DetectionTier,
    pub evidence: Value,
    /// Dedup scope for aggregate issues with no user; derived from the
    /// evidence (e.g. the source name for a delivery gap)
    pub scope_key: Option<String>,
}

/// Persisted anomaly. At most one row with status `open` exists per
/// (org_id, user_id, issue_type) — or per (org_id, issue_type, scope_key)
/// when user_id is null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub issue_type: IssueType,
    pub severity: IssueSeverity,
    pub status: IssueStatus,
    pub title: String,
    pub description: String,
    pub estimated_revenue_cents: Option<i64>,
    pub confidence: f64,
    pub detector_id: String,
    pub detection_tier: DetectionTier,
    pub evidence: Value,
    pub scope_key: Option<String>,
    pub resolution: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub ai_summary: Option<String>,
    pub ai_summary_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Issue {
    /// 24 h freshness window on the cached AI summary
    pub fn ai_summary_fresh(&self, now: DateTime<Utc>) -> bool {
        self.ai_summary_at
            .map(|at| now - at < chrono::Duration::hours(24))
            .unwrap_or(false)
    }
}

/// Audit row for every inbound delivery, sanitized before storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub org_id: Uuid,
    pub source: Source,
    pub processing_status: ProcessingStatus,
    pub event_type: Option<String>,
    pub external_event_id: Option<String>,
    pub error_message: Option<String>,
    pub headers: Value,
    pub body: Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Customer-application-reported access observation (tier-2 input)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessCheck {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub product_id: Option<Uuid>,
    pub external_user_id: String,
    pub has_access: bool,
    pub reported_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Per (org, channel) alert routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: Uuid,
    pub org_id: Uuid,
    pub channel: AlertChannel,
    pub endpoint_url: Option<String>,
    pub signing_secret: Option<String>,
    pub routing_key: Option<String>,
    pub slack_channel: Option<String>,
    /// None admits every event type
    pub event_types: Option<Vec<AlertEventType>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl AlertConfig {
    pub fn admits(&self, event_type: AlertEventType) -> bool {
        match &self.event_types {
            None => true,
            Some(types) => types.contains(&event_type),
        }
    }
}

/// Append-only audit trail of state-changing operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub org_id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_validation() {
        assert!(Organization::is_valid_slug("acme"));
        assert!(Organization::is_valid_slug("acme-corp-2"));
        assert!(!Organization::is_valid_slug("ab"));
        assert!(!Organization::is_valid_slug("-acme"));
        assert!(!Organization::is_valid_slug("acme-"));
        assert!(!Organization::is_valid_slug("Acme"));
        assert!(!Organization::is_valid_slug(&"a".repeat(65)));
        assert!(Organization::is_valid_slug(&"a".repeat(64)));
    }

    #[test]
    fn test_empty_scope_set_is_full_access() {
        let key = ApiKey {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            key_hash: "h".into(),
            key_prefix: "rev_abcd".into(),
            scopes: vec![],
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
        };
        assert!(key.allows(ApiScope::IssuesWrite));
        assert!(key.allows(ApiScope::AdminRead));
    }

    #[test]
    fn test_scoped_key_denies_unlisted_scope() {
        let key = ApiKey {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            key_hash: "h".into(),
            key_prefix: "rev_abcd".into(),
            scopes: vec![ApiScope::IssuesRead],
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
        };
        assert!(key.allows(ApiScope::IssuesRead));
        assert!(!key.allows(ApiScope::IssuesWrite));
    }

    #[test]
    fn test_alert_config_event_filter() {
        let mut config = AlertConfig {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            channel: AlertChannel::Webhook,
            endpoint_url: Some("https://example.com/hooks".into()),
            signing_secret: None,
            routing_key: None,
            slack_channel: None,
            event_types: None,
            is_active: true,
            created_at: Utc::now(),
        };
        assert!(config.admits(AlertEventType::IssueCreated));

        config.event_types = Some(vec![AlertEventType::IssueResolved]);
        assert!(!config.admits(AlertEventType::IssueCreated));
        assert!(config.admits(AlertEventType::IssueResolved));
    }
}
