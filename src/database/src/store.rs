//! The storage contract
//!
//! A narrow repository capability over the relational schema. Services
//! hold an `Arc<dyn Store>`; the test suite swaps in [`crate::MemoryStore`]
//! without touching service code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use revwatch_shared::*;

use crate::error::Result;

/// Outcome of an insert guarded by a uniqueness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The unique constraint already held a row; nothing was written
    Duplicate,
}

impl InsertOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, InsertOutcome::Duplicate)
    }
}

/// Listing filter for the issues read surface
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<IssueStatus>,
    pub severity: Option<IssueSeverity>,
    pub issue_type: Option<IssueType>,
    pub limit: i64,
    pub offset: i64,
}

impl IssueFilter {
    pub fn clamped_limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit.min(100)
        }
    }
}

/// Listing filter for webhook delivery logs
#[derive(Debug, Clone, Default)]
pub struct WebhookLogFilter {
    pub source: Option<Source>,
    pub status: Option<ProcessingStatus>,
    pub limit: i64,
}

impl WebhookLogFilter {
    pub fn clamped_limit(&self) -> i64 {
        if self.limit <= 0 {
            50
        } else {
            self.limit.min(100)
        }
    }
}

/// Open-issue aggregation for the dashboard feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueSummary {
    pub open_total: u64,
    pub open_by_severity: HashMap<String, u64>,
    pub open_by_type: HashMap<String, u64>,
    pub estimated_revenue_at_risk_cents: i64,
}

/// Per-connection slice of the integration health surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub source: Source,
    pub is_active: bool,
    pub sync_status: SyncStatus,
    pub last_webhook_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub processed_24h: u64,
    pub failed_24h: u64,
}

/// The tenant-scoped storage capability
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Organizations
    // ------------------------------------------------------------------

    /// Create an organization; slug uniqueness is global
    async fn create_org(&self, org: Organization) -> Result<Organization>;
    async fn get_org(&self, org_id: Uuid) -> Result<Option<Organization>>;
    async fn get_org_by_slug(&self, slug: &str) -> Result<Option<Organization>>;
    /// Every org id, for the scheduler's per-tenant fan-out
    async fn list_org_ids(&self) -> Result<Vec<Uuid>>;

    // ------------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------------

    async fn insert_api_key(&self, key: ApiKey) -> Result<()>;
    /// Global lookup by hash; the returned row binds the tenant
    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>>;
    async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>>;
    async fn revoke_api_key(&self, org_id: Uuid, key_id: Uuid) -> Result<bool>;

    // ------------------------------------------------------------------
    // Billing connections
    // ------------------------------------------------------------------

    /// Insert or replace the (org, source) connection
    async fn upsert_connection(&self, conn: BillingConnection) -> Result<BillingConnection>;
    async fn get_connection(&self, org_id: Uuid, source: Source)
        -> Result<Option<BillingConnection>>;
    async fn list_connections(&self, org_id: Uuid) -> Result<Vec<BillingConnection>>;
    async fn touch_connection_webhook(
        &self,
        org_id: Uuid,
        source: Source,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn update_connection_sync(
        &self,
        org_id: Uuid,
        source: Source,
        status: SyncStatus,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Users & identities
    // ------------------------------------------------------------------

    async fn create_user(&self, user: User) -> Result<User>;
    async fn get_user(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<User>>;
    async fn find_user_by_external_user_id(
        &self,
        org_id: Uuid,
        external_user_id: &str,
    ) -> Result<Option<User>>;
    async fn update_user(&self, user: User) -> Result<()>;
    async fn delete_user(&self, org_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn find_identity(
        &self,
        org_id: Uuid,
        source: Source,
        id_type: IdentityType,
        external_id: &str,
    ) -> Result<Option<UserIdentity>>;
    /// Any-source, any-type lookup used by external-id-only resolution
    async fn find_identities_by_external_id(
        &self,
        org_id: Uuid,
        external_id: &str,
    ) -> Result<Vec<UserIdentity>>;
    /// Race-safe upsert on (org, source, id_type, external_id); the
    /// surviving row is returned
    async fn upsert_identity(&self, identity: UserIdentity) -> Result<UserIdentity>;
    async fn list_identities_for_user(&self, org_id: Uuid, user_id: Uuid)
        -> Result<Vec<UserIdentity>>;
    /// Rewrite every FK (identities, events, entitlements, issues,
    /// access checks) from `from_user` to `to_user` in one unit of work
    async fn reassign_user_rows(&self, org_id: Uuid, from_user: Uuid, to_user: Uuid) -> Result<()>;

    // ------------------------------------------------------------------
    // Products
    // ------------------------------------------------------------------

    async fn create_product(&self, product: Product) -> Result<Product>;
    async fn list_products(&self, org_id: Uuid) -> Result<Vec<Product>>;
    async fn find_product_by_external_id(
        &self,
        org_id: Uuid,
        source: Source,
        external_id: &str,
    ) -> Result<Option<Product>>;
    /// The org's only active product, if it has exactly one
    async fn single_active_product(&self, org_id: Uuid) -> Result<Option<Product>>;

    // ------------------------------------------------------------------
    // Entitlements
    // ------------------------------------------------------------------

    async fn get_entitlement(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        product_id: Option<Uuid>,
        source: Source,
    ) -> Result<Option<Entitlement>>;
    async fn upsert_entitlement(&self, entitlement: Entitlement) -> Result<()>;
    async fn list_entitlements_for_user(&self, org_id: Uuid, user_id: Uuid)
        -> Result<Vec<Entitlement>>;
    async fn list_entitlements_for_user_product(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        product_id: Option<Uuid>,
    ) -> Result<Vec<Entitlement>>;
    /// All entitlements currently in an ACCESS_GRANTED state
    async fn list_access_granted_entitlements(&self, org_id: Uuid) -> Result<Vec<Entitlement>>;
    /// Entitlements whose period has lapsed without a fresh update —
    /// candidates for the silent-webhook-loss detector
    async fn list_entitlements_past_period_end(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>>;

    // ------------------------------------------------------------------
    // Canonical events
    // ------------------------------------------------------------------

    /// Insert guarded by unique (org_id, idempotency_key)
    async fn insert_canonical_event(&self, event: CanonicalEvent) -> Result<InsertOutcome>;
    async fn list_events_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CanonicalEvent>>;
    async fn count_events_by_type_status(
        &self,
        org_id: Uuid,
        event_type: CanonicalEventType,
        status: EventStatus,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64>;

    // ------------------------------------------------------------------
    // Issues
    // ------------------------------------------------------------------

    /// The open row the dedup invariant allows, if present
    async fn find_open_issue(
        &self,
        org_id: Uuid,
        user_id: Option<Uuid>,
        issue_type: IssueType,
        scope_key: Option<&str>,
    ) -> Result<Option<Issue>>;
    /// Insert guarded by the partial open-issue uniqueness index; a
    /// racing duplicate reports [`InsertOutcome::Duplicate`]
    async fn insert_issue(&self, issue: Issue) -> Result<InsertOutcome>;
    async fn get_issue(&self, org_id: Uuid, issue_id: Uuid) -> Result<Option<Issue>>;
    async fn list_issues(&self, org_id: Uuid, filter: IssueFilter) -> Result<Vec<Issue>>;
    async fn update_issue_status(
        &self,
        org_id: Uuid,
        issue_id: Uuid,
        status: IssueStatus,
        resolution: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Issue>>;
    async fn issue_summary(&self, org_id: Uuid) -> Result<IssueSummary>;
    async fn cache_ai_summary(
        &self,
        org_id: Uuid,
        issue_id: Uuid,
        summary: String,
        at: DateTime<Utc>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Webhook logs
    // ------------------------------------------------------------------

    async fn insert_webhook_log(&self, log: WebhookLog) -> Result<WebhookLog>;
    async fn update_webhook_log(
        &self,
        org_id: Uuid,
        log_id: Uuid,
        status: ProcessingStatus,
        error_message: Option<String>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Record what the delivery turned out to contain, once normalized
    async fn annotate_webhook_log(
        &self,
        org_id: Uuid,
        log_id: Uuid,
        event_type: Option<String>,
        external_event_id: Option<String>,
    ) -> Result<()>;
    async fn get_webhook_log(&self, org_id: Uuid, log_id: Uuid) -> Result<Option<WebhookLog>>;
    async fn list_webhook_logs(
        &self,
        org_id: Uuid,
        filter: WebhookLogFilter,
    ) -> Result<Vec<WebhookLog>>;
    async fn count_webhook_logs(
        &self,
        org_id: Uuid,
        source: Source,
        status: ProcessingStatus,
        since: DateTime<Utc>,
    ) -> Result<u64>;
    /// Cleanup job: drop delivery logs older than the retention horizon
    async fn purge_webhook_logs(&self, org_id: Uuid, before: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Access checks
    // ------------------------------------------------------------------

    async fn insert_access_check(&self, check: AccessCheck) -> Result<AccessCheck>;
    async fn latest_access_check(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<AccessCheck>>;
    /// The most recent check per user across the tenant
    async fn latest_access_checks(&self, org_id: Uuid) -> Result<Vec<AccessCheck>>;

    // ------------------------------------------------------------------
    // Alert configs
    // ------------------------------------------------------------------

    async fn upsert_alert_config(&self, config: AlertConfig) -> Result<AlertConfig>;
    async fn list_alert_configs(&self, org_id: Uuid) -> Result<Vec<AlertConfig>>;

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    async fn insert_audit(&self, entry: AuditEntry) -> Result<()>;

    // ------------------------------------------------------------------
    // Read-side aggregations
    // ------------------------------------------------------------------

    async fn integration_health(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConnectionHealth>>;
}
