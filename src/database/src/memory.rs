//! In-memory store
//!
//! Mirrors the PostgreSQL schema's constraints (unique keys, the partial
//! open-issue index, cascade semantics) over plain collections. The test
//! suites across the workspace run against this implementation; it is the
//! executable specification of [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use revwatch_shared::*;

use crate::error::{DatabaseError, Result};
use crate::store::*;

#[derive(Default)]
struct Inner {
    orgs: HashMap<Uuid, Organization>,
    slugs: HashMap<String, Uuid>,
    api_keys: Vec<ApiKey>,
    connections: Vec<BillingConnection>,
    users: HashMap<Uuid, User>,
    identities: Vec<UserIdentity>,
    products: Vec<Product>,
    entitlements: Vec<Entitlement>,
    events: Vec<CanonicalEvent>,
    event_keys: HashSet<(Uuid, String)>,
    issues: Vec<Issue>,
    webhook_logs: Vec<WebhookLog>,
    access_checks: Vec<AccessCheck>,
    alert_configs: Vec<AlertConfig>,
    audit: Vec<AuditEntry>,
}

/// In-process [`Store`] implementation
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit entries written (test helper)
    pub async fn audit_len(&self) -> usize {
        self.inner.read().await.audit.len()
    }

    /// All audit entries for an org (test helper)
    pub async fn audit_entries(&self, org_id: Uuid) -> Vec<AuditEntry> {
        self.inner
            .read()
            .await
            .audit
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect()
    }

    /// All canonical events for an org (test helper)
    pub async fn events(&self, org_id: Uuid) -> Vec<CanonicalEvent> {
        self.inner
            .read()
            .await
            .events
            .iter()
            .filter(|e| e.org_id == org_id)
            .cloned()
            .collect()
    }

    /// Count of user rows in an org (test helper)
    pub async fn user_count(&self, org_id: Uuid) -> usize {
        self.inner
            .read()
            .await
            .users
            .values()
            .filter(|u| u.org_id == org_id)
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_org(&self, org: Organization) -> Result<Organization> {
        let mut inner = self.inner.write().await;
        if inner.slugs.contains_key(&org.slug) {
            return Err(DatabaseError::conflict(format!(
                "organization slug '{}' already exists",
                org.slug
            )));
        }
        inner.slugs.insert(org.slug.clone(), org.id);
        inner.orgs.insert(org.id, org.clone());
        Ok(org)
    }

    async fn get_org(&self, org_id: Uuid) -> Result<Option<Organization>> {
        Ok(self.inner.read().await.orgs.get(&org_id).cloned())
    }

    async fn get_org_by_slug(&self, slug: &str) -> Result<Option<Organization>> {
        let inner = self.inner.read().await;
        Ok(inner
            .slugs
            .get(slug)
            .and_then(|id| inner.orgs.get(id))
            .cloned())
    }

    async fn list_org_ids(&self) -> Result<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self.inner.read().await.orgs.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<()> {
        self.inner.write().await.api_keys.push(key);
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        Ok(self
            .inner
            .read()
            .await
            .api_keys
            .iter()
            .find(|k| k.key_hash == key_hash && k.revoked_at.is_none())
            .cloned())
    }

    async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>> {
        Ok(self
            .inner
            .read()
            .await
            .api_keys
            .iter()
            .filter(|k| k.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn revoke_api_key(&self, org_id: Uuid, key_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner
            .api_keys
            .iter_mut()
            .find(|k| k.org_id == org_id && k.id == key_id && k.revoked_at.is_none())
        {
            Some(key) => {
                key.revoked_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_connection(&self, conn: BillingConnection) -> Result<BillingConnection> {
        let mut inner = self.inner.write().await;
        inner
            .connections
            .retain(|c| !(c.org_id == conn.org_id && c.source == conn.source));
        inner.connections.push(conn.clone());
        Ok(conn)
    }

    async fn get_connection(
        &self,
        org_id: Uuid,
        source: Source,
    ) -> Result<Option<BillingConnection>> {
        Ok(self
            .inner
            .read()
            .await
            .connections
            .iter()
            .find(|c| c.org_id == org_id && c.source == source)
            .cloned())
    }

    async fn list_connections(&self, org_id: Uuid) -> Result<Vec<BillingConnection>> {
        Ok(self
            .inner
            .read()
            .await
            .connections
            .iter()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn touch_connection_webhook(
        &self,
        org_id: Uuid,
        source: Source,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner
            .connections
            .iter_mut()
            .find(|c| c.org_id == org_id && c.source == source)
        {
            conn.last_webhook_at = Some(at);
            conn.updated_at = at;
        }
        Ok(())
    }

    async fn update_connection_sync(
        &self,
        org_id: Uuid,
        source: Source,
        status: SyncStatus,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner
            .connections
            .iter_mut()
            .find(|c| c.org_id == org_id && c.source == source)
        {
            conn.sync_status = status;
            if last_sync_at.is_some() {
                conn.last_sync_at = last_sync_at;
            }
            conn.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_user(&self, user: User) -> Result<User> {
        let mut inner = self.inner.write().await;
        if let Some(external) = &user.external_user_id {
            let taken = inner
                .users
                .values()
                .any(|u| u.org_id == user.org_id && u.external_user_id.as_deref() == Some(external));
            if taken {
                return Err(DatabaseError::conflict(format!(
                    "external_user_id '{}' already mapped",
                    external
                )));
            }
        }
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .get(&user_id)
            .filter(|u| u.org_id == org_id)
            .cloned())
    }

    async fn find_user_by_external_user_id(
        &self,
        org_id: Uuid,
        external_user_id: &str,
    ) -> Result<Option<User>> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| {
                u.org_id == org_id && u.external_user_id.as_deref() == Some(external_user_id)
            })
            .cloned())
    }

    async fn update_user(&self, user: User) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.users.get_mut(&user.id) {
            Some(existing) if existing.org_id == user.org_id => {
                *existing = user;
                Ok(())
            }
            _ => Err(DatabaseError::not_found("user")),
        }
    }

    async fn delete_user(&self, org_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .users
            .get(&user_id)
            .map(|u| u.org_id == org_id)
            .unwrap_or(false);
        if removed {
            inner.users.remove(&user_id);
        }
        Ok(())
    }

    async fn find_identity(
        &self,
        org_id: Uuid,
        source: Source,
        id_type: IdentityType,
        external_id: &str,
    ) -> Result<Option<UserIdentity>> {
        Ok(self
            .inner
            .read()
            .await
            .identities
            .iter()
            .find(|i| {
                i.org_id == org_id
                    && i.source == source
                    && i.id_type == id_type
                    && i.external_id == external_id
            })
            .cloned())
    }

    async fn find_identities_by_external_id(
        &self,
        org_id: Uuid,
        external_id: &str,
    ) -> Result<Vec<UserIdentity>> {
        Ok(self
            .inner
            .read()
            .await
            .identities
            .iter()
            .filter(|i| i.org_id == org_id && i.external_id == external_id)
            .cloned()
            .collect())
    }

    async fn upsert_identity(&self, identity: UserIdentity) -> Result<UserIdentity> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.identities.iter_mut().find(|i| {
            i.org_id == identity.org_id
                && i.source == identity.source
                && i.id_type == identity.id_type
                && i.external_id == identity.external_id
        }) {
            if identity.metadata.is_some() {
                existing.metadata = identity.metadata.clone();
            }
            return Ok(existing.clone());
        }
        inner.identities.push(identity.clone());
        Ok(identity)
    }

    async fn list_identities_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<UserIdentity>> {
        Ok(self
            .inner
            .read()
            .await
            .identities
            .iter()
            .filter(|i| i.org_id == org_id && i.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn reassign_user_rows(
        &self,
        org_id: Uuid,
        from_user: Uuid,
        to_user: Uuid,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        for identity in inner
            .identities
            .iter_mut()
            .filter(|i| i.org_id == org_id && i.user_id == from_user)
        {
            identity.user_id = to_user;
        }
        for event in inner
            .events
            .iter_mut()
            .filter(|e| e.org_id == org_id && e.user_id == Some(from_user))
        {
            event.user_id = Some(to_user);
        }
        for ent in inner
            .entitlements
            .iter_mut()
            .filter(|e| e.org_id == org_id && e.user_id == from_user)
        {
            ent.user_id = to_user;
        }
        for issue in inner
            .issues
            .iter_mut()
            .filter(|i| i.org_id == org_id && i.user_id == Some(from_user))
        {
            issue.user_id = Some(to_user);
        }
        for check in inner
            .access_checks
            .iter_mut()
            .filter(|c| c.org_id == org_id && c.user_id == Some(from_user))
        {
            check.user_id = Some(to_user);
        }
        Ok(())
    }

    async fn create_product(&self, product: Product) -> Result<Product> {
        self.inner.write().await.products.push(product.clone());
        Ok(product)
    }

    async fn list_products(&self, org_id: Uuid) -> Result<Vec<Product>> {
        Ok(self
            .inner
            .read()
            .await
            .products
            .iter()
            .filter(|p| p.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn find_product_by_external_id(
        &self,
        org_id: Uuid,
        source: Source,
        external_id: &str,
    ) -> Result<Option<Product>> {
        Ok(self
            .inner
            .read()
            .await
            .products
            .iter()
            .find(|p| {
                p.org_id == org_id
                    && p.external_ids
                        .get(source.as_str())
                        .map(|id| id == external_id)
                        .unwrap_or(false)
            })
            .cloned())
    }

    async fn single_active_product(&self, org_id: Uuid) -> Result<Option<Product>> {
        let inner = self.inner.read().await;
        let mut active = inner
            .products
            .iter()
            .filter(|p| p.org_id == org_id && p.is_active);
        match (active.next(), active.next()) {
            (Some(product), None) => Ok(Some(product.clone())),
            _ => Ok(None),
        }
    }

    async fn get_entitlement(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        product_id: Option<Uuid>,
        source: Source,
    ) -> Result<Option<Entitlement>> {
        Ok(self
            .inner
            .read()
            .await
            .entitlements
            .iter()
            .find(|e| {
                e.org_id == org_id
                    && e.user_id == user_id
                    && e.product_id == product_id
                    && e.source == source
            })
            .cloned())
    }

    async fn upsert_entitlement(&self, entitlement: Entitlement) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.entitlements.retain(|e| {
            !(e.org_id == entitlement.org_id
                && e.user_id == entitlement.user_id
                && e.product_id == entitlement.product_id
                && e.source == entitlement.source)
        });
        inner.entitlements.push(entitlement);
        Ok(())
    }

    async fn list_entitlements_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Entitlement>> {
        Ok(self
            .inner
            .read()
            .await
            .entitlements
            .iter()
            .filter(|e| e.org_id == org_id && e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_entitlements_for_user_product(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        product_id: Option<Uuid>,
    ) -> Result<Vec<Entitlement>> {
        Ok(self
            .inner
            .read()
            .await
            .entitlements
            .iter()
            .filter(|e| e.org_id == org_id && e.user_id == user_id && e.product_id == product_id)
            .cloned()
            .collect())
    }

    async fn list_access_granted_entitlements(&self, org_id: Uuid) -> Result<Vec<Entitlement>> {
        Ok(self
            .inner
            .read()
            .await
            .entitlements
            .iter()
            .filter(|e| e.org_id == org_id && e.state.grants_access())
            .cloned()
            .collect())
    }

    async fn list_entitlements_past_period_end(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>> {
        Ok(self
            .inner
            .read()
            .await
            .entitlements
            .iter()
            .filter(|e| {
                e.org_id == org_id
                    && matches!(
                        e.state.access_class(),
                        AccessClass::AccessGranted | AccessClass::AtRisk
                    )
                    && e.current_period_end.map(|end| end < now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_canonical_event(&self, event: CanonicalEvent) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        let key = (event.org_id, event.idempotency_key.clone());
        if inner.event_keys.contains(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.event_keys.insert(key);
        inner.events.push(event);
        Ok(InsertOutcome::Inserted)
    }

    async fn list_events_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CanonicalEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<CanonicalEvent> = inner
            .events
            .iter()
            .filter(|e| e.org_id == org_id && e.user_id == Some(user_id))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.event_time.cmp(&a.event_time));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn count_events_by_type_status(
        &self,
        org_id: Uuid,
        event_type: CanonicalEventType,
        status: EventStatus,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .events
            .iter()
            .filter(|e| {
                e.org_id == org_id
                    && e.event_type == event_type
                    && e.status == status
                    && e.event_time >= since
                    && e.event_time < until
            })
            .count() as u64)
    }

    async fn find_open_issue(
        &self,
        org_id: Uuid,
        user_id: Option<Uuid>,
        issue_type: IssueType,
        scope_key: Option<&str>,
    ) -> Result<Option<Issue>> {
        Ok(self
            .inner
            .read()
            .await
            .issues
            .iter()
            .find(|i| {
                i.org_id == org_id
                    && i.issue_type == issue_type
                    && i.status.is_open()
                    && match user_id {
                        Some(uid) => i.user_id == Some(uid),
                        None => {
                            i.user_id.is_none() && i.scope_key.as_deref() == scope_key
                        }
                    }
            })
            .cloned())
    }

    async fn insert_issue(&self, issue: Issue) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.issues.iter().any(|i| {
            i.org_id == issue.org_id
                && i.issue_type == issue.issue_type
                && i.status.is_open()
                && match issue.user_id {
                    Some(uid) => i.user_id == Some(uid),
                    None => i.user_id.is_none() && i.scope_key == issue.scope_key,
                }
        });
        if duplicate && issue.status.is_open() {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.issues.push(issue);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_issue(&self, org_id: Uuid, issue_id: Uuid) -> Result<Option<Issue>> {
        Ok(self
            .inner
            .read()
            .await
            .issues
            .iter()
            .find(|i| i.org_id == org_id && i.id == issue_id)
            .cloned())
    }

    async fn list_issues(&self, org_id: Uuid, filter: IssueFilter) -> Result<Vec<Issue>> {
        let inner = self.inner.read().await;
        let mut issues: Vec<Issue> = inner
            .issues
            .iter()
            .filter(|i| i.org_id == org_id)
            .filter(|i| filter.status.map(|s| i.status == s).unwrap_or(true))
            .filter(|i| filter.severity.map(|s| i.severity == s).unwrap_or(true))
            .filter(|i| filter.issue_type.map(|t| i.issue_type == t).unwrap_or(true))
            .cloned()
            .collect();
        issues.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let offset = filter.offset.max(0) as usize;
        let limit = filter.clamped_limit() as usize;
        Ok(issues.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_issue_status(
        &self,
        org_id: Uuid,
        issue_id: Uuid,
        status: IssueStatus,
        resolution: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Issue>> {
        let mut inner = self.inner.write().await;
        match inner
            .issues
            .iter_mut()
            .find(|i| i.org_id == org_id && i.id == issue_id)
        {
            Some(issue) => {
                issue.status = status;
                issue.updated_at = now;
                if resolution.is_some() {
                    issue.resolution = resolution;
                }
                if status == IssueStatus::Resolved {
                    issue.resolved_at = Some(now);
                }
                Ok(Some(issue.clone()))
            }
            None => Ok(None),
        }
    }

    async fn issue_summary(&self, org_id: Uuid) -> Result<IssueSummary> {
        let inner = self.inner.read().await;
        let open = inner
            .issues
            .iter()
            .filter(|i| i.org_id == org_id && i.status.is_open());

        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        let mut revenue: i64 = 0;
        let mut total: u64 = 0;
        for issue in open {
            total += 1;
            *by_severity
                .entry(issue.severity.as_str().to_string())
                .or_insert(0) += 1;
            *by_type
                .entry(issue.issue_type.as_str().to_string())
                .or_insert(0) += 1;
            revenue += issue.estimated_revenue_cents.unwrap_or(0);
        }
        Ok(IssueSummary {
            open_total: total,
            open_by_severity: by_severity,
            open_by_type: by_type,
            estimated_revenue_at_risk_cents: revenue,
        })
    }

    async fn cache_ai_summary(
        &self,
        org_id: Uuid,
        issue_id: Uuid,
        summary: String,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(issue) = inner
            .issues
            .iter_mut()
            .find(|i| i.org_id == org_id && i.id == issue_id)
        {
            issue.ai_summary = Some(summary);
            issue.ai_summary_at = Some(at);
        }
        Ok(())
    }

    async fn insert_webhook_log(&self, log: WebhookLog) -> Result<WebhookLog> {
        self.inner.write().await.webhook_logs.push(log.clone());
        Ok(log)
    }

    async fn update_webhook_log(
        &self,
        org_id: Uuid,
        log_id: Uuid,
        status: ProcessingStatus,
        error_message: Option<String>,
        processed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(log) = inner
            .webhook_logs
            .iter_mut()
            .find(|l| l.org_id == org_id && l.id == log_id)
        {
            log.processing_status = status;
            if error_message.is_some() {
                log.error_message = error_message;
            }
            if processed_at.is_some() {
                log.processed_at = processed_at;
            }
        }
        Ok(())
    }

    async fn annotate_webhook_log(
        &self,
        org_id: Uuid,
        log_id: Uuid,
        event_type: Option<String>,
        external_event_id: Option<String>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(log) = inner
            .webhook_logs
            .iter_mut()
            .find(|l| l.org_id == org_id && l.id == log_id)
        {
            if event_type.is_some() {
                log.event_type = event_type;
            }
            if external_event_id.is_some() {
                log.external_event_id = external_event_id;
            }
        }
        Ok(())
    }

    async fn get_webhook_log(&self, org_id: Uuid, log_id: Uuid) -> Result<Option<WebhookLog>> {
        Ok(self
            .inner
            .read()
            .await
            .webhook_logs
            .iter()
            .find(|l| l.org_id == org_id && l.id == log_id)
            .cloned())
    }

    async fn list_webhook_logs(
        &self,
        org_id: Uuid,
        filter: WebhookLogFilter,
    ) -> Result<Vec<WebhookLog>> {
        let inner = self.inner.read().await;
        let mut logs: Vec<WebhookLog> = inner
            .webhook_logs
            .iter()
            .filter(|l| l.org_id == org_id)
            .filter(|l| filter.source.map(|s| l.source == s).unwrap_or(true))
            .filter(|l| {
                filter
                    .status
                    .map(|s| l.processing_status == s)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(filter.clamped_limit() as usize);
        Ok(logs)
    }

    async fn count_webhook_logs(
        &self,
        org_id: Uuid,
        source: Source,
        status: ProcessingStatus,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .inner
            .read()
            .await
            .webhook_logs
            .iter()
            .filter(|l| {
                l.org_id == org_id
                    && l.source == source
                    && l.processing_status == status
                    && l.created_at >= since
            })
            .count() as u64)
    }

    async fn purge_webhook_logs(&self, org_id: Uuid, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let total = inner.webhook_logs.len();
        inner
            .webhook_logs
            .retain(|l| !(l.org_id == org_id && l.created_at < before));
        Ok((total - inner.webhook_logs.len()) as u64)
    }

    async fn insert_access_check(&self, check: AccessCheck) -> Result<AccessCheck> {
        self.inner.write().await.access_checks.push(check.clone());
        Ok(check)
    }

    async fn latest_access_check(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<AccessCheck>> {
        Ok(self
            .inner
            .read()
            .await
            .access_checks
            .iter()
            .filter(|c| c.org_id == org_id && c.user_id == Some(user_id))
            .max_by_key(|c| c.reported_at)
            .cloned())
    }

    async fn latest_access_checks(&self, org_id: Uuid) -> Result<Vec<AccessCheck>> {
        let inner = self.inner.read().await;
        let mut latest: HashMap<Uuid, AccessCheck> = HashMap::new();
        for check in inner
            .access_checks
            .iter()
            .filter(|c| c.org_id == org_id && c.user_id.is_some())
        {
            let user_id = check.user_id.expect("filtered on user_id");
            match latest.get(&user_id) {
                Some(existing) if existing.reported_at >= check.reported_at => {}
                _ => {
                    latest.insert(user_id, check.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn upsert_alert_config(&self, config: AlertConfig) -> Result<AlertConfig> {
        let mut inner = self.inner.write().await;
        inner
            .alert_configs
            .retain(|c| !(c.org_id == config.org_id && c.channel == config.channel));
        inner.alert_configs.push(config.clone());
        Ok(config)
    }

    async fn list_alert_configs(&self, org_id: Uuid) -> Result<Vec<AlertConfig>> {
        Ok(self
            .inner
            .read()
            .await
            .alert_configs
            .iter()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }

    async fn insert_audit(&self, entry: AuditEntry) -> Result<()> {
        self.inner.write().await.audit.push(entry);
        Ok(())
    }

    async fn integration_health(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConnectionHealth>> {
        let since = now - Duration::hours(24);
        let inner = self.inner.read().await;
        let mut health = Vec::new();
        for conn in inner.connections.iter().filter(|c| c.org_id == org_id) {
            let processed = inner
                .webhook_logs
                .iter()
                .filter(|l| {
                    l.org_id == org_id
                        && l.source == conn.source
                        && l.processing_status == ProcessingStatus::Processed
                        && l.created_at >= since
                })
                .count() as u64;
            let failed = inner
                .webhook_logs
                .iter()
                .filter(|l| {
                    l.org_id == org_id
                        && l.source == conn.source
                        && l.processing_status == ProcessingStatus::Failed
                        && l.created_at >= since
                })
                .count() as u64;
            health.push(ConnectionHealth {
                source: conn.source,
                is_active: conn.is_active,
                sync_status: conn.sync_status,
                last_webhook_at: conn.last_webhook_at,
                last_sync_at: conn.last_sync_at,
                processed_24h: processed,
                failed_24h: failed,
            });
        }
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn org(slug: &str) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: slug.to_string(),
            created_at: Utc::now(),
        }
    }

    fn event(org_id: Uuid, key: &str) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id,
            source: Source::Stripe,
            source_event_type: "invoice.paid".into(),
            event_type: CanonicalEventType::Renewal,
            event_time: Utc::now(),
            status: EventStatus::Success,
            user_id: None,
            product_id: None,
            external_subscription_id: Some("sub_1".into()),
            external_event_id: Some("evt_1".into()),
            idempotency_key: key.to_string(),
            amount_cents: Some(1999),
            currency: Some("usd".into()),
            period_type: None,
            expiration_time: None,
            cancellation_reason: None,
            environment: Environment::Production,
            raw_payload: json!({}),
            ingested_at: Utc::now(),
        }
    }

    fn issue(org_id: Uuid, user_id: Option<Uuid>, issue_type: IssueType) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            org_id,
            user_id,
            issue_type,
            severity: IssueSeverity::Warning,
            status: IssueStatus::Open,
            title: "t".into(),
            description: "d".into(),
            estimated_revenue_cents: Some(1999),
            confidence: 0.9,
            detector_id: "unrevoked_refund".into(),
            detection_tier: DetectionTier::BillingOnly,
            evidence: json!({}),
            scope_key: None,
            resolution: None,
            resolved_at: None,
            ai_summary: None,
            ai_summary_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_slug_uniqueness_is_global() {
        let store = MemoryStore::new();
        store.create_org(org("acme")).await.unwrap();
        let err = store.create_org(org("acme")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_idempotency_key_dedup() {
        let store = MemoryStore::new();
        let o = store.create_org(org("acme")).await.unwrap();

        let first = store
            .insert_canonical_event(event(o.id, "stripe:evt_1"))
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);

        let second = store
            .insert_canonical_event(event(o.id, "stripe:evt_1"))
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::Duplicate);

        // Same key under a different org is a different row
        let other = store.create_org(org("other")).await.unwrap();
        let third = store
            .insert_canonical_event(event(other.id, "stripe:evt_1"))
            .await
            .unwrap();
        assert_eq!(third, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_open_issue_uniqueness() {
        let store = MemoryStore::new();
        let o = store.create_org(org("acme")).await.unwrap();
        let user = Uuid::new_v4();

        let first = store
            .insert_issue(issue(o.id, Some(user), IssueType::UnrevokedRefund))
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);

        let dup = store
            .insert_issue(issue(o.id, Some(user), IssueType::UnrevokedRefund))
            .await
            .unwrap();
        assert_eq!(dup, InsertOutcome::Duplicate);

        // Different type is allowed
        let other_type = store
            .insert_issue(issue(o.id, Some(user), IssueType::DuplicateBilling))
            .await
            .unwrap();
        assert_eq!(other_type, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_resolving_reopens_dedup_slot() {
        let store = MemoryStore::new();
        let o = store.create_org(org("acme")).await.unwrap();
        let user = Uuid::new_v4();

        let row = issue(o.id, Some(user), IssueType::UnrevokedRefund);
        let row_id = row.id;
        store.insert_issue(row).await.unwrap();
        store
            .update_issue_status(o.id, row_id, IssueStatus::Resolved, None, Utc::now())
            .await
            .unwrap();

        let again = store
            .insert_issue(issue(o.id, Some(user), IssueType::UnrevokedRefund))
            .await
            .unwrap();
        assert_eq!(again, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_aggregate_issue_scoped_by_evidence_key() {
        let store = MemoryStore::new();
        let o = store.create_org(org("acme")).await.unwrap();

        let mut gap = issue(o.id, None, IssueType::WebhookDeliveryGap);
        gap.scope_key = Some("stripe".into());
        store.insert_issue(gap.clone()).await.unwrap();

        let mut dup = issue(o.id, None, IssueType::WebhookDeliveryGap);
        dup.scope_key = Some("stripe".into());
        assert_eq!(
            store.insert_issue(dup).await.unwrap(),
            InsertOutcome::Duplicate
        );

        let mut apple = issue(o.id, None, IssueType::WebhookDeliveryGap);
        apple.scope_key = Some("apple".into());
        assert_eq!(
            store.insert_issue(apple).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn test_tenant_isolation_on_reads() {
        let store = MemoryStore::new();
        let a = store.create_org(org("org-a")).await.unwrap();
        let b = store.create_org(org("org-b")).await.unwrap();

        store
            .insert_issue(issue(a.id, Some(Uuid::new_v4()), IssueType::UnrevokedRefund))
            .await
            .unwrap();

        let visible = store.list_issues(b.id, IssueFilter::default()).await.unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn test_external_user_id_unique_per_org() {
        let store = MemoryStore::new();
        let o = store.create_org(org("acme")).await.unwrap();
        let user = User {
            id: Uuid::new_v4(),
            org_id: o.id,
            email: None,
            external_user_id: Some("app-user-1".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_user(user.clone()).await.unwrap();

        let dup = User {
            id: Uuid::new_v4(),
            ..user
        };
        assert!(store.create_user(dup).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_latest_access_checks_picks_newest_per_user() {
        let store = MemoryStore::new();
        let o = store.create_org(org("acme")).await.unwrap();
        let user = Uuid::new_v4();
        let older = AccessCheck {
            id: Uuid::new_v4(),
            org_id: o.id,
            user_id: Some(user),
            product_id: None,
            external_user_id: "u1".into(),
            has_access: true,
            reported_at: Utc::now() - Duration::hours(2),
            created_at: Utc::now(),
        };
        let newer = AccessCheck {
            id: Uuid::new_v4(),
            has_access: false,
            reported_at: Utc::now(),
            ..older.clone()
        };
        store.insert_access_check(older).await.unwrap();
        store.insert_access_check(newer.clone()).await.unwrap();

        let latest = store.latest_access_checks(o.id).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, newer.id);
        assert!(!latest[0].has_access);
    }
}
