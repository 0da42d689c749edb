//! PostgreSQL store
//!
//! Runtime-bound sqlx queries over the schema in `migrations/`. Row
//! mapping is explicit so the crate builds without a live database;
//! semantics are pinned by the shared test suite running against
//! [`crate::MemoryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use revwatch_shared::*;

use crate::error::{DatabaseError, Result};
use crate::store::*;

/// Production [`Store`] backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect with a bounded pool and run pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| DatabaseError::connection(e.to_string()))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration {
                message: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(DatabaseError::query)
}

fn org_from_row(row: &PgRow) -> Result<Organization> {
    Ok(Organization {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn api_key_from_row(row: &PgRow) -> Result<ApiKey> {
    let scopes: Vec<String> = row.try_get("scopes")?;
    Ok(ApiKey {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        key_hash: row.try_get("key_hash")?,
        key_prefix: row.try_get("key_prefix")?,
        scopes: scopes
            .iter()
            .map(|s| parse::<ApiScope>(s))
            .collect::<Result<Vec<_>>>()?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn connection_from_row(row: &PgRow) -> Result<BillingConnection> {
    let source: String = row.try_get("source")?;
    let sync_status: String = row.try_get("sync_status")?;
    Ok(BillingConnection {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        source: parse(&source)?,
        credentials_enc: row.try_get("credentials_enc")?,
        webhook_secret_enc: row.try_get("webhook_secret_enc")?,
        proxy_url: row.try_get("proxy_url")?,
        is_active: row.try_get("is_active")?,
        last_sync_at: row.try_get("last_sync_at")?,
        last_webhook_at: row.try_get("last_webhook_at")?,
        sync_status: parse(&sync_status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        email: row.try_get("email")?,
        external_user_id: row.try_get("external_user_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn identity_from_row(row: &PgRow) -> Result<UserIdentity> {
    let source: String = row.try_get("source")?;
    let id_type: String = row.try_get("id_type")?;
    Ok(UserIdentity {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        user_id: row.try_get("user_id")?,
        source: parse(&source)?,
        id_type: parse(&id_type)?,
        external_id: row.try_get("external_id")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product> {
    let external_ids: serde_json::Value = row.try_get("external_ids")?;
    Ok(Product {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        external_ids: serde_json::from_value::<HashMap<String, String>>(external_ids)?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn entitlement_from_row(row: &PgRow) -> Result<Entitlement> {
    let source: String = row.try_get("source")?;
    let state: String = row.try_get("state")?;
    let history: serde_json::Value = row.try_get("state_history")?;
    Ok(Entitlement {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        source: parse(&source)?,
        state: parse(&state)?,
        current_period_start: row.try_get("current_period_start")?,
        current_period_end: row.try_get("current_period_end")?,
        cancel_at: row.try_get("cancel_at")?,
        trial_end: row.try_get("trial_end")?,
        plan_amount_cents: row.try_get("plan_amount_cents")?,
        state_history: serde_json::from_value(history)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<CanonicalEvent> {
    let source: String = row.try_get("source")?;
    let event_type: String = row.try_get("event_type")?;
    let status: String = row.try_get("status")?;
    let environment: String = row.try_get("environment")?;
    let period_type: Option<String> = row.try_get("period_type")?;
    Ok(CanonicalEvent {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        source: parse(&source)?,
        source_event_type: row.try_get("source_event_type")?,
        event_type: parse(&event_type)?,
        event_time: row.try_get("event_time")?,
        status: parse(&status)?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        external_subscription_id: row.try_get("external_subscription_id")?,
        external_event_id: row.try_get("external_event_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: row.try_get("currency")?,
        period_type: period_type.as_deref().map(parse::<PeriodType>).transpose()?,
        expiration_time: row.try_get("expiration_time")?,
        cancellation_reason: row.try_get("cancellation_reason")?,
        environment: parse(&environment)?,
        raw_payload: row.try_get("raw_payload")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn issue_from_row(row: &PgRow) -> Result<Issue> {
    let issue_type: String = row.try_get("issue_type")?;
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;
    let tier: String = row.try_get("detection_tier")?;
    Ok(Issue {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        user_id: row.try_get("user_id")?,
        issue_type: parse(&issue_type)?,
        severity: parse(&severity)?,
        status: parse(&status)?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        estimated_revenue_cents: row.try_get("estimated_revenue_cents")?,
        confidence: row.try_get("confidence")?,
        detector_id: row.try_get("detector_id")?,
        detection_tier: match tier.as_str() {
            "app_verified" => DetectionTier::AppVerified,
            _ => DetectionTier::BillingOnly,
        },
        evidence: row.try_get("evidence")?,
        scope_key: row.try_get("scope_key")?,
        resolution: row.try_get("resolution")?,
        resolved_at: row.try_get("resolved_at")?,
        ai_summary: row.try_get("ai_summary")?,
        ai_summary_at: row.try_get("ai_summary_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn webhook_log_from_row(row: &PgRow) -> Result<WebhookLog> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("processing_status")?;
    Ok(WebhookLog {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        source: parse(&source)?,
        processing_status: parse(&status)?,
        event_type: row.try_get("event_type")?,
        external_event_id: row.try_get("external_event_id")?,
        error_message: row.try_get("error_message")?,
        headers: row.try_get("headers")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn access_check_from_row(row: &PgRow) -> Result<AccessCheck> {
    Ok(AccessCheck {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        user_id: row.try_get("user_id")?,
        product_id: row.try_get("product_id")?,
        external_user_id: row.try_get("external_user_id")?,
        has_access: row.try_get("has_access")?,
        reported_at: row.try_get("reported_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn alert_config_from_row(row: &PgRow) -> Result<AlertConfig> {
    let channel: String = row.try_get("channel")?;
    let event_types: Option<Vec<String>> = row.try_get("event_types")?;
    let event_types = event_types
        .map(|types| {
            types
                .iter()
                .map(|t| match t.as_str() {
                    "issue.created" => Ok(AlertEventType::IssueCreated),
                    "issue.acknowledged" => Ok(AlertEventType::IssueAcknowledged),
                    "issue.resolved" => Ok(AlertEventType::IssueResolved),
                    "issue.dismissed" => Ok(AlertEventType::IssueDismissed),
                    other => Err(DatabaseError::query(format!(
                        "unknown alert event type: {}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;
    Ok(AlertConfig {
        id: row.try_get("id")?,
        org_id: row.try_get("org_id")?,
        channel: parse(&channel)?,
        endpoint_url: row.try_get("endpoint_url")?,
        signing_secret: row.try_get("signing_secret")?,
        routing_key: row.try_get("routing_key")?,
        slack_channel: row.try_get("slack_channel")?,
        event_types,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn create_org(&self, org: Organization) -> Result<Organization> {
        sqlx::query(
            "INSERT INTO organizations (id, slug, name, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(org.id)
        .bind(&org.slug)
        .bind(&org.name)
        .bind(org.created_at)
        .execute(&self.pool)
        .await?;
        Ok(org)
    }

    async fn get_org(&self, org_id: Uuid) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE id = $1")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn get_org_by_slug(&self, slug: &str) -> Result<Option<Organization>> {
        let row = sqlx::query("SELECT * FROM organizations WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(org_from_row).transpose()
    }

    async fn list_org_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM organizations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(DatabaseError::from))
            .collect()
    }

    async fn insert_api_key(&self, key: ApiKey) -> Result<()> {
        let scopes: Vec<String> = key.scopes.iter().map(|s| s.as_str().to_string()).collect();
        sqlx::query(
            "INSERT INTO api_keys (id, org_id, key_hash, key_prefix, scopes, expires_at, revoked_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(key.id)
        .bind(key.org_id)
        .bind(&key.key_hash)
        .bind(&key.key_prefix)
        .bind(&scopes)
        .bind(key.expires_at)
        .bind(key.revoked_at)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let row =
            sqlx::query("SELECT * FROM api_keys WHERE key_hash = $1 AND revoked_at IS NULL")
                .bind(key_hash)
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(api_key_from_row).transpose()
    }

    async fn list_api_keys(&self, org_id: Uuid) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys WHERE org_id = $1 ORDER BY created_at")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(api_key_from_row).collect()
    }

    async fn revoke_api_key(&self, org_id: Uuid, key_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = now()
             WHERE org_id = $1 AND id = $2 AND revoked_at IS NULL",
        )
        .bind(org_id)
        .bind(key_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_connection(&self, conn: BillingConnection) -> Result<BillingConnection> {
        sqlx::query(
            "INSERT INTO billing_connections
                (id, org_id, source, credentials_enc, webhook_secret_enc, proxy_url,
                 is_active, last_sync_at, last_webhook_at, sync_status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (org_id, source) DO UPDATE SET
                credentials_enc = EXCLUDED.credentials_enc,
                webhook_secret_enc = EXCLUDED.webhook_secret_enc,
                proxy_url = EXCLUDED.proxy_url,
                is_active = EXCLUDED.is_active,
                sync_status = EXCLUDED.sync_status,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(conn.id)
        .bind(conn.org_id)
        .bind(conn.source.as_str())
        .bind(&conn.credentials_enc)
        .bind(&conn.webhook_secret_enc)
        .bind(&conn.proxy_url)
        .bind(conn.is_active)
        .bind(conn.last_sync_at)
        .bind(conn.last_webhook_at)
        .bind(conn.sync_status.as_str())
        .bind(conn.created_at)
        .bind(conn.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(conn)
    }

    async fn get_connection(
        &self,
        org_id: Uuid,
        source: Source,
    ) -> Result<Option<BillingConnection>> {
        let row =
            sqlx::query("SELECT * FROM billing_connections WHERE org_id = $1 AND source = $2")
                .bind(org_id)
                .bind(source.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(connection_from_row).transpose()
    }

    async fn list_connections(&self, org_id: Uuid) -> Result<Vec<BillingConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM billing_connections WHERE org_id = $1 ORDER BY source",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(connection_from_row).collect()
    }

    async fn touch_connection_webhook(
        &self,
        org_id: Uuid,
        source: Source,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE billing_connections SET last_webhook_at = $3, updated_at = $3
             WHERE org_id = $1 AND source = $2",
        )
        .bind(org_id)
        .bind(source.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_connection_sync(
        &self,
        org_id: Uuid,
        source: Source,
        status: SyncStatus,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE billing_connections SET
                sync_status = $3,
                last_sync_at = COALESCE($4, last_sync_at),
                updated_at = now()
             WHERE org_id = $1 AND source = $2",
        )
        .bind(org_id)
        .bind(source.as_str())
        .bind(status.as_str())
        .bind(last_sync_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_user(&self, user: User) -> Result<User> {
        sqlx::query(
            "INSERT INTO users (id, org_id, email, external_user_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(user.org_id)
        .bind(&user.email)
        .bind(&user.external_user_id)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user(&self, org_id: Uuid, user_id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_external_user_id(
        &self,
        org_id: Uuid,
        external_user_id: &str,
    ) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT * FROM users WHERE org_id = $1 AND external_user_id = $2",
        )
        .bind(org_id)
        .bind(external_user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn update_user(&self, user: User) -> Result<()> {
        sqlx::query(
            "UPDATE users SET email = $3, external_user_id = $4, updated_at = $5
             WHERE org_id = $1 AND id = $2",
        )
        .bind(user.org_id)
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.external_user_id)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_user(&self, org_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM users WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_identity(
        &self,
        org_id: Uuid,
        source: Source,
        id_type: IdentityType,
        external_id: &str,
    ) -> Result<Option<UserIdentity>> {
        let row = sqlx::query(
            "SELECT * FROM user_identities
             WHERE org_id = $1 AND source = $2 AND id_type = $3 AND external_id = $4",
        )
        .bind(org_id)
        .bind(source.as_str())
        .bind(id_type.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn find_identities_by_external_id(
        &self,
        org_id: Uuid,
        external_id: &str,
    ) -> Result<Vec<UserIdentity>> {
        let rows = sqlx::query(
            "SELECT * FROM user_identities WHERE org_id = $1 AND external_id = $2",
        )
        .bind(org_id)
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn upsert_identity(&self, identity: UserIdentity) -> Result<UserIdentity> {
        let row = sqlx::query(
            "INSERT INTO user_identities
                (id, org_id, user_id, source, id_type, external_id, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (org_id, source, id_type, external_id) DO UPDATE SET
                metadata = COALESCE(EXCLUDED.metadata, user_identities.metadata)
             RETURNING *",
        )
        .bind(identity.id)
        .bind(identity.org_id)
        .bind(identity.user_id)
        .bind(identity.source.as_str())
        .bind(identity.id_type.as_str())
        .bind(&identity.external_id)
        .bind(&identity.metadata)
        .bind(identity.created_at)
        .fetch_one(&self.pool)
        .await?;
        identity_from_row(&row)
    }

    async fn list_identities_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<UserIdentity>> {
        let rows = sqlx::query(
            "SELECT * FROM user_identities WHERE org_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(identity_from_row).collect()
    }

    async fn reassign_user_rows(
        &self,
        org_id: Uuid,
        from_user: Uuid,
        to_user: Uuid,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Merges are serialized per org
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(org_id)
            .execute(&mut *tx)
            .await?;

        for table in [
            "user_identities",
            "entitlements",
            "canonical_events",
            "issues",
            "access_checks",
        ] {
            sqlx::query(&format!(
                "UPDATE {} SET user_id = $3 WHERE org_id = $1 AND user_id = $2",
                table
            ))
            .bind(org_id)
            .bind(from_user)
            .bind(to_user)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_product(&self, product: Product) -> Result<Product> {
        sqlx::query(
            "INSERT INTO products (id, org_id, name, external_ids, is_active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(product.id)
        .bind(product.org_id)
        .bind(&product.name)
        .bind(serde_json::to_value(&product.external_ids)?)
        .bind(product.is_active)
        .bind(product.created_at)
        .execute(&self.pool)
        .await?;
        Ok(product)
    }

    async fn list_products(&self, org_id: Uuid) -> Result<Vec<Product>> {
        let rows = sqlx::query("SELECT * FROM products WHERE org_id = $1 ORDER BY created_at")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(product_from_row).collect()
    }

    async fn find_product_by_external_id(
        &self,
        org_id: Uuid,
        source: Source,
        external_id: &str,
    ) -> Result<Option<Product>> {
        let row = sqlx::query(
            "SELECT * FROM products WHERE org_id = $1 AND external_ids ->> $2 = $3",
        )
        .bind(org_id)
        .bind(source.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn single_active_product(&self, org_id: Uuid) -> Result<Option<Product>> {
        let rows = sqlx::query(
            "SELECT * FROM products WHERE org_id = $1 AND is_active LIMIT 2",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        if rows.len() == 1 {
            Ok(Some(product_from_row(&rows[0])?))
        } else {
            Ok(None)
        }
    }

    async fn get_entitlement(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        product_id: Option<Uuid>,
        source: Source,
    ) -> Result<Option<Entitlement>> {
        let row = sqlx::query(
            "SELECT * FROM entitlements
             WHERE org_id = $1 AND user_id = $2
               AND product_id IS NOT DISTINCT FROM $3 AND source = $4",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entitlement_from_row).transpose()
    }

    async fn upsert_entitlement(&self, ent: Entitlement) -> Result<()> {
        sqlx::query(
            "INSERT INTO entitlements
                (id, org_id, user_id, product_id, source, state,
                 current_period_start, current_period_end, cancel_at, trial_end,
                 plan_amount_cents, state_history, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (org_id, user_id,
                 COALESCE(product_id, '00000000-0000-0000-0000-000000000000'::uuid), source)
             DO UPDATE SET
                state = EXCLUDED.state,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at = EXCLUDED.cancel_at,
                trial_end = EXCLUDED.trial_end,
                plan_amount_cents = EXCLUDED.plan_amount_cents,
                state_history = EXCLUDED.state_history,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(ent.id)
        .bind(ent.org_id)
        .bind(ent.user_id)
        .bind(ent.product_id)
        .bind(ent.source.as_str())
        .bind(ent.state.as_str())
        .bind(ent.current_period_start)
        .bind(ent.current_period_end)
        .bind(ent.cancel_at)
        .bind(ent.trial_end)
        .bind(ent.plan_amount_cents)
        .bind(serde_json::to_value(&ent.state_history)?)
        .bind(ent.created_at)
        .bind(ent.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_entitlements_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Vec<Entitlement>> {
        let rows = sqlx::query(
            "SELECT * FROM entitlements WHERE org_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entitlement_from_row).collect()
    }

    async fn list_entitlements_for_user_product(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        product_id: Option<Uuid>,
    ) -> Result<Vec<Entitlement>> {
        let rows = sqlx::query(
            "SELECT * FROM entitlements
             WHERE org_id = $1 AND user_id = $2 AND product_id IS NOT DISTINCT FROM $3",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entitlement_from_row).collect()
    }

    async fn list_access_granted_entitlements(&self, org_id: Uuid) -> Result<Vec<Entitlement>> {
        let rows = sqlx::query(
            "SELECT * FROM entitlements WHERE org_id = $1 AND state IN ('trial', 'active')",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entitlement_from_row).collect()
    }

    async fn list_entitlements_past_period_end(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Entitlement>> {
        let rows = sqlx::query(
            "SELECT * FROM entitlements
             WHERE org_id = $1
               AND state IN ('trial', 'active', 'grace_period', 'billing_retry', 'past_due')
               AND current_period_end IS NOT NULL AND current_period_end < $2",
        )
        .bind(org_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entitlement_from_row).collect()
    }

    async fn insert_canonical_event(&self, event: CanonicalEvent) -> Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO canonical_events
                (id, org_id, source, source_event_type, event_type, event_time, status,
                 user_id, product_id, external_subscription_id, external_event_id,
                 idempotency_key, amount_cents, currency, period_type, expiration_time,
                 cancellation_reason, environment, raw_payload, ingested_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                     $16, $17, $18, $19, $20, $20)
             ON CONFLICT (org_id, idempotency_key) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.org_id)
        .bind(event.source.as_str())
        .bind(&event.source_event_type)
        .bind(event.event_type.as_str())
        .bind(event.event_time)
        .bind(event.status.as_str())
        .bind(event.user_id)
        .bind(event.product_id)
        .bind(&event.external_subscription_id)
        .bind(&event.external_event_id)
        .bind(&event.idempotency_key)
        .bind(event.amount_cents)
        .bind(&event.currency)
        .bind(event.period_type.map(|p| p.as_str()))
        .bind(event.expiration_time)
        .bind(&event.cancellation_reason)
        .bind(event.environment.as_str())
        .bind(&event.raw_payload)
        .bind(event.ingested_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn list_events_for_user(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CanonicalEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM canonical_events
             WHERE org_id = $1 AND user_id = $2
             ORDER BY event_time DESC LIMIT $3",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn count_events_by_type_status(
        &self,
        org_id: Uuid,
        event_type: CanonicalEventType,
        status: EventStatus,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM canonical_events
             WHERE org_id = $1 AND event_type = $2 AND status = $3
               AND event_time >= $4 AND event_time < $5",
        )
        .bind(org_id)
        .bind(event_type.as_str())
        .bind(status.as_str())
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn find_open_issue(
        &self,
        org_id: Uuid,
        user_id: Option<Uuid>,
        issue_type: IssueType,
        scope_key: Option<&str>,
    ) -> Result<Option<Issue>> {
        let row = match user_id {
            Some(uid) => {
                sqlx::query(
                    "SELECT * FROM issues
                     WHERE org_id = $1 AND user_id = $2 AND issue_type = $3 AND status = 'open'",
                )
                .bind(org_id)
                .bind(uid)
                .bind(issue_type.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM issues
                     WHERE org_id = $1 AND user_id IS NULL AND issue_type = $2
                       AND COALESCE(scope_key, '') = COALESCE($3, '') AND status = 'open'",
                )
                .bind(org_id)
                .bind(issue_type.as_str())
                .bind(scope_key)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(issue_from_row).transpose()
    }

    async fn insert_issue(&self, issue: Issue) -> Result<InsertOutcome> {
        let result = sqlx::query(
            "INSERT INTO issues
                (id, org_id, user_id, issue_type, severity, status, title, description,
                 estimated_revenue_cents, confidence, detector_id, detection_tier,
                 evidence, scope_key, resolution, resolved_at, ai_summary, ai_summary_at,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                     $15, $16, $17, $18, $19, $20)",
        )
        .bind(issue.id)
        .bind(issue.org_id)
        .bind(issue.user_id)
        .bind(issue.issue_type.as_str())
        .bind(issue.severity.as_str())
        .bind(issue.status.as_str())
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(issue.estimated_revenue_cents)
        .bind(issue.confidence)
        .bind(&issue.detector_id)
        .bind(issue.detection_tier.as_str())
        .bind(&issue.evidence)
        .bind(&issue.scope_key)
        .bind(&issue.resolution)
        .bind(issue.resolved_at)
        .bind(&issue.ai_summary)
        .bind(issue.ai_summary_at)
        .bind(issue.created_at)
        .bind(issue.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            // A racing writer hit the partial unique index first
            Err(err) => {
                let mapped = DatabaseError::from(err);
                if mapped.is_conflict() {
                    Ok(InsertOutcome::Duplicate)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn get_issue(&self, org_id: Uuid, issue_id: Uuid) -> Result<Option<Issue>> {
        let row = sqlx::query("SELECT * FROM issues WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(issue_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(issue_from_row).transpose()
    }

    async fn list_issues(&self, org_id: Uuid, filter: IssueFilter) -> Result<Vec<Issue>> {
        let rows = sqlx::query(
            "SELECT * FROM issues
             WHERE org_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR severity = $3)
               AND ($4::text IS NULL OR issue_type = $4)
             ORDER BY created_at DESC
             LIMIT $5 OFFSET $6",
        )
        .bind(org_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.severity.map(|s| s.as_str()))
        .bind(filter.issue_type.map(|t| t.as_str()))
        .bind(filter.clamped_limit())
        .bind(filter.offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(issue_from_row).collect()
    }

    async fn update_issue_status(
        &self,
        org_id: Uuid,
        issue_id: Uuid,
        status: IssueStatus,
        resolution: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Issue>> {
        let row = sqlx::query(
            "UPDATE issues SET
                status = $3,
                resolution = COALESCE($4, resolution),
                resolved_at = CASE WHEN $3 = 'resolved' THEN $5 ELSE resolved_at END,
                updated_at = $5
             WHERE org_id = $1 AND id = $2
             RETURNING *",
        )
        .bind(org_id)
        .bind(issue_id)
        .bind(status.as_str())
        .bind(&resolution)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(issue_from_row).transpose()
    }

    async fn issue_summary(&self, org_id: Uuid) -> Result<IssueSummary> {
        let rows = sqlx::query(
            "SELECT severity, issue_type, estimated_revenue_cents
             FROM issues WHERE org_id = $1 AND status = 'open'",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        let mut revenue: i64 = 0;
        for row in &rows {
            let severity: String = row.try_get("severity")?;
            let issue_type: String = row.try_get("issue_type")?;
            let cents: Option<i64> = row.try_get("estimated_revenue_cents")?;
            *by_severity.entry(severity).or_insert(0) += 1;
            *by_type.entry(issue_type).or_insert(0) += 1;
            revenue += cents.unwrap_or(0);
        }
        Ok(IssueSummary {
            open_total: rows.len() as u64,
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
        sqlx::query(
            "UPDATE issues SET ai_summary = $3, ai_summary_at = $4
             WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(issue_id)
        .bind(&summary)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_webhook_log(&self, log: WebhookLog) -> Result<WebhookLog> {
        sqlx::query(
            "INSERT INTO webhook_logs
                (id, org_id, source, processing_status, event_type, external_event_id,
                 error_message, headers, body, created_at, processed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(log.id)
        .bind(log.org_id)
        .bind(log.source.as_str())
        .bind(log.processing_status.as_str())
        .bind(&log.event_type)
        .bind(&log.external_event_id)
        .bind(&log.error_message)
        .bind(&log.headers)
        .bind(&log.body)
        .bind(log.created_at)
        .bind(log.processed_at)
        .execute(&self.pool)
        .await?;
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
        sqlx::query(
            "UPDATE webhook_logs SET
                processing_status = $3,
                error_message = COALESCE($4, error_message),
                processed_at = COALESCE($5, processed_at)
             WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(log_id)
        .bind(status.as_str())
        .bind(&error_message)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn annotate_webhook_log(
        &self,
        org_id: Uuid,
        log_id: Uuid,
        event_type: Option<String>,
        external_event_id: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_logs SET
                event_type = COALESCE($3, event_type),
                external_event_id = COALESCE($4, external_event_id)
             WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id)
        .bind(log_id)
        .bind(&event_type)
        .bind(&external_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_log(&self, org_id: Uuid, log_id: Uuid) -> Result<Option<WebhookLog>> {
        let row = sqlx::query("SELECT * FROM webhook_logs WHERE org_id = $1 AND id = $2")
            .bind(org_id)
            .bind(log_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(webhook_log_from_row).transpose()
    }

    async fn list_webhook_logs(
        &self,
        org_id: Uuid,
        filter: WebhookLogFilter,
    ) -> Result<Vec<WebhookLog>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_logs
             WHERE org_id = $1
               AND ($2::text IS NULL OR source = $2)
               AND ($3::text IS NULL OR processing_status = $3)
             ORDER BY created_at DESC
             LIMIT $4",
        )
        .bind(org_id)
        .bind(filter.source.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.clamped_limit())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(webhook_log_from_row).collect()
    }

    async fn count_webhook_logs(
        &self,
        org_id: Uuid,
        source: Source,
        status: ProcessingStatus,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM webhook_logs
             WHERE org_id = $1 AND source = $2 AND processing_status = $3 AND created_at >= $4",
        )
        .bind(org_id)
        .bind(source.as_str())
        .bind(status.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn purge_webhook_logs(&self, org_id: Uuid, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM webhook_logs WHERE org_id = $1 AND created_at < $2",
        )
        .bind(org_id)
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_access_check(&self, check: AccessCheck) -> Result<AccessCheck> {
        sqlx::query(
            "INSERT INTO access_checks
                (id, org_id, user_id, product_id, external_user_id, has_access,
                 reported_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(check.id)
        .bind(check.org_id)
        .bind(check.user_id)
        .bind(check.product_id)
        .bind(&check.external_user_id)
        .bind(check.has_access)
        .bind(check.reported_at)
        .bind(check.created_at)
        .execute(&self.pool)
        .await?;
        Ok(check)
    }

    async fn latest_access_check(
        &self,
        org_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<AccessCheck>> {
        let row = sqlx::query(
            "SELECT * FROM access_checks
             WHERE org_id = $1 AND user_id = $2
             ORDER BY reported_at DESC LIMIT 1",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(access_check_from_row).transpose()
    }

    async fn latest_access_checks(&self, org_id: Uuid) -> Result<Vec<AccessCheck>> {
        let rows = sqlx::query(
            "SELECT DISTINCT ON (user_id) * FROM access_checks
             WHERE org_id = $1 AND user_id IS NOT NULL
             ORDER BY user_id, reported_at DESC",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(access_check_from_row).collect()
    }

    async fn upsert_alert_config(&self, config: AlertConfig) -> Result<AlertConfig> {
        let event_types: Option<Vec<String>> = config
            .event_types
            .as_ref()
            .map(|types| types.iter().map(|t| t.as_str().to_string()).collect());
        sqlx::query(
            "INSERT INTO alert_configs
                (id, org_id, channel, endpoint_url, signing_secret, routing_key,
                 slack_channel, event_types, is_active, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (org_id, channel) DO UPDATE SET
                endpoint_url = EXCLUDED.endpoint_url,
                signing_secret = EXCLUDED.signing_secret,
                routing_key = EXCLUDED.routing_key,
                slack_channel = EXCLUDED.slack_channel,
                event_types = EXCLUDED.event_types,
                is_active = EXCLUDED.is_active",
        )
        .bind(config.id)
        .bind(config.org_id)
        .bind(config.channel.as_str())
        .bind(&config.endpoint_url)
        .bind(&config.signing_secret)
        .bind(&config.routing_key)
        .bind(&config.slack_channel)
        .bind(&event_types)
        .bind(config.is_active)
        .bind(config.created_at)
        .execute(&self.pool)
        .await?;
        Ok(config)
    }

    async fn list_alert_configs(&self, org_id: Uuid) -> Result<Vec<AlertConfig>> {
        let rows = sqlx::query("SELECT * FROM alert_configs WHERE org_id = $1")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(alert_config_from_row).collect()
    }

    async fn insert_audit(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log
                (id, org_id, actor, action, entity_type, entity_id, detail, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(entry.id)
        .bind(entry.org_id)
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.detail)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn integration_health(
        &self,
        org_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConnectionHealth>> {
        let since = now - Duration::hours(24);
        let connections = self.list_connections(org_id).await?;
        let mut health = Vec::with_capacity(connections.len());
        for conn in connections {
            let row = sqlx::query(
                "SELECT
                    COUNT(*) FILTER (WHERE processing_status = 'processed') AS processed,
                    COUNT(*) FILTER (WHERE processing_status = 'failed') AS failed
                 FROM webhook_logs
                 WHERE org_id = $1 AND source = $2 AND created_at >= $3",
            )
            .bind(org_id)
            .bind(conn.source.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
            let processed: i64 = row.try_get("processed")?;
            let failed: i64 = row.try_get("failed")?;
            health.push(ConnectionHealth {
                source: conn.source,
                is_active: conn.is_active,
                sync_status: conn.sync_status,
                last_webhook_at: conn.last_webhook_at,
                last_sync_at: conn.last_sync_at,
                processed_24h: processed as u64,
                failed_24h: failed as u64,
            });
        }
        Ok(health)
    }
}
