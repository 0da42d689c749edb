//! Backfill orchestration
//!
//! `start` takes the run lock, seeds the progress document, and spawns
//! the import; the HTTP layer returns immediately with the job id. The
//! import pages through the provider, synthesizes webhook payloads, and
//! replays them through the pipeline's trusted entry point. The
//! cancellation flag is honored between pages; the lock releases on every
//! exit path.

use chrono::Utc;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use revwatch_breaker::BreakerRegistry;
use revwatch_database::Store;
use revwatch_ingestion::IngestionPipeline;
use revwatch_security::CredentialVault;
use revwatch_shared::{AuditEntry, BillingConnection, Source, SyncStatus};

use crate::error::{BackfillError, Result};
use crate::lock::{LockGuard, LockManager};
use crate::progress::{
    lock_key, progress_key, BackfillProgress, BackfillStatus, ProgressStore,
};
use crate::providers::{google, recurly, stripe};

const LOCK_TTL: Duration = Duration::from_secs(3600);
/// How far back the Stripe historical event sweep reaches
const EVENT_LOOKBACK_DAYS: i64 = 30;

/// Caller-supplied inputs a provider may need
#[derive(Debug, Clone, Default)]
pub struct BackfillParams {
    /// Google Play has no list API; known purchase tokens come from the
    /// customer
    pub purchase_tokens: Vec<String>,
}

pub struct BackfillEngine {
    store: Arc<dyn Store>,
    pipeline: Arc<IngestionPipeline>,
    vault: Arc<CredentialVault>,
    progress_store: Arc<dyn ProgressStore>,
    locks: Arc<dyn LockManager>,
    breakers: BreakerRegistry,
    client: Client,
    stripe_base: Option<String>,
    recurly_base: Option<String>,
    google_base: Option<(String, String)>,
}

impl BackfillEngine {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<IngestionPipeline>,
        vault: Arc<CredentialVault>,
        progress_store: Arc<dyn ProgressStore>,
        locks: Arc<dyn LockManager>,
        breakers: BreakerRegistry,
    ) -> Self {
        Self {
            store,
            pipeline,
            vault,
            progress_store,
            locks,
            breakers,
            client: Client::new(),
            stripe_base: None,
            recurly_base: None,
            google_base: None,
        }
    }

    /// Point the provider clients at test servers
    pub fn with_endpoints(
        mut self,
        stripe_base: Option<String>,
        recurly_base: Option<String>,
        google_base: Option<(String, String)>,
    ) -> Self {
        self.stripe_base = stripe_base;
        self.recurly_base = recurly_base;
        self.google_base = google_base;
        self
    }

    /// Begin a run. Fails with [`BackfillError::AlreadyRunning`] while a
    /// previous run holds the lock.
    pub async fn start(
        self: Arc<Self>,
        org_id: Uuid,
        source: Source,
        params: BackfillParams,
    ) -> Result<BackfillProgress> {
        if !matches!(source, Source::Stripe | Source::Recurly | Source::Google) {
            return Err(BackfillError::Unsupported { source });
        }

        let connection = self
            .store
            .get_connection(org_id, source)
            .await?
            .ok_or(BackfillError::MissingConnection { source })?;

        let guard = LockGuard::try_acquire(self.locks.clone(), lock_key(source, org_id), LOCK_TTL)
            .await?
            .ok_or(BackfillError::AlreadyRunning { source, org_id })?;

        let progress = BackfillProgress::new(Uuid::new_v4());
        self.progress_store
            .save(&progress_key(source, org_id), &progress)
            .await?;

        self.store
            .update_connection_sync(org_id, source, SyncStatus::Syncing, None)
            .await?;

        let engine = self;
        let job_id = progress.job_id;
        tokio::spawn(async move {
            let outcome = engine
                .run(org_id, source, connection, params, job_id)
                .await;
            if let Err(err) = &outcome {
                error!(org_id = %org_id, source = %source, error = %err, "backfill failed");
                let _ = engine.mark_failed(org_id, source, err.to_string()).await;
            }
            if let Err(err) = guard.release().await {
                warn!(error = %err, "backfill lock release failed");
            }
        });

        Ok(progress)
    }

    pub async fn progress(&self, org_id: Uuid, source: Source) -> Result<Option<BackfillProgress>> {
        self.progress_store.load(&progress_key(source, org_id)).await
    }

    /// Flip the cancellation flag; the runner aborts at the next page edge
    pub async fn request_cancel(&self, org_id: Uuid, source: Source) -> Result<bool> {
        let key = progress_key(source, org_id);
        match self.progress_store.load(&key).await? {
            Some(mut progress) if !progress.is_terminal() => {
                progress.cancel_requested = true;
                progress.updated_at = Utc::now();
                self.progress_store.save(&key, &progress).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn run(
        &self,
        org_id: Uuid,
        source: Source,
        connection: BillingConnection,
        params: BackfillParams,
        job_id: Uuid,
    ) -> Result<()> {
        let started = Instant::now();
        let key = progress_key(source, org_id);
        let mut progress = BackfillProgress::new(job_id);

        let credentials = self
            .vault
            .decrypt(&connection.credentials_enc)
            .map_err(|e| BackfillError::credentials(e.to_string()))?;
        let run_id = short_run_id(job_id);

        progress.status = BackfillStatus::Counting;
        progress.phase = "counting".into();
        self.save(&key, &mut progress).await?;

        match source {
            Source::Stripe => {
                self.run_stripe(org_id, &credentials, &run_id, &key, &mut progress, started)
                    .await?
            }
            Source::Recurly => {
                self.run_recurly(org_id, &credentials, &run_id, &key, &mut progress, started)
                    .await?
            }
            Source::Google => {
                self.run_google(
                    org_id,
                    &credentials,
                    &params,
                    &run_id,
                    &key,
                    &mut progress,
                    started,
                )
                .await?
            }
            _ => return Err(BackfillError::Unsupported { source }),
        }

        progress.status = BackfillStatus::Completed;
        progress.phase = "completed".into();
        progress.completed_at = Some(Utc::now());
        progress.estimated_seconds_remaining = Some(0);
        self.save(&key, &mut progress).await?;

        self.store
            .update_connection_sync(org_id, source, SyncStatus::Synced, Some(Utc::now()))
            .await?;
        self.store
            .insert_audit(AuditEntry {
                id: Uuid::new_v4(),
                org_id,
                actor: "backfill_engine".into(),
                action: "backfill.completed".into(),
                entity_type: "billing_connection".into(),
                entity_id: Some(source.as_str().to_string()),
                detail: serde_json::json!({
                    "jobId": job_id.to_string(),
                    "importedCustomers": progress.imported_customers,
                    "importedEvents": progress.imported_events,
                }),
                created_at: Utc::now(),
            })
            .await?;

        info!(
            org_id = %org_id,
            source = %source,
            customers = progress.imported_customers,
            events = progress.imported_events,
            "backfill completed"
        );
        Ok(())
    }

    async fn run_stripe(
        &self,
        org_id: Uuid,
        credentials: &str,
        run_id: &str,
        key: &str,
        progress: &mut BackfillProgress,
        started: Instant,
    ) -> Result<()> {
        let secret_key = credential_field(credentials, "secret_key");
        let breaker = self.breakers.get("stripe-api");
        let mut client = stripe::StripeClient::new(self.client.clone(), secret_key, breaker);
        if let Some(base) = &self.stripe_base {
            client = client.with_base_url(base.clone());
        }

        progress.status = BackfillStatus::ImportingSubscriptions;
        progress.phase = "importing_subscriptions".into();
        self.save(key, progress).await?;

        let mut cursor: Option<String> = None;
        loop {
            self.check_cancelled(key).await?;
            let page = client.list_subscriptions(cursor.as_deref()).await?;
            progress.total_customers += page.items.len() as u64;
            for subscription in &page.items {
                if let Some(raw) = stripe::synthesize_subscription_payload(subscription, run_id) {
                    self.replay(org_id, Source::Stripe, raw, progress).await;
                }
                progress.imported_customers += 1;
            }
            progress.update_rate(started.elapsed().as_secs_f64());
            self.save(key, progress).await?;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        progress.status = BackfillStatus::ImportingEvents;
        progress.phase = "importing_events".into();
        self.save(key, progress).await?;

        let created_gte = (Utc::now() - chrono::Duration::days(EVENT_LOOKBACK_DAYS)).timestamp();
        let mut cursor: Option<String> = None;
        loop {
            self.check_cancelled(key).await?;
            let page = client.list_events(created_gte, cursor.as_deref()).await?;
            progress.total_events += page.items.len() as u64;
            for event in &page.items {
                if let Some(raw) = stripe::synthesize_event_payload(event, run_id) {
                    self.replay(org_id, Source::Stripe, raw, progress).await;
                }
                progress.imported_events += 1;
            }
            progress.update_rate(started.elapsed().as_secs_f64());
            self.save(key, progress).await?;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    async fn run_recurly(
        &self,
        org_id: Uuid,
        credentials: &str,
        run_id: &str,
        key: &str,
        progress: &mut BackfillProgress,
        started: Instant,
    ) -> Result<()> {
        let api_key = credential_field(credentials, "api_key");
        let breaker = self.breakers.get("recurly-api");
        let mut client = recurly::RecurlyClient::new(self.client.clone(), api_key, breaker);
        if let Some(base) = &self.recurly_base {
            client = client.with_base_url(base.clone());
        }

        progress.status = BackfillStatus::ImportingSubscriptions;
        progress.phase = "importing_subscriptions".into();
        self.save(key, progress).await?;

        let mut cursor: Option<String> = None;
        loop {
            self.check_cancelled(key).await?;
            let page = client.list_subscriptions(cursor.as_deref()).await?;
            progress.total_customers += page.items.len() as u64;
            for subscription in &page.items {
                if let Some(raw) = recurly::synthesize_subscription_payload(subscription, run_id) {
                    self.replay(org_id, Source::Recurly, raw, progress).await;
                }
                progress.imported_customers += 1;
            }
            progress.update_rate(started.elapsed().as_secs_f64());
            self.save(key, progress).await?;
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_google(
        &self,
        org_id: Uuid,
        credentials: &str,
        params: &BackfillParams,
        run_id: &str,
        key: &str,
        progress: &mut BackfillProgress,
        started: Instant,
    ) -> Result<()> {
        let parsed: serde_json::Value = serde_json::from_str(credentials)
            .map_err(|e| BackfillError::credentials(format!("google credentials: {}", e)))?;
        let package_name = parsed
            .get("package_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackfillError::credentials("missing package_name"))?
            .to_string();
        let service_account: google::ServiceAccount = serde_json::from_value(parsed.clone())
            .map_err(|e| BackfillError::credentials(format!("service account: {}", e)))?;

        let breaker = self.breakers.get("google-api");
        let mut client = google::GoogleClient::new(
            self.client.clone(),
            package_name.clone(),
            service_account,
            breaker,
        );
        if let Some((base, token)) = &self.google_base {
            client = client.with_base_url(base.clone(), token.clone());
        }

        let access_token = {
            let oauth = self.breakers.get("google-oauth");
            oauth.try_acquire()?;
            match client.oauth_token().await {
                Ok(token) => {
                    oauth.record_success();
                    token
                }
                Err(err) => {
                    oauth.record_failure();
                    return Err(err);
                }
            }
        };

        progress.status = BackfillStatus::ImportingSubscriptions;
        progress.phase = "importing_subscriptions".into();
        progress.total_customers = params.purchase_tokens.len() as u64;
        self.save(key, progress).await?;

        for token in &params.purchase_tokens {
            self.check_cancelled(key).await?;
            match client.get_subscription(&access_token, token).await {
                Ok(subscription) => {
                    let raw = google::synthesize_subscription_payload(
                        &package_name,
                        token,
                        &subscription,
                        run_id,
                    );
                    self.replay(org_id, Source::Google, raw, progress).await;
                }
                Err(err) => {
                    warn!(error = %err, "purchase token resolution failed");
                    progress.errors.push(format!("token {}: {}", token, err));
                }
            }
            progress.imported_customers += 1;
            progress.update_rate(started.elapsed().as_secs_f64());
            self.save(key, progress).await?;
        }

        progress.status = BackfillStatus::ImportingEvents;
        progress.phase = "importing_events".into();
        self.save(key, progress).await?;

        let mut page_token: Option<String> = None;
        loop {
            self.check_cancelled(key).await?;
            let page = client
                .list_voided_purchases(&access_token, page_token.as_deref())
                .await?;
            progress.total_events += page.items.len() as u64;
            for voided in &page.items {
                if let Some(raw) = google::synthesize_voided_payload(&package_name, voided, run_id)
                {
                    self.replay(org_id, Source::Google, raw, progress).await;
                }
                progress.imported_events += 1;
            }
            progress.update_rate(started.elapsed().as_secs_f64());
            self.save(key, progress).await?;
            match page.next_cursor {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(())
    }

    /// Replay one synthesized payload through the trusted pipeline.
    /// Failures are recorded on the progress document but never abort the
    /// run.
    async fn replay(
        &self,
        org_id: Uuid,
        source: Source,
        raw: Vec<u8>,
        progress: &mut BackfillProgress,
    ) {
        match self
            .pipeline
            .process_trusted_webhook(org_id, source, raw)
            .await
        {
            Ok(()) => progress.events_created += 1,
            Err(err) => {
                warn!(error = %err, "backfill replay failed");
                progress.errors.push(err.to_string());
            }
        }
    }

    async fn check_cancelled(&self, key: &str) -> Result<()> {
        if let Some(progress) = self.progress_store.load(key).await? {
            if progress.cancel_requested {
                return Err(BackfillError::Cancelled);
            }
        }
        Ok(())
    }

    async fn save(&self, key: &str, progress: &mut BackfillProgress) -> Result<()> {
        progress.updated_at = Utc::now();
        self.progress_store.save(key, progress).await
    }

    async fn mark_failed(&self, org_id: Uuid, source: Source, error: String) -> Result<()> {
        let key = progress_key(source, org_id);
        if let Some(mut progress) = self.progress_store.load(&key).await? {
            progress.status = BackfillStatus::Failed;
            progress.phase = "failed".into();
            progress.errors.push(error);
            progress.completed_at = Some(Utc::now());
            self.save(&key, &mut progress).await?;
        }
        self.store
            .update_connection_sync(org_id, source, SyncStatus::Error, None)
            .await?;
        Ok(())
    }
}

/// Pull a named field out of JSON credentials; a bare string credential
/// is treated as the secret itself
fn credential_field(credentials: &str, field: &str) -> String {
    serde_json::from_str::<serde_json::Value>(credentials)
        .ok()
        .and_then(|value| {
            value
                .get(field)
                .and_then(|f| f.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| credentials.to_string())
}

/// Short run discriminator appended to synthesized event ids
fn short_run_id(job_id: Uuid) -> String {
    job_id.simple().to_string()[..8].to_string()
}
