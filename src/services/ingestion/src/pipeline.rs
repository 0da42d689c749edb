//! The ingestion worker
//!
//! Per job: mark the log queued, normalize, gate on idempotency, resolve
//! identity, persist the canonical event, apply the entitlement
//! transition, run event-triggered detectors, mark the log processed.
//! Everything after the idempotency gate is idempotent, so a retried job
//! that re-runs the tail is safe.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use revwatch_database::{InsertOutcome, Store};
use revwatch_detection::DetectionEngine;
use revwatch_normalizer::dispatch as normalizer;
use revwatch_shared::{sanitize, ProcessingStatus, Source, WebhookLog};

use crate::entitlement::EntitlementEngine;
use crate::error::{IngestionError, Result};
use crate::identity::IdentityResolver;
use crate::queue::{JobQueue, WebhookJob};

/// Retry policy for transient failures
const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_CAP_MS: u64 = 30_000;
const MAX_ATTEMPTS: u32 = 8;
/// Wall-clock budget for one job before it goes back on the queue
const JOB_TIMEOUT_SECS: u64 = 30;

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    resolver: IdentityResolver,
    entitlements: EntitlementEngine,
    detection: Arc<DetectionEngine>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn Store>, detection: Arc<DetectionEngine>) -> Self {
        Self {
            resolver: IdentityResolver::new(store.clone()),
            entitlements: EntitlementEngine::new(store.clone()),
            store,
            detection,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Process one dequeued job through the full pipeline
    pub async fn process_job(&self, job: &WebhookJob) -> Result<()> {
        self.store
            .update_webhook_log(
                job.org_id,
                job.webhook_log_id,
                ProcessingStatus::Queued,
                None,
                None,
            )
            .await?;

        let events = match normalizer::normalize(
            job.source,
            job.org_id,
            &job.raw_body,
            job.received_at,
        ) {
            Ok(events) => events,
            Err(err) => {
                // Structured failure: record and stop, no retry
                warn!(
                    org_id = %job.org_id,
                    source = %job.source,
                    error = %err,
                    "normalization failed"
                );
                self.store
                    .update_webhook_log(
                        job.org_id,
                        job.webhook_log_id,
                        ProcessingStatus::Failed,
                        Some(format!("{}: {}", err.reason_code(), err)),
                        None,
                    )
                    .await?;
                return Ok(());
            }
        };

        if events.is_empty() {
            self.store
                .update_webhook_log(
                    job.org_id,
                    job.webhook_log_id,
                    ProcessingStatus::Skipped,
                    None,
                    Some(Utc::now()),
                )
                .await?;
            return Ok(());
        }

        let hints = normalizer::extract_identity_hints(job.source, &job.raw_body);
        let user_id = self.resolver.resolve(job.org_id, &hints).await?;

        let product_id = self.resolve_product(job.org_id, job.source, &hints).await?;

        let mut first_event_type = None;
        let mut first_external_id = None;

        for mut event in events {
            event.user_id = user_id;
            event.product_id = product_id;

            first_event_type.get_or_insert(event.event_type.as_str().to_string());
            if first_external_id.is_none() {
                first_external_id = event.external_event_id.clone();
            }

            let outcome = self.store.insert_canonical_event(event.clone()).await?;
            if outcome.is_duplicate() {
                debug!(
                    idempotency_key = %event.idempotency_key,
                    "duplicate delivery, skipping"
                );
                continue;
            }

            if let Some(user_id) = user_id {
                self.entitlements.apply(job.org_id, user_id, &event).await?;
            }

            let created = self.detection.run_event(job.org_id, user_id, &event).await;
            if !created.is_empty() {
                info!(
                    org_id = %job.org_id,
                    issues = created.len(),
                    "event-triggered detectors emitted issues"
                );
            }
        }

        self.store
            .annotate_webhook_log(
                job.org_id,
                job.webhook_log_id,
                first_event_type,
                first_external_id,
            )
            .await?;
        self.store
            .update_webhook_log(
                job.org_id,
                job.webhook_log_id,
                ProcessingStatus::Processed,
                None,
                Some(Utc::now()),
            )
            .await?;

        Ok(())
    }

    /// Entry point for backfill: the payload was synthesized locally, so
    /// signature verification is bypassed. A webhook log row is still
    /// written and the bytes run the normal pipeline.
    pub async fn process_trusted_webhook(
        &self,
        org_id: Uuid,
        source: Source,
        raw_body: Vec<u8>,
    ) -> Result<()> {
        let now = Utc::now();
        let log = self
            .store
            .insert_webhook_log(WebhookLog {
                id: Uuid::new_v4(),
                org_id,
                source,
                processing_status: ProcessingStatus::Received,
                event_type: None,
                external_event_id: None,
                error_message: None,
                headers: serde_json::json!({"x-revwatch-origin": "backfill"}),
                body: sanitize::body_for_storage(&raw_body),
                created_at: now,
                processed_at: None,
            })
            .await?;

        let job = WebhookJob {
            org_id,
            source,
            webhook_log_id: log.id,
            raw_body,
            raw_headers: Default::default(),
            received_at: now,
            trusted: true,
            attempt: 0,
        };
        self.process_job(&job).await
    }

    /// Product attribution: an explicit product hint wins, otherwise an
    /// org with exactly one active product gets that product
    async fn resolve_product(
        &self,
        org_id: Uuid,
        source: Source,
        hints: &[revwatch_shared::IdentityHint],
    ) -> Result<Option<Uuid>> {
        for hint in hints {
            let Some(meta) = &hint.metadata else { continue };
            let Some(external) = meta.get("product_id").and_then(|v| v.as_str()) else {
                continue;
            };
            if let Some(product) = self
                .store
                .find_product_by_external_id(org_id, source, external)
                .await?
            {
                return Ok(Some(product.id));
            }
        }
        Ok(self
            .store
            .single_active_product(org_id)
            .await?
            .map(|p| p.id))
    }
}

/// Worker loop: dequeue, process under a timeout, requeue transient
/// failures with exponential backoff. Exits when the queue closes (drain)
/// or the shutdown signal flips.
pub async fn run_worker(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<IngestionPipeline>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "ingestion worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = tokio::select! {
            job = queue.dequeue(Duration::from_secs(5)) => job,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        let job = match job {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(err) => {
                error!(worker_id, error = %err, "queue dequeue failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let result = tokio::time::timeout(
            Duration::from_secs(JOB_TIMEOUT_SECS),
            pipeline.process_job(&job),
        )
        .await
        .unwrap_or(Err(IngestionError::Timeout {
            seconds: JOB_TIMEOUT_SECS,
        }));

        match result {
            Ok(()) => {}
            Err(err) if err.is_retryable() && job.attempt + 1 < MAX_ATTEMPTS => {
                let delay = backoff_delay(job.attempt);
                warn!(
                    worker_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, requeueing"
                );
                let mut retry = job.clone();
                retry.attempt += 1;
                let queue = queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(err) = queue.enqueue(retry).await {
                        error!(error = %err, "failed to requeue job");
                    }
                });
            }
            Err(err) => {
                error!(worker_id, error = %err, "job failed terminally");
                let _ = pipeline
                    .store
                    .update_webhook_log(
                        job.org_id,
                        job.webhook_log_id,
                        ProcessingStatus::Failed,
                        Some(err.to_string()),
                        None,
                    )
                    .await;
            }
        }
    }
    info!(worker_id, "ingestion worker stopped");
}

fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}
