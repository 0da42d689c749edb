//! The dispatcher: per-issue fan-out onto a bounded worker pool
//!
//! Detection calls [`AlertDispatcher::notify`] (via the
//! [`revwatch_detection::AlertSink`] trait) which enqueues without
//! blocking. Workers load the tenant's alert configs, filter by event
//! type, and deliver per channel behind a circuit breaker. Failed webhook
//! deliveries retry with exponential backoff (base 60 s, cap 1 h, five
//! attempts) and then dead-letter into the audit log.

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use revwatch_breaker::BreakerRegistry;
use revwatch_database::Store;
use revwatch_detection::AlertSink;
use revwatch_shared::{AlertChannel, AlertConfig, AlertEventType, AuditEntry, Issue};

use crate::channels::{pagerduty, slack, webhook};
use crate::error::{AlertError, Result};

const QUEUE_CAPACITY: usize = 1024;
const MAX_WEBHOOK_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub dashboard_url: Option<String>,
    pub slack_bot_token: Option<String>,
    /// Backoff base for webhook retries; production 60 s, tests shrink it
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Overridable endpoints for tests
    pub pagerduty_url: String,
    pub slack_post_url: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dashboard_url: None,
            slack_bot_token: None,
            retry_base: Duration::from_secs(60),
            retry_cap: Duration::from_secs(3600),
            pagerduty_url: pagerduty::EVENTS_URL.to_string(),
            slack_post_url: slack::POST_MESSAGE_URL.to_string(),
        }
    }
}

/// One pending (issue, event) announcement
#[derive(Debug, Clone)]
struct AlertJob {
    org_id: Uuid,
    issue: Issue,
    event_type: AlertEventType,
}

/// A single channel delivery attempt (fanned out from an [`AlertJob`])
#[derive(Debug, Clone)]
struct ChannelDelivery {
    job: AlertJob,
    config: AlertConfig,
    attempt: u32,
}

enum WorkItem {
    Fanout(AlertJob),
    Deliver(ChannelDelivery),
}

pub struct AlertDispatcher {
    tx: mpsc::Sender<WorkItem>,
}

impl AlertDispatcher {
    /// Spawn the worker pool; returns the dispatcher handle and the
    /// worker join handles (awaited during shutdown drain)
    pub fn start(
        store: Arc<dyn Store>,
        breakers: BreakerRegistry,
        config: DispatcherConfig,
    ) -> (Arc<Self>, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<WorkItem>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let client = Client::new();
        let config = Arc::new(config);

        let mut handles = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            let rx = rx.clone();
            let worker = Worker {
                store: store.clone(),
                breakers: breakers.clone(),
                client: client.clone(),
                config: config.clone(),
                tx: tx.clone(),
            };
            handles.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => worker.handle(item).await,
                        None => break,
                    }
                }
                info!(worker_id, "alert worker stopped");
            }));
        }

        (Arc::new(Self { tx }), handles)
    }

    /// Enqueue an announcement; never blocks the caller
    pub fn dispatch(&self, org_id: Uuid, issue: Issue, event_type: AlertEventType) {
        let job = WorkItem::Fanout(AlertJob {
            org_id,
            issue,
            event_type,
        });
        if let Err(err) = self.tx.try_send(job) {
            warn!(error = %err, "alert queue full, dropping announcement");
        }
    }
}

impl AlertSink for AlertDispatcher {
    fn notify(&self, org_id: Uuid, issue: &Issue, event_type: AlertEventType) {
        self.dispatch(org_id, issue.clone(), event_type);
    }
}

struct Worker {
    store: Arc<dyn Store>,
    breakers: BreakerRegistry,
    client: Client,
    config: Arc<DispatcherConfig>,
    tx: mpsc::Sender<WorkItem>,
}

impl Worker {
    async fn handle(&self, item: WorkItem) {
        match item {
            WorkItem::Fanout(job) => self.fanout(job).await,
            WorkItem::Deliver(delivery) => self.deliver(delivery).await,
        }
    }

    async fn fanout(&self, job: AlertJob) {
        let configs = match self.store.list_alert_configs(job.org_id).await {
            Ok(configs) => configs,
            Err(err) => {
                error!(error = %err, "failed to load alert configs");
                return;
            }
        };

        for config in configs {
            if !config.is_active || !config.admits(job.event_type) {
                continue;
            }
            let delivery = WorkItem::Deliver(ChannelDelivery {
                job: job.clone(),
                config,
                attempt: 0,
            });
            if self.tx.try_send(delivery).is_err() {
                warn!("alert queue full, dropping channel delivery");
            }
        }
    }

    async fn deliver(&self, delivery: ChannelDelivery) {
        let channel = delivery.config.channel;
        let breaker = self.breakers.get(&format!("alert-{}", channel.as_str()));

        let result: Result<()> = match breaker.try_acquire() {
            Err(err) => Err(AlertError::Breaker(err)),
            Ok(()) => {
                let outcome = self.send(&delivery).await;
                match &outcome {
                    Ok(()) => breaker.record_success(),
                    Err(_) => breaker.record_failure(),
                }
                outcome
            }
        };

        match result {
            Ok(()) => {
                info!(
                    channel = channel.as_str(),
                    event = delivery.job.event_type.as_str(),
                    "alert delivered"
                );
            }
            Err(err) => self.handle_failure(delivery, err).await,
        }
    }

    async fn send(&self, delivery: &ChannelDelivery) -> Result<()> {
        let job = &delivery.job;
        match delivery.config.channel {
            AlertChannel::Webhook => {
                let signed = webhook::build_delivery(
                    &delivery.config,
                    &job.issue,
                    job.event_type,
                    self.config.dashboard_url.as_deref(),
                    Uuid::new_v4(),
                )?;
                webhook::deliver(&self.client, &delivery.config, &signed).await
            }
            AlertChannel::Pagerduty => {
                pagerduty::deliver(
                    &self.client,
                    &delivery.config,
                    &job.issue,
                    job.event_type,
                    self.config.dashboard_url.as_deref(),
                    &self.config.pagerduty_url,
                )
                .await
            }
            AlertChannel::Slack => {
                let token = self
                    .config
                    .slack_bot_token
                    .as_deref()
                    .ok_or_else(|| AlertError::misconfigured("slack", "missing bot token"))?;
                let channel = delivery
                    .config
                    .slack_channel
                    .as_deref()
                    .ok_or_else(|| AlertError::misconfigured("slack", "missing channel"))?;
                slack::deliver(
                    &self.client,
                    token,
                    channel,
                    &job.issue,
                    self.config.dashboard_url.as_deref(),
                    &self.config.slack_post_url,
                )
                .await
            }
        }
    }

    async fn handle_failure(&self, delivery: ChannelDelivery, err: AlertError) {
        let retryable = err.is_retryable()
            && delivery.config.channel == AlertChannel::Webhook
            && delivery.attempt + 1 < MAX_WEBHOOK_ATTEMPTS;

        if retryable {
            let delay = self.backoff(delivery.attempt);
            warn!(
                attempt = delivery.attempt,
                delay_secs = delay.as_secs(),
                error = %err,
                "webhook delivery failed, scheduling retry"
            );
            let tx = self.tx.clone();
            let mut retry = delivery;
            retry.attempt += 1;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(WorkItem::Deliver(retry)).await;
            });
            return;
        }

        error!(
            channel = delivery.config.channel.as_str(),
            attempt = delivery.attempt,
            error = %err,
            "alert delivery dead-lettered"
        );
        let _ = self
            .store
            .insert_audit(AuditEntry {
                id: Uuid::new_v4(),
                org_id: delivery.job.org_id,
                actor: "alert_dispatcher".to_string(),
                action: "alert.dead_letter".to_string(),
                entity_type: "issue".to_string(),
                entity_id: Some(delivery.job.issue.id.to_string()),
                detail: json!({
                    "channel": delivery.config.channel.as_str(),
                    "eventType": delivery.job.event_type.as_str(),
                    "attempts": delivery.attempt + 1,
                    "error": err.to_string(),
                }),
                created_at: Utc::now(),
            })
            .await;
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self
            .config
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempt));
        scaled.min(self.config.retry_cap)
    }
}
