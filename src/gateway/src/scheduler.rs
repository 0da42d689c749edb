//! Periodic work: scheduled detector scans and cleanup
//!
//! Aggregate health detectors run every 15 minutes, per-user scans every
//! 60. Each (tenant, detector) pair is guarded by an advisory lock with a
//! TTL equal to the interval: if the previous run still holds it, the
//! tick is skipped and logged, never queued up.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use revwatch_detection::{default_registry, DetectionEngine, Detector};

use crate::state::AppState;

const AGGREGATE_DETECTORS: [&str; 2] = ["webhook_delivery_gap", "renewal_anomaly"];
const PER_USER_DETECTORS: [&str; 3] = [
    "data_freshness",
    "verified_paid_no_access",
    "verified_access_no_payment",
];

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub aggregate_interval: Duration,
    pub per_user_interval: Duration,
    pub cleanup_interval: Duration,
    pub log_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            aggregate_interval: Duration::from_secs(15 * 60),
            per_user_interval: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(24 * 3600),
            log_retention_days: 30,
        }
    }
}

/// One engine per detector so locks apply per (tenant, detector)
fn engines_for(state: &AppState, ids: &[&str]) -> Vec<(&'static str, Arc<DetectionEngine>)> {
    default_registry()
        .into_iter()
        .filter(|d| ids.contains(&d.id()))
        .map(|detector: Arc<dyn Detector>| {
            let id = detector.id();
            let engine = Arc::new(
                DetectionEngine::new(state.store.clone(), vec![detector])
                    .with_sink(state.dispatcher.clone()),
            );
            (id, engine)
        })
        .collect()
}

pub fn start(
    state: AppState,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(scan_loop(
        state.clone(),
        engines_for(&state, &AGGREGATE_DETECTORS),
        config.aggregate_interval,
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(scan_loop(
        state.clone(),
        engines_for(&state, &PER_USER_DETECTORS),
        config.per_user_interval,
        shutdown.clone(),
    )));
    handles.push(tokio::spawn(cleanup_loop(state, config, shutdown)));

    handles
}

async fn scan_loop(
    state: AppState,
    engines: Vec<(&'static str, Arc<DetectionEngine>)>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let org_ids = match state.store.list_org_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "scheduler could not list tenants");
                continue;
            }
        };

        for org_id in org_ids {
            for (detector_id, engine) in &engines {
                let lock_key = format!("scan-lock:{}:{}", detector_id, org_id);
                let acquired = match state.lock_manager.acquire(&lock_key, interval).await {
                    Ok(acquired) => acquired,
                    Err(err) => {
                        warn!(error = %err, "scan lock acquisition failed");
                        continue;
                    }
                };
                if !acquired {
                    debug!(
                        detector = detector_id,
                        org = %org_id,
                        "previous scan still running, skipping tick"
                    );
                    continue;
                }

                let created = engine.run_scheduled(org_id).await;
                if !created.is_empty() {
                    info!(
                        detector = detector_id,
                        org = %org_id,
                        issues = created.len(),
                        "scheduled scan emitted issues"
                    );
                }

                if let Err(err) = state.lock_manager.release(&lock_key).await {
                    warn!(error = %err, "scan lock release failed");
                }
            }
        }
    }
    info!("detector scan loop stopped");
}

async fn cleanup_loop(
    state: AppState,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let horizon = chrono::Utc::now() - chrono::Duration::days(config.log_retention_days);
        let org_ids = match state.store.list_org_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "cleanup could not list tenants");
                continue;
            }
        };
        for org_id in org_ids {
            match state.store.purge_webhook_logs(org_id, horizon).await {
                Ok(0) => {}
                Ok(purged) => info!(org = %org_id, purged, "purged old webhook logs"),
                Err(err) => warn!(error = %err, "webhook log purge failed"),
            }
        }
    }
    info!("cleanup loop stopped");
}
