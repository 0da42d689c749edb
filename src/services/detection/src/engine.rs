//! Engine orchestration: dedup, persistence, failure isolation, fan-out

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use revwatch_database::{InsertOutcome, Store};
use revwatch_shared::{AlertEventType, CanonicalEvent, DetectedIssue, Issue, IssueStatus};

use crate::error::Result;
use crate::{AlertSink, Detector, NullAlertSink};

/// Runs the detector registry and owns issue emission
pub struct DetectionEngine {
    store: Arc<dyn Store>,
    registry: Vec<Arc<dyn Detector>>,
    sink: Arc<dyn AlertSink>,
}

impl DetectionEngine {
    pub fn new(store: Arc<dyn Store>, registry: Vec<Arc<dyn Detector>>) -> Self {
        Self {
            store,
            registry,
            sink: Arc::new(NullAlertSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn detector_ids(&self) -> Vec<&'static str> {
        self.registry.iter().map(|d| d.id()).collect()
    }

    /// Event-triggered pass; runs inline with ingestion. Individual
    /// detector failures are logged and swallowed.
    pub async fn run_event(
        &self,
        org_id: Uuid,
        user_id: Option<Uuid>,
        event: &CanonicalEvent,
    ) -> Vec<Issue> {
        let mut created = Vec::new();
        for detector in &self.registry {
            match detector
                .check_event(self.store.as_ref(), org_id, user_id, event)
                .await
            {
                Ok(found) => {
                    for detected in found {
                        if let Some(issue) = self.emit(org_id, detected).await {
                            created.push(issue);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        detector = detector.id(),
                        error = %err,
                        "detector failed during event check"
                    );
                }
            }
        }
        created
    }

    /// Scheduled tenant-wide pass
    pub async fn run_scheduled(&self, org_id: Uuid) -> Vec<Issue> {
        let mut created = Vec::new();
        for detector in &self.registry {
            match detector.scheduled_scan(self.store.as_ref(), org_id).await {
                Ok(found) => {
                    for detected in found {
                        if let Some(issue) = self.emit(org_id, detected).await {
                            created.push(issue);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        detector = detector.id(),
                        error = %err,
                        "detector failed during scheduled scan"
                    );
                }
            }
        }
        created
    }

    /// Dedup + insert + alert. Returns the persisted issue when this call
    /// created it; `None` on dedup skip or storage failure.
    async fn emit(&self, org_id: Uuid, detected: DetectedIssue) -> Option<Issue> {
        match self.try_emit(org_id, detected).await {
            Ok(issue) => issue,
            Err(err) => {
                error!(error = %err, "failed to persist detected issue");
                None
            }
        }
    }

    async fn try_emit(&self, org_id: Uuid, detected: DetectedIssue) -> Result<Option<Issue>> {
        let existing = self
            .store
            .find_open_issue(
                org_id,
                detected.user_id,
                detected.issue_type,
                detected.scope_key.as_deref(),
            )
            .await?;
        if existing.is_some() {
            debug!(
                issue_type = detected.issue_type.as_str(),
                "open issue already exists, skipping emission"
            );
            return Ok(None);
        }

        let now = Utc::now();
        let issue = Issue {
            id: Uuid::new_v4(),
            org_id,
            user_id: detected.user_id,
            issue_type: detected.issue_type,
            severity: detected.severity,
            status: IssueStatus::Open,
            title: detected.title,
            description: detected.description,
            estimated_revenue_cents: detected.estimated_revenue_cents,
            confidence: detected.confidence,
            detector_id: detected.detector_id,
            detection_tier: detected.detection_tier,
            evidence: detected.evidence,
            scope_key: detected.scope_key,
            resolution: None,
            resolved_at: None,
            ai_summary: None,
            ai_summary_at: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_issue(issue.clone()).await? {
            InsertOutcome::Inserted => {
                info!(
                    issue_type = issue.issue_type.as_str(),
                    severity = issue.severity.as_str(),
                    "issue created"
                );
                self.sink.notify(org_id, &issue, AlertEventType::IssueCreated);
                Ok(Some(issue))
            }
            // A racing writer inserted first; treat as dedup skip
            InsertOutcome::Duplicate => Ok(None),
        }
    }
}
