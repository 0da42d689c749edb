//! PagerDuty Events API v2

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use revwatch_shared::{AlertConfig, AlertEventType, Issue, IssueSeverity};

use crate::error::{AlertError, Result};

pub const EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Build the Events v2 envelope. Issue resolution sends `resolve` with
/// the same dedup key so PagerDuty closes the incident.
pub fn build_payload(
    routing_key: &str,
    issue: &Issue,
    event_type: AlertEventType,
    dashboard_url: Option<&str>,
) -> Value {
    let event_action = match event_type {
        AlertEventType::IssueResolved | AlertEventType::IssueDismissed => "resolve",
        _ => "trigger",
    };

    let mut payload = json!({
        "routing_key": routing_key,
        "event_action": event_action,
        "dedup_key": issue.id.to_string(),
        "payload": {
            "summary": issue.title,
            "severity": match issue.severity {
                IssueSeverity::Critical => "critical",
                IssueSeverity::Warning => "warning",
                IssueSeverity::Info => "info",
            },
            "source": "revwatch",
            "custom_details": {
                "issueType": issue.issue_type.as_str(),
                "description": issue.description,
                "estimatedRevenueCents": issue.estimated_revenue_cents,
                "confidence": issue.confidence,
                "detectorId": issue.detector_id,
            },
        },
    });

    if let Some(base) = dashboard_url {
        payload["links"] = json!([{
            "href": format!("{}/issues/{}", base.trim_end_matches('/'), issue.id),
            "text": "Open in dashboard",
        }]);
    }

    payload
}

pub async fn deliver(
    client: &Client,
    config: &AlertConfig,
    issue: &Issue,
    event_type: AlertEventType,
    dashboard_url: Option<&str>,
    events_url: &str,
) -> Result<()> {
    let routing_key = config
        .routing_key
        .as_deref()
        .ok_or_else(|| AlertError::misconfigured("pagerduty", "missing routing_key"))?;

    let payload = build_payload(routing_key, issue, event_type, dashboard_url);
    let response = client
        .post(events_url)
        .timeout(TIMEOUT)
        .json(&payload)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(AlertError::HttpStatus {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use revwatch_shared::*;
    use uuid::Uuid;

    fn issue(severity: IssueSeverity) -> Issue {
        Issue {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            user_id: None,
            issue_type: IssueType::DuplicateBilling,
            severity,
            status: IssueStatus::Open,
            title: "User billed twice".into(),
            description: "d".into(),
            estimated_revenue_cents: Some(1999),
            confidence: 0.9,
            detector_id: "duplicate_billing".into(),
            detection_tier: DetectionTier::BillingOnly,
            evidence: serde_json::json!({}),
            scope_key: None,
            resolution: None,
            resolved_at: None,
            ai_summary: None,
            ai_summary_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_trigger_payload() {
        let issue = issue(IssueSeverity::Critical);
        let payload = build_payload(
            "rk-123",
            &issue,
            AlertEventType::IssueCreated,
            Some("https://dash.example.com/"),
        );
        assert_eq!(payload["routing_key"], "rk-123");
        assert_eq!(payload["event_action"], "trigger");
        assert_eq!(payload["dedup_key"], issue.id.to_string());
        assert_eq!(payload["payload"]["severity"], "critical");
        assert_eq!(
            payload["links"][0]["href"],
            format!("https://dash.example.com/issues/{}", issue.id)
        );
    }

    #[test]
    fn test_resolution_sends_resolve() {
        let issue = issue(IssueSeverity::Warning);
        let payload = build_payload("rk-123", &issue, AlertEventType::IssueResolved, None);
        assert_eq!(payload["event_action"], "resolve");
        assert_eq!(payload["dedup_key"], issue.id.to_string());
    }
}
