//! Tier-2 detectors: the customer application reports what access it
//! actually serves, and we reconcile that against billing truth.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use revwatch_database::Store;
use revwatch_shared::{DetectedIssue, DetectionTier, IssueSeverity, IssueType};

use crate::error::Result;
use crate::Detector;

const PAID_NO_ACCESS_CONFIDENCE: f64 = 0.9;
const ACCESS_NO_PAYMENT_CONFIDENCE: f64 = 0.85;

/// The user pays but the app says it is not serving access
pub struct VerifiedPaidNoAccess;

#[async_trait]
impl Detector for VerifiedPaidNoAccess {
    fn id(&self) -> &'static str {
        "verified_paid_no_access"
    }

    fn name(&self) -> &'static str {
        "Paid but no access"
    }

    fn description(&self) -> &'static str {
        "Active entitlements whose latest app-reported access check is negative"
    }

    fn tier(&self) -> DetectionTier {
        DetectionTier::AppVerified
    }

    async fn scheduled_scan(&self, store: &dyn Store, org_id: Uuid) -> Result<Vec<DetectedIssue>> {
        let mut found = Vec::new();
        for ent in store.list_access_granted_entitlements(org_id).await? {
            let Some(check) = store.latest_access_check(org_id, ent.user_id).await? else {
                continue;
            };
            if check.has_access {
                continue;
            }

            found.push(DetectedIssue {
                user_id: Some(ent.user_id),
                issue_type: IssueType::VerifiedPaidNoAccess,
                severity: IssueSeverity::Critical,
                title: format!("Paying {} subscriber locked out of the app", ent.source),
                description: format!(
                    "The {} entitlement is in state {} but the application reported \
                     hasAccess=false at {}. A paying customer is not getting what \
                     they paid for.",
                    ent.source,
                    ent.state,
                    check.reported_at.to_rfc3339()
                ),
                estimated_revenue_cents: ent.plan_amount_cents,
                confidence: PAID_NO_ACCESS_CONFIDENCE,
                detector_id: self.id().to_string(),
                detection_tier: DetectionTier::AppVerified,
                evidence: json!({
                    "source": ent.source.as_str(),
                    "entitlementState": ent.state.as_str(),
                    "checkReportedAt": check.reported_at.to_rfc3339(),
                }),
                scope_key: None,
            });
        }
        Ok(found)
    }
}

/// The app serves access but no billing source backs it
pub struct VerifiedAccessNoPayment;

#[async_trait]
impl Detector for VerifiedAccessNoPayment {
    fn id(&self) -> &'static str {
        "verified_access_no_payment"
    }

    fn name(&self) -> &'static str {
        "Access without payment"
    }

    fn description(&self) -> &'static str {
        "App-reported access with no active entitlement behind it"
    }

    fn tier(&self) -> DetectionTier {
        DetectionTier::AppVerified
    }

    async fn scheduled_scan(&self, store: &dyn Store, org_id: Uuid) -> Result<Vec<DetectedIssue>> {
        let granted: HashMap<Uuid, ()> = store
            .list_access_granted_entitlements(org_id)
            .await?
            .into_iter()
            .map(|e| (e.user_id, ()))
            .collect();

        let mut found = Vec::new();
        for check in store.latest_access_checks(org_id).await? {
            if !check.has_access {
                continue;
            }
            let Some(user_id) = check.user_id else {
                continue;
            };
            if granted.contains_key(&user_id) {
                continue;
            }

            found.push(DetectedIssue {
                user_id: Some(user_id),
                issue_type: IssueType::VerifiedAccessNoPayment,
                severity: IssueSeverity::Warning,
                title: "App access served without an active subscription".to_string(),
                description: format!(
                    "The application reported hasAccess=true at {} but no billing \
                     source shows an active entitlement. Revenue is leaking.",
                    check.reported_at.to_rfc3339()
                ),
                estimated_revenue_cents: None,
                confidence: ACCESS_NO_PAYMENT_CONFIDENCE,
                detector_id: self.id().to_string(),
                detection_tier: DetectionTier::AppVerified,
                evidence: json!({
                    "checkReportedAt": check.reported_at.to_rfc3339(),
                    "externalUserId": check.external_user_id,
                }),
                scope_key: None,
            });
        }
        Ok(found)
    }
}
