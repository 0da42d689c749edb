//! Core type definitions for the RevWatch platform
//!
//! This module contains the closed vocabularies used across all services:
//! billing sources, canonical event types, entitlement states, issue
//! classification, and API key scopes. Illegal combinations are kept
//! unrepresentable by modelling each of these as an exhaustive enum.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// BILLING SOURCES
// ============================================================================

/// Billing providers the platform ingests webhooks from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Stripe,
    Apple,
    Google,
    Recurly,
    Braintree,
}

impl Source {
    pub const ALL: [Source; 5] = [
        Source::Stripe,
        Source::Apple,
        Source::Google,
        Source::Recurly,
        Source::Braintree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Stripe => "stripe",
            Source::Apple => "apple",
            Source::Google => "google",
            Source::Recurly => "recurly",
            Source::Braintree => "braintree",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(Source::Stripe),
            "apple" => Ok(Source::Apple),
            "google" => Ok(Source::Google),
            "recurly" => Ok(Source::Recurly),
            "braintree" => Ok(Source::Braintree),
            _ => Err(format!("Invalid billing source: {}", s)),
        }
    }
}

// ============================================================================
// IDENTITY GRAPH
// ============================================================================

/// The kind of external identifier carried by a user identity row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    CustomerId,
    OriginalTransactionId,
    AppUserId,
    Email,
    BundleId,
    AccountCode,
    PurchaseToken,
    SubscriptionId,
}

impl IdentityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityType::CustomerId => "customer_id",
            IdentityType::OriginalTransactionId => "original_transaction_id",
            IdentityType::AppUserId => "app_user_id",
            IdentityType::Email => "email",
            IdentityType::BundleId => "bundle_id",
            IdentityType::AccountCode => "account_code",
            IdentityType::PurchaseToken => "purchase_token",
            IdentityType::SubscriptionId => "subscription_id",
        }
    }
}

impl FromStr for IdentityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer_id" => Ok(IdentityType::CustomerId),
            "original_transaction_id" => Ok(IdentityType::OriginalTransactionId),
            "app_user_id" => Ok(IdentityType::AppUserId),
            "email" => Ok(IdentityType::Email),
            "bundle_id" => Ok(IdentityType::BundleId),
            "account_code" => Ok(IdentityType::AccountCode),
            "purchase_token" => Ok(IdentityType::PurchaseToken),
            "subscription_id" => Ok(IdentityType::SubscriptionId),
            _ => Err(format!("Invalid identity type: {}", s)),
        }
    }
}

impl fmt::Display for IdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENTITLEMENTS
// ============================================================================

/// Per (user, product, source) subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    Inactive,
    Trial,
    Active,
    GracePeriod,
    BillingRetry,
    PastDue,
    Paused,
    Expired,
    Revoked,
    Refunded,
}

impl Default for EntitlementState {
    fn default() -> Self {
        EntitlementState::Inactive
    }
}

/// Cross-platform comparison grouping of entitlement states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessClass {
    AccessGranted,
    NoAccess,
    AtRisk,
    Neutral,
}

impl EntitlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementState::Inactive => "inactive",
            EntitlementState::Trial => "trial",
            EntitlementState::Active => "active",
            EntitlementState::GracePeriod => "grace_period",
            EntitlementState::BillingRetry => "billing_retry",
            EntitlementState::PastDue => "past_due",
            EntitlementState::Paused => "paused",
            EntitlementState::Expired => "expired",
            EntitlementState::Revoked => "revoked",
            EntitlementState::Refunded => "refunded",
        }
    }

    /// Map a state into its cross-platform comparison group
    pub fn access_class(&self) -> AccessClass {
        match self {
            EntitlementState::Trial | EntitlementState::Active => AccessClass::AccessGranted,
            EntitlementState::Expired | EntitlementState::Revoked | EntitlementState::Refunded => {
                AccessClass::NoAccess
            }
            EntitlementState::GracePeriod
            | EntitlementState::BillingRetry
            | EntitlementState::PastDue => AccessClass::AtRisk,
            EntitlementState::Paused | EntitlementState::Inactive => AccessClass::Neutral,
        }
    }

    /// States that currently grant (or should grant) app access
    pub fn grants_access(&self) -> bool {
        self.access_class() == AccessClass::AccessGranted
    }
}

impl FromStr for EntitlementState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(EntitlementState::Inactive),
            "trial" => Ok(EntitlementState::Trial),
            "active" => Ok(EntitlementState::Active),
            "grace_period" => Ok(EntitlementState::GracePeriod),
            "billing_retry" => Ok(EntitlementState::BillingRetry),
            "past_due" => Ok(EntitlementState::PastDue),
            "paused" => Ok(EntitlementState::Paused),
            "expired" => Ok(EntitlementState::Expired),
            "revoked" => Ok(EntitlementState::Revoked),
            "refunded" => Ok(EntitlementState::Refunded),
            _ => Err(format!("Invalid entitlement state: {}", s)),
        }
    }
}

impl fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CANONICAL EVENTS
// ============================================================================

/// Provider-agnostic event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalEventType {
    Purchase,
    Renewal,
    BillingRetry,
    GracePeriodStart,
    GracePeriodEnd,
    TrialConversion,
    Upgrade,
    Downgrade,
    Cancellation,
    Pause,
    Resume,
    Expiration,
    Refund,
    Chargeback,
    Revoke,
    OfferRedeemed,
    PriceChange,
}

impl CanonicalEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalEventType::Purchase => "purchase",
            CanonicalEventType::Renewal => "renewal",
            CanonicalEventType::BillingRetry => "billing_retry",
            CanonicalEventType::GracePeriodStart => "grace_period_start",
            CanonicalEventType::GracePeriodEnd => "grace_period_end",
            CanonicalEventType::TrialConversion => "trial_conversion",
            CanonicalEventType::Upgrade => "upgrade",
            CanonicalEventType::Downgrade => "downgrade",
            CanonicalEventType::Cancellation => "cancellation",
            CanonicalEventType::Pause => "pause",
            CanonicalEventType::Resume => "resume",
            CanonicalEventType::Expiration => "expiration",
            CanonicalEventType::Refund => "refund",
            CanonicalEventType::Chargeback => "chargeback",
            CanonicalEventType::Revoke => "revoke",
            CanonicalEventType::OfferRedeemed => "offer_redeemed",
            CanonicalEventType::PriceChange => "price_change",
        }
    }
}

impl FromStr for CanonicalEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(CanonicalEventType::Purchase),
            "renewal" => Ok(CanonicalEventType::Renewal),
            "billing_retry" => Ok(CanonicalEventType::BillingRetry),
            "grace_period_start" => Ok(CanonicalEventType::GracePeriodStart),
            "grace_period_end" => Ok(CanonicalEventType::GracePeriodEnd),
            "trial_conversion" => Ok(CanonicalEventType::TrialConversion),
            "upgrade" => Ok(CanonicalEventType::Upgrade),
            "downgrade" => Ok(CanonicalEventType::Downgrade),
            "cancellation" => Ok(CanonicalEventType::Cancellation),
            "pause" => Ok(CanonicalEventType::Pause),
            "resume" => Ok(CanonicalEventType::Resume),
            "expiration" => Ok(CanonicalEventType::Expiration),
            "refund" => Ok(CanonicalEventType::Refund),
            "chargeback" => Ok(CanonicalEventType::Chargeback),
            "revoke" => Ok(CanonicalEventType::Revoke),
            "offer_redeemed" => Ok(CanonicalEventType::OfferRedeemed),
            "price_change" => Ok(CanonicalEventType::PriceChange),
            _ => Err(format!("Invalid canonical event type: {}", s)),
        }
    }
}

impl fmt::Display for CanonicalEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on a canonical event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failed,
    Pending,
    Refunded,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
            EventStatus::Pending => "pending",
            EventStatus::Refunded => "refunded",
        }
    }
}

impl Default for EventStatus {
    fn default() -> Self {
        EventStatus::Success
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(EventStatus::Success),
            "failed" => Ok(EventStatus::Failed),
            "pending" => Ok(EventStatus::Pending),
            "refunded" => Ok(EventStatus::Refunded),
            _ => Err(format!("Invalid event status: {}", s)),
        }
    }
}

/// Billing period classification carried on some canonical events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodType {
    Trial,
    Intro,
    Normal,
}

impl PeriodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodType::Trial => "trial",
            PeriodType::Intro => "intro",
            PeriodType::Normal => "normal",
        }
    }
}

impl FromStr for PeriodType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(PeriodType::Trial),
            "intro" => Ok(PeriodType::Intro),
            "normal" => Ok(PeriodType::Normal),
            _ => Err(format!("Invalid period type: {}", s)),
        }
    }
}

/// Provider environment the event originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Sandbox,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Production
    }
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Sandbox => "sandbox",
        }
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" => Ok(Environment::Production),
            "sandbox" => Ok(Environment::Sandbox),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

// ============================================================================
// WEBHOOK DELIVERY LOG
// ============================================================================

/// Processing lifecycle of an inbound webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Received,
    Queued,
    Processed,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Received => "received",
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Processed => "processed",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(ProcessingStatus::Received),
            "queued" => Ok(ProcessingStatus::Queued),
            "processed" => Ok(ProcessingStatus::Processed),
            "failed" => Ok(ProcessingStatus::Failed),
            "skipped" => Ok(ProcessingStatus::Skipped),
            _ => Err(format!("Invalid processing status: {}", s)),
        }
    }
}

// ============================================================================
// ISSUES
// ============================================================================

/// Closed set of anomaly classifications emitted by the detector registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    DuplicateBilling,
    UnrevokedRefund,
    CrossPlatformMismatch,
    DuplicateSubscription,
    WebhookDeliveryGap,
    RenewalAnomaly,
    StaleEntitlement,
    VerifiedPaidNoAccess,
    VerifiedAccessNoPayment,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::DuplicateBilling => "duplicate_billing",
            IssueType::UnrevokedRefund => "unrevoked_refund",
            IssueType::CrossPlatformMismatch => "cross_platform_mismatch",
            IssueType::DuplicateSubscription => "duplicate_subscription",
            IssueType::WebhookDeliveryGap => "webhook_delivery_gap",
            IssueType::RenewalAnomaly => "renewal_anomaly",
            IssueType::StaleEntitlement => "stale_entitlement",
            IssueType::VerifiedPaidNoAccess => "verified_paid_no_access",
            IssueType::VerifiedAccessNoPayment => "verified_access_no_payment",
        }
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "duplicate_billing" => Ok(IssueType::DuplicateBilling),
            "unrevoked_refund" => Ok(IssueType::UnrevokedRefund),
            "cross_platform_mismatch" => Ok(IssueType::CrossPlatformMismatch),
            "duplicate_subscription" => Ok(IssueType::DuplicateSubscription),
            "webhook_delivery_gap" => Ok(IssueType::WebhookDeliveryGap),
            "renewal_anomaly" => Ok(IssueType::RenewalAnomaly),
            "stale_entitlement" => Ok(IssueType::StaleEntitlement),
            "verified_paid_no_access" => Ok(IssueType::VerifiedPaidNoAccess),
            "verified_access_no_payment" => Ok(IssueType::VerifiedAccessNoPayment),
            _ => Err(format!("Invalid issue type: {}", s)),
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Info,
    Warning,
    Critical,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueSeverity::Info => "info",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Critical => "critical",
        }
    }
}

impl FromStr for IssueSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(IssueSeverity::Info),
            "warning" => Ok(IssueSeverity::Warning),
            "critical" => Ok(IssueSeverity::Critical),
            _ => Err(format!("Invalid issue severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    Open,
    Acknowledged,
    Resolved,
    Dismissed,
}

impl IssueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::Acknowledged => "acknowledged",
            IssueStatus::Resolved => "resolved",
            IssueStatus::Dismissed => "dismissed",
        }
    }

    /// Whether the issue still counts against open-issue dedup
    pub fn is_open(&self) -> bool {
        matches!(self, IssueStatus::Open)
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IssueStatus::Open),
            "acknowledged" => Ok(IssueStatus::Acknowledged),
            "resolved" => Ok(IssueStatus::Resolved),
            "dismissed" => Ok(IssueStatus::Dismissed),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

/// Whether the detector works from provider data alone or needs
/// customer-reported access checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionTier {
    BillingOnly,
    AppVerified,
}

impl Default for DetectionTier {
    fn default() -> Self {
        DetectionTier::BillingOnly
    }
}

impl DetectionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionTier::BillingOnly => "billing_only",
            DetectionTier::AppVerified => "app_verified",
        }
    }
}

// ============================================================================
// ALERTING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertChannel {
    Webhook,
    Pagerduty,
    Slack,
}

impl AlertChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertChannel::Webhook => "webhook",
            AlertChannel::Pagerduty => "pagerduty",
            AlertChannel::Slack => "slack",
        }
    }
}

impl FromStr for AlertChannel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(AlertChannel::Webhook),
            "pagerduty" => Ok(AlertChannel::Pagerduty),
            "slack" => Ok(AlertChannel::Slack),
            _ => Err(format!("Invalid alert channel: {}", s)),
        }
    }
}

/// Alert event types carried on outbound deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertEventType {
    #[serde(rename = "issue.created")]
    IssueCreated,
    #[serde(rename = "issue.acknowledged")]
    IssueAcknowledged,
    #[serde(rename = "issue.resolved")]
    IssueResolved,
    #[serde(rename = "issue.dismissed")]
    IssueDismissed,
}

impl AlertEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEventType::IssueCreated => "issue.created",
            AlertEventType::IssueAcknowledged => "issue.acknowledged",
            AlertEventType::IssueResolved => "issue.resolved",
            AlertEventType::IssueDismissed => "issue.dismissed",
        }
    }
}

// ============================================================================
// API KEY SCOPES
// ============================================================================

/// Capability strings attached to API keys. An empty scope set grants
/// full access (legacy keys).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiScope {
    #[serde(rename = "issues:read")]
    IssuesRead,
    #[serde(rename = "issues:write")]
    IssuesWrite,
    #[serde(rename = "access_checks:write")]
    AccessChecksWrite,
    #[serde(rename = "setup:manage")]
    SetupManage,
    #[serde(rename = "admin:read")]
    AdminRead,
}

impl ApiScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiScope::IssuesRead => "issues:read",
            ApiScope::IssuesWrite => "issues:write",
            ApiScope::AccessChecksWrite => "access_checks:write",
            ApiScope::SetupManage => "setup:manage",
            ApiScope::AdminRead => "admin:read",
        }
    }
}

impl FromStr for ApiScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issues:read" => Ok(ApiScope::IssuesRead),
            "issues:write" => Ok(ApiScope::IssuesWrite),
            "access_checks:write" => Ok(ApiScope::AccessChecksWrite),
            "setup:manage" => Ok(ApiScope::SetupManage),
            "admin:read" => Ok(ApiScope::AdminRead),
            _ => Err(format!("Invalid API scope: {}", s)),
        }
    }
}

/// Connection sync lifecycle shown on the integration health surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Pending
    }
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "syncing" => Ok(SyncStatus::Syncing),
            "synced" => Ok(SyncStatus::Synced),
            "error" => Ok(SyncStatus::Error),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}
