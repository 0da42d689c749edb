//! Slack CX-channel notifications
//!
//! The message body is built by a pure formatter; posting goes through
//! the bot token via `chat.postMessage`.

use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use revwatch_shared::{Issue, IssueSeverity};

use crate::error::{AlertError, Result};

pub const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Pure formatter for the issue announcement
pub fn format_issue_message(channel: &str, issue: &Issue, dashboard_url: Option<&str>) -> Value {
    let emoji = match issue.severity {
        IssueSeverity::Critical => ":rotating_light:",
        IssueSeverity::Warning => ":warning:",
        IssueSeverity::Info => ":information_source:",
    };
    let revenue = issue
        .estimated_revenue_cents
        .map(|cents| format!(" (~${:.2} at risk)", cents as f64 / 100.0))
        .unwrap_or_default();
    let link = dashboard_url
        .map(|base| {
            format!(
                "\n<{}/issues/{}|Open in dashboard>",
                base.trim_end_matches('/'),
                issue.id
            )
        })
        .unwrap_or_default();

    json!({
        "channel": channel,
        "text": format!("{} *{}*{}\n{}{}", emoji, issue.title, revenue, issue.description, link),
        "unfurl_links": false,
    })
}

pub async fn deliver(
    client: &Client,
    bot_token: &str,
    channel: &str,
    issue: &Issue,
    dashboard_url: Option<&str>,
    post_url: &str,
) -> Result<()> {
    let message = format_issue_message(channel, issue, dashboard_url);
    let response = client
        .post(post_url)
        .timeout(TIMEOUT)
        .bearer_auth(bot_token)
        .json(&message)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(AlertError::HttpStatus {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }

    // Slack reports API-level failures inside a 200 response
    let body: Value = response.json().await?;
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(())
    } else {
        Err(AlertError::transport(format!(
            "slack api error: {}",
            body.get("error").and_then(Value::as_str).unwrap_or("unknown")
        )))
    }
}
