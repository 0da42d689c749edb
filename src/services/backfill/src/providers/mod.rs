//! Provider import clients
//!
//! Each client paginates the provider's list APIs behind a circuit
//! breaker and synthesizes provider-shaped webhook payloads whose event
//! ids carry the run id, so replay through the pipeline coexists with
//! live deliveries.

pub mod google;
pub mod recurly;
pub mod stripe;

use crate::error::{BackfillError, Result};

/// One page of provider objects plus the cursor for the next page
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<serde_json::Value>,
    pub next_cursor: Option<String>,
}

pub(crate) async fn read_json_response(
    response: reqwest::Response,
) -> Result<serde_json::Value> {
    let status = response.status();
    if !status.is_success() {
        return Err(BackfillError::ProviderApi {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response.json().await?)
}
