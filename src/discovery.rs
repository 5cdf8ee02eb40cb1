//! One-shot auto-discovery: exchanges a discovery key for an endpoint and
//! token at startup. Any failure here is fatal — falling back to possibly
//! empty CLI values would only defer the error to a confusing place.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::dialer::{to_ascii_url, Dialer};

pub const DEFAULT_DISCOVERY_URL: &str = "https://discovery.hostbeat.dev/api/v1/agent";

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct DiscoveryResponse {
    endpoint: String,
    token: String,
}

/// POST the key to the discovery service and return `(endpoint, token)`.
pub async fn exchange(dialer: &Dialer, key: &str) -> Result<(String, String)> {
    let url = std::env::var("HOSTBEAT_DISCOVERY_URL")
        .unwrap_or_else(|_| DEFAULT_DISCOVERY_URL.to_string());
    let url = to_ascii_url(&url)?;
    let client = dialer.http_client(DISCOVERY_TIMEOUT);
    let response = client
        .post(&url)
        .json(&serde_json::json!({ "key": key }))
        .send()
        .await
        .context("discovery request failed")?
        .error_for_status()
        .context("discovery request rejected")?;
    let body: DiscoveryResponse = response
        .json()
        .await
        .context("malformed discovery response")?;
    if body.endpoint.is_empty() || body.token.is_empty() {
        bail!("discovery response missing endpoint or token");
    }
    info!("auto-discovery resolved endpoint {}", body.endpoint);
    Ok((body.endpoint, body.token))
}
