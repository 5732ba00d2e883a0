//! JSON API connector for the grants portal.
//!
//! Accepts either a top-level array of listings or an object wrapping the
//! array under `grants`, `data`, `results`, or `items`. Each element is
//! decoded on its own so one malformed listing is rejected without failing
//! the batch.
//!
//! # Retry Strategy
//!
//! Shared with the scrape connector through [`get_with_retry`]:
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, …)
//! - other non-success statuses → fail immediately
//! - network errors and timeouts → retry

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::PortalConfig;
use crate::models::RawGrant;
use crate::traits::{FetchOutcome, GrantSource};

pub struct ApiSource {
    client: reqwest::Client,
    url: Option<String>,
    max_retries: u32,
}

impl ApiSource {
    pub fn new(portal: &PortalConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(portal)?,
            url: portal.api_url.clone(),
            max_retries: portal.max_retries,
        })
    }
}

#[async_trait]
impl GrantSource for ApiSource {
    fn name(&self) -> &str {
        "api"
    }

    async fn fetch(&self) -> Result<FetchOutcome> {
        let url = match &self.url {
            Some(url) => url,
            None => bail!("API endpoint not configured"),
        };

        let response = get_with_retry(&self.client, url, self.max_retries).await?;
        let payload: Value = response
            .json()
            .await
            .context("malformed JSON payload")?;

        parse_api_payload(payload)
    }
}

/// HTTP client with the portal's timeout and user agent.
pub fn build_client(portal: &PortalConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(portal.timeout_secs))
        .user_agent(portal.user_agent.clone())
        .build()?)
}

/// GET with bounded retries. Returns the first successful response.
pub async fn get_with_retry(
    client: &reqwest::Client,
    url: &str,
    max_retries: u32,
) -> Result<reqwest::Response> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(url, attempt, delay_secs = delay.as_secs(), "retrying portal request");
            tokio::time::sleep(delay).await;
        }

        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(anyhow::anyhow!("GET {} returned {}", url, status));
                    continue;
                }

                bail!("GET {} returned {}", url, status);
            }
            Err(e) => {
                last_err = Some(anyhow::Error::new(e).context(format!("GET {} failed", url)));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("GET {} failed after retries", url)))
}

pub fn parse_api_payload(payload: Value) -> Result<FetchOutcome> {
    let items = match payload {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let key = ["grants", "data", "results", "items"]
                .into_iter()
                .find(|k| map.get(*k).map_or(false, Value::is_array));
            match key.and_then(|k| map.remove(k)) {
                Some(Value::Array(items)) => items,
                _ => bail!("unexpected payload shape: no listing array found"),
            }
        }
        _ => bail!("unexpected payload shape: expected an array or object"),
    };

    let mut outcome = FetchOutcome::default();
    for (index, item) in items.into_iter().enumerate() {
        let label = item
            .get("external_id")
            .or_else(|| item.get("id"))
            .or_else(|| item.get("grant_id"))
            .map(|v| v.to_string().trim_matches('"').to_string())
            .unwrap_or_else(|| format!("#{}", index));

        match RawGrant::from_json(item) {
            Ok(raw) => outcome.records.push(raw),
            Err(e) => outcome.rejected.push(format!("{}: {}", label, e)),
        }
    }

    Ok(outcome)
}
