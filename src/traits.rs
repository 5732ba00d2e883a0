//! Grant source abstraction and the ordered fallback chain.
//!
//! Every place grant listings can come from implements [`GrantSource`].
//! Live syncs run through a [`SourceChain`] that tries each source in
//! order and stops at the first one that succeeds:
//!
//! ```text
//! ┌──────────┐  fail  ┌────────────┐  fail  ┌───────────────────┐
//! │ ApiSource│──────▶│ScrapeSource│──────▶│ SourceUnavailable │
//! └────┬─────┘        └─────┬──────┘        └───────────────────┘
//!      │ ok                 │ ok
//!      ▼                    ▼
//!            run_sync() → normalize → upsert
//! ```
//!
//! The sample dataset ([`crate::connector_sample::SampleSource`]) is never
//! mixed into the live chain: `sync --sample` runs a chain holding only the
//! sample source.
//!
//! # Usage
//!
//! ```rust,no_run
//! use grantmatch::traits::SourceChain;
//! use grantmatch::connector_api::ApiSource;
//! use grantmatch::connector_scrape::ScrapeSource;
//! # fn example(portal: &grantmatch::config::PortalConfig) -> anyhow::Result<()> {
//! let chain = SourceChain::new()
//!     .with(Box::new(ApiSource::new(portal)?))
//!     .with(Box::new(ScrapeSource::new(portal)?));
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::{GrantError, GrantResult};
use crate::models::RawGrant;

/// Records returned by one source fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawGrant>,
    /// Elements the source could not even decode into a [`RawGrant`],
    /// with a reason each. Counted as skipped by the pipeline.
    pub rejected: Vec<String>,
}

impl FetchOutcome {
    pub fn from_records(records: Vec<RawGrant>) -> Self {
        Self {
            records,
            rejected: Vec::new(),
        }
    }
}

/// A place grant listings can be fetched from.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use grantmatch::models::RawGrant;
/// use grantmatch::traits::{FetchOutcome, GrantSource};
///
/// struct Fixed(Vec<RawGrant>);
///
/// #[async_trait]
/// impl GrantSource for Fixed {
///     fn name(&self) -> &str { "fixed" }
///     async fn fetch(&self) -> Result<FetchOutcome> {
///         Ok(FetchOutcome::from_records(self.0.clone()))
///     }
/// }
/// ```
#[async_trait]
pub trait GrantSource: Send + Sync {
    /// Short label recorded in `sync_runs.source` and in log lines.
    fn name(&self) -> &str;

    /// Fetch the complete listing.
    ///
    /// An `Err` means the source as a whole is unusable (network failure,
    /// non-success status, undecodable payload) and the next source in a
    /// chain should be tried. Individual bad records belong in
    /// [`FetchOutcome::rejected`] instead.
    async fn fetch(&self) -> Result<FetchOutcome>;
}

/// Ordered fallback over several sources.
#[derive(Default)]
pub struct SourceChain {
    sources: Vec<Box<dyn GrantSource>>,
}

impl SourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Box<dyn GrantSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Try each source in order. Returns the first success together with
    /// the name of the source that produced it.
    pub async fn fetch_first(&self) -> GrantResult<(String, FetchOutcome)> {
        let mut attempts = Vec::new();

        for source in &self.sources {
            match source.fetch().await {
                Ok(outcome) => {
                    info!(
                        source = source.name(),
                        records = outcome.records.len(),
                        rejected = outcome.rejected.len(),
                        "grant source fetched"
                    );
                    return Ok((source.name().to_string(), outcome));
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "grant source failed, trying next");
                    attempts.push(format!("{}: {:#}", source.name(), e));
                }
            }
        }

        if attempts.is_empty() {
            attempts.push("no sources configured".to_string());
        }
        Err(GrantError::SourceUnavailable { attempts })
    }
}
