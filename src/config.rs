//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to documented
//! defaults so a minimal config file is two lines long.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub applications: ApplicationsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Where live grant listings come from.
#[derive(Debug, Deserialize, Clone)]
pub struct PortalConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// JSON listing endpoint. When unset the API step is skipped and the
    /// sync falls through to scraping.
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_listing_path")]
    pub listing_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_url: None,
            listing_path: default_listing_path(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            user_agent: default_user_agent(),
        }
    }
}

impl PortalConfig {
    /// Absolute URL of the HTML listing page.
    pub fn listing_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.listing_path.trim_start_matches('/')
        )
    }
}

fn default_base_url() -> String {
    "https://oursggrants.gov.sg".to_string()
}
fn default_listing_path() -> String {
    "/grants".to_string()
}
fn default_timeout_secs() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    1
}
fn default_user_agent() -> String {
    format!("grantmatch/{}", env!("CARGO_PKG_VERSION"))
}

/// Scoring weights and the qualification threshold for the matcher.
#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_min_score")]
    pub min_score: u32,
    #[serde(default = "default_category_weight")]
    pub category_weight: f64,
    #[serde(default = "default_funding_weight")]
    pub funding_weight: f64,
    #[serde(default = "default_text_weight")]
    pub text_weight: f64,
    /// Additive bonus when the grant's agency is one the project prefers.
    #[serde(default = "default_agency_weight")]
    pub agency_weight: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            category_weight: default_category_weight(),
            funding_weight: default_funding_weight(),
            text_weight: default_text_weight(),
            agency_weight: default_agency_weight(),
        }
    }
}

impl MatchingConfig {
    pub fn core_weight_sum(&self) -> f64 {
        self.category_weight + self.funding_weight + self.text_weight
    }
}

fn default_min_score() -> u32 {
    1
}
fn default_category_weight() -> f64 {
    0.5
}
fn default_funding_weight() -> f64 {
    0.3
}
fn default_text_weight() -> f64 {
    0.2
}
fn default_agency_weight() -> f64 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationsConfig {
    /// Require a live (non-stale) match before an application can be opened.
    #[serde(default = "default_require_match")]
    pub require_match: bool,
}

impl Default for ApplicationsConfig {
    fn default() -> Self {
        Self {
            require_match: default_require_match(),
        }
    }
}

fn default_require_match() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.portal.timeout_secs == 0 {
        anyhow::bail!("portal.timeout_secs must be > 0");
    }

    let m = &config.matching;
    if m.min_score > 100 {
        anyhow::bail!("matching.min_score must be in [0, 100]");
    }
    for (name, w) in [
        ("category_weight", m.category_weight),
        ("funding_weight", m.funding_weight),
        ("text_weight", m.text_weight),
        ("agency_weight", m.agency_weight),
    ] {
        if !w.is_finite() || w < 0.0 {
            anyhow::bail!("matching.{} must be a non-negative number", name);
        }
    }
    if m.core_weight_sum() <= 0.0 {
        anyhow::bail!("matching weights (category + funding + text) must sum to > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!("[db]\npath = \"/tmp/gm.sqlite\"\n{}", extra);
        let cfg: Config = toml::from_str(&content)?;
        validate(&cfg)?;
        Ok(cfg)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.portal.timeout_secs, 5);
        assert_eq!(cfg.portal.listing_path, "/grants");
        assert!(cfg.portal.api_url.is_none());
        assert_eq!(cfg.matching.min_score, 1);
        assert!(cfg.applications.require_match);
        assert_eq!(cfg.server.bind, "127.0.0.1:7340");
    }

    #[test]
    fn test_listing_url_joins_slashes() {
        let cfg = parse("[portal]\nbase_url = \"http://localhost:9000/\"\nlisting_path = \"/grants\"\n")
            .unwrap();
        assert_eq!(cfg.portal.listing_url(), "http://localhost:9000/grants");
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = parse("[portal]\ntimeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn test_rejects_negative_weight() {
        let err = parse("[matching]\nfunding_weight = -0.1\n").unwrap_err();
        assert!(err.to_string().contains("funding_weight"));
    }

    #[test]
    fn test_rejects_all_zero_core_weights() {
        let err = parse(
            "[matching]\ncategory_weight = 0.0\nfunding_weight = 0.0\ntext_weight = 0.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("sum"));
    }

    #[test]
    fn test_rejects_min_score_over_100() {
        assert!(parse("[matching]\nmin_score = 101\n").is_err());
    }
}
