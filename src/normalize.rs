//! Raw source records → internal grant shape.
//!
//! A record missing its external id or title, or carrying a deadline that
//! cannot be parsed, fails with [`GrantError::RecordParse`]; the pipeline
//! skips and counts it.

use chrono::NaiveDate;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use crate::error::{GrantError, GrantResult};
use crate::models::{GrantStatus, RawGrant};

const DATE_FORMATS: &[&str] = &["%d %b %Y", "%d %B %Y", "%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"];

/// A validated grant ready to be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedGrant {
    pub external_id: String,
    pub title: String,
    pub description: String,
    pub eligibility: String,
    pub agency_name: String,
    /// Acronym supplied by the source, if any. Derived acronyms are decided
    /// at agency resolution time.
    pub agency_acronym: Option<String>,
    pub funding_min: Option<i64>,
    pub funding_max: Option<i64>,
    pub opening_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub status: GrantStatus,
    pub categories: Vec<String>,
    pub duration: String,
    pub application_url: Option<String>,
    pub source_url: Option<String>,
}

impl NormalizedGrant {
    /// SHA-256 over every mutable field. Equal hashes mean an upsert would
    /// change nothing.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let fields = [
            self.title.clone(),
            self.description.clone(),
            self.eligibility.clone(),
            opt_num(self.funding_min),
            opt_num(self.funding_max),
            opt_date(self.opening_date),
            opt_date(self.deadline),
            self.status.as_str().to_string(),
            self.categories.join(","),
            self.duration.clone(),
            self.application_url.clone().unwrap_or_default(),
            self.source_url.clone().unwrap_or_default(),
        ];
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }
        format!("{:x}", hasher.finalize())
    }
}

fn opt_num(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

fn opt_date(v: Option<NaiveDate>) -> String {
    v.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default()
}

pub fn normalize(raw: &RawGrant, today: NaiveDate) -> GrantResult<NormalizedGrant> {
    let label = record_label(raw);
    let parse_err = |reason: &str| GrantError::RecordParse {
        record: label.clone(),
        reason: reason.to_string(),
    };

    let external_id = clean(raw.external_id.as_deref()).ok_or_else(|| parse_err("missing external id"))?;
    let title = clean(raw.title.as_deref()).ok_or_else(|| parse_err("missing title"))?;

    let deadline = match clean(raw.closing_date.as_deref()) {
        Some(text) => Some(
            parse_date(&text).ok_or_else(|| parse_err(&format!("unparseable deadline '{}'", text)))?,
        ),
        None => None,
    };
    // Opening dates are informational; a bad one is dropped rather than
    // rejecting the record.
    let opening_date = clean(raw.opening_date.as_deref()).and_then(|t| parse_date(&t));

    let (mut funding_min, mut funding_max) = (
        raw.funding_min.as_deref().and_then(parse_amount),
        raw.funding_max.as_deref().and_then(parse_amount),
    );
    if funding_min.is_none() && funding_max.is_none() {
        if let Some(text) = raw.funding.as_deref() {
            (funding_min, funding_max) = parse_funding(text);
        }
    }
    if let (Some(min), Some(max)) = (funding_min, funding_max) {
        if min > max {
            (funding_min, funding_max) = (Some(max), Some(min));
        }
    }

    let status = derive_status(raw.status.as_deref(), opening_date, deadline, today);

    Ok(NormalizedGrant {
        external_id,
        title,
        description: clean(raw.description.as_deref()).unwrap_or_default(),
        eligibility: clean(raw.eligibility.as_deref()).unwrap_or_default(),
        agency_name: clean(raw.agency_name.as_deref()).unwrap_or_else(|| "Unknown".to_string()),
        agency_acronym: clean(raw.agency_acronym.as_deref()).map(|a| a.to_uppercase()),
        funding_min,
        funding_max,
        opening_date,
        deadline,
        status,
        categories: normalize_categories(&raw.categories),
        duration: clean(raw.duration.as_deref()).unwrap_or_default(),
        application_url: clean(raw.application_url.as_deref()),
        source_url: clean(raw.source_url.as_deref()),
    })
}

fn record_label(raw: &RawGrant) -> String {
    clean(raw.external_id.as_deref())
        .or_else(|| clean(raw.title.as_deref()))
        .unwrap_or_else(|| "<unidentified>".to_string())
}

fn clean(value: Option<&str>) -> Option<String> {
    let collapsed = value?.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Explicit `closed` wins, then the deadline, then the opening date.
pub fn derive_status(
    explicit: Option<&str>,
    opening_date: Option<NaiveDate>,
    deadline: Option<NaiveDate>,
    today: NaiveDate,
) -> GrantStatus {
    if explicit.map_or(false, |s| s.trim().eq_ignore_ascii_case("closed")) {
        return GrantStatus::Closed;
    }
    if deadline.map_or(false, |d| d < today) {
        return GrantStatus::Closed;
    }
    if opening_date.map_or(false, |d| d > today) {
        return GrantStatus::Upcoming;
    }
    GrantStatus::Open
}

/// Lower-case, hyphenate, deduplicate, sort.
pub fn normalize_categories(raw: &[String]) -> Vec<String> {
    raw.iter()
        .map(|c| {
            c.to_lowercase()
                .replace('_', " ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("-")
        })
        .filter(|c| !c.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Initials of the first three words, or the first three letters of a
/// single-word name.
pub fn derive_acronym(agency_name: &str) -> String {
    let words: Vec<&str> = agency_name.split_whitespace().collect();
    let acronym: String = if words.len() >= 2 {
        words
            .iter()
            .take(3)
            .filter_map(|w| w.chars().find(|c| c.is_alphanumeric()))
            .collect()
    } else {
        agency_name.chars().filter(|c| c.is_alphanumeric()).take(3).collect()
    };
    if acronym.is_empty() {
        "UNK".to_string()
    } else {
        acronym.to_uppercase()
    }
}

/// Accepts the portal's date formats, an ISO timestamp, or either of those
/// after a `Label:` prefix such as `Closes: 15 Mar 2027`.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    try_formats(text)
        .or_else(|| text.get(..10).and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()))
        .or_else(|| {
            text.split_once(':')
                .and_then(|(_, rest)| try_formats(rest.trim()))
        })
}

fn try_formats(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
}

fn amount_regex() -> &'static Regex {
    static AMOUNT: OnceLock<Regex> = OnceLock::new();
    AMOUNT.get_or_init(|| {
        Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*([km])?\b").expect("static pattern")
    })
}

fn amounts(text: &str) -> Vec<i64> {
    amount_regex()
        .captures_iter(text)
        .filter_map(|caps| {
            let number: f64 = caps[1].replace(',', "").parse().ok()?;
            let scale = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                Some(s) if s == "k" => 1_000.0,
                Some(s) if s == "m" => 1_000_000.0,
                _ => 1.0,
            };
            Some((number * scale).round() as i64)
        })
        .collect()
}

/// First amount in `text`, e.g. `"$80K"` → 80000.
pub fn parse_amount(text: &str) -> Option<i64> {
    amounts(text).into_iter().next()
}

/// Funding text → `(min, max)`.
///
/// Two amounts form a range, a single amount is a fixed award unless the
/// text says "up to".
pub fn parse_funding(text: &str) -> (Option<i64>, Option<i64>) {
    let found = amounts(text);
    match found.as_slice() {
        [] => (None, None),
        [only] if text.to_lowercase().contains("up to") => (None, Some(*only)),
        [only] => (Some(*only), Some(*only)),
        [a, b, ..] => (Some(*a.min(b)), Some(*a.max(b))),
    }
}
