//! Core data models.
//!
//! [`RawGrant`] is what a source hands to the sync pipeline; everything else
//! mirrors a row in the SQLite schema created by [`crate::migrate`].

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A grant listing as produced by a source, before normalisation.
///
/// Deliberately lenient: fields are optional strings so that numbers,
/// strings, and nulls from loosely-typed portal payloads all deserialize.
/// Validation happens in [`crate::normalize`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawGrant {
    #[serde(default, alias = "id", alias = "grant_id", deserialize_with = "stringish")]
    pub external_id: Option<String>,
    #[serde(default, alias = "name", deserialize_with = "stringish")]
    pub title: Option<String>,
    #[serde(default, alias = "summary", deserialize_with = "stringish")]
    pub description: Option<String>,
    #[serde(default, alias = "agency", deserialize_with = "stringish")]
    pub agency_name: Option<String>,
    #[serde(default, alias = "acronym", deserialize_with = "stringish")]
    pub agency_acronym: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    pub funding_min: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    pub funding_max: Option<String>,
    /// Free-text funding description such as `"$50K - $100K"`.
    #[serde(default, alias = "amount", deserialize_with = "stringish")]
    pub funding: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    pub opening_date: Option<String>,
    #[serde(default, alias = "deadline", deserialize_with = "stringish")]
    pub closing_date: Option<String>,
    #[serde(default, deserialize_with = "stringish")]
    pub status: Option<String>,
    #[serde(default, alias = "eligibility_criteria", deserialize_with = "stringish")]
    pub eligibility: Option<String>,
    #[serde(default, alias = "tags", alias = "category", deserialize_with = "string_list")]
    pub categories: Vec<String>,
    #[serde(default, deserialize_with = "stringish")]
    pub application_url: Option<String>,
    #[serde(default, alias = "url", deserialize_with = "stringish")]
    pub source_url: Option<String>,
    #[serde(default, alias = "duration_years", deserialize_with = "stringish")]
    pub duration: Option<String>,
}

fn stringish<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string or number, got {}",
            other
        ))),
    }
}

fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s.split(',').map(|p| p.trim().to_string()).collect()),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(serde::de::Error::custom(format!(
                    "expected a list of strings, found {}",
                    other
                ))),
            })
            .collect(),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a list of strings, got {}",
            other
        ))),
    }
}

/// Keys accepted for each aliased field, canonical name first.
const FIELD_KEYS: &[&[&str]] = &[
    &["external_id", "id", "grant_id"],
    &["title", "name"],
    &["description", "summary"],
    &["agency_name", "agency"],
    &["agency_acronym", "acronym"],
    &["funding", "amount"],
    &["closing_date", "deadline"],
    &["eligibility", "eligibility_criteria"],
    &["categories", "tags", "category"],
    &["source_url", "url"],
    &["duration", "duration_years"],
];

impl RawGrant {
    /// Decode one listing object from a portal payload.
    ///
    /// Portals often send a field under several of its accepted names at
    /// once. The first non-null key in `FIELD_KEYS` order wins and the
    /// others are dropped before decoding.
    pub fn from_json(value: Value) -> serde_json::Result<Self> {
        let value = match value {
            Value::Object(mut map) => {
                for keys in FIELD_KEYS {
                    let keep = keys
                        .iter()
                        .find(|k| map.get(**k).map_or(false, |v| !v.is_null()))
                        .copied();
                    for key in keys.iter().filter(|k| Some(**k) != keep) {
                        map.remove(*key);
                    }
                }
                Value::Object(map)
            }
            other => other,
        };
        serde_json::from_value(value)
    }
}

/// Government body issuing grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
    pub id: String,
    pub name: String,
    pub acronym: String,
    pub description: String,
    pub website: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Open,
    Closed,
    Upcoming,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Open => "open",
            GrantStatus::Closed => "closed",
            GrantStatus::Upcoming => "upcoming",
        }
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(GrantStatus::Open),
            "closed" => Ok(GrantStatus::Closed),
            "upcoming" => Ok(GrantStatus::Upcoming),
            other => Err(format!("unknown grant status: '{}'", other)),
        }
    }
}

/// A stored funding opportunity, joined with its agency's display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub external_id: String,
    pub agency_id: String,
    pub agency_name: String,
    pub agency_acronym: String,
    pub title: String,
    pub description: String,
    pub eligibility: String,
    pub funding_min: Option<i64>,
    pub funding_max: Option<i64>,
    pub opening_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub status: GrantStatus,
    pub categories: Vec<String>,
    pub duration: String,
    pub application_url: Option<String>,
    pub source_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Grant {
    pub fn days_until_deadline(&self, today: NaiveDate) -> Option<i64> {
        self.deadline.map(|d| (d - today).num_days())
    }

    pub fn funding_range(&self) -> String {
        match (self.funding_min, self.funding_max) {
            (Some(min), Some(max)) if min == max => format_amount(min),
            (Some(min), Some(max)) => format!("{} - {}", format_amount(min), format_amount(max)),
            (Some(min), None) => format!("{}+", format_amount(min)),
            (None, Some(max)) => format!("up to {}", format_amount(max)),
            (None, None) => "Amount not specified".to_string(),
        }
    }
}

/// `50000` → `"$50,000"`.
pub fn format_amount(value: i64) -> String {
    let digits = value.abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 2);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if value < 0 {
        format!("-${}", out)
    } else {
        format!("${}", out)
    }
}

/// A user's funding-seeking initiative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub funding_need: Option<i64>,
    /// Agency names or acronyms the owner would like support from.
    pub preferred_agencies: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub funding_need: Option<i64>,
    #[serde(default)]
    pub preferred_agencies: Vec<String>,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub categories: Option<Vec<String>>,
    /// `Some(None)` clears the need; a JSON `null` decodes to that.
    #[serde(default, deserialize_with = "present")]
    pub funding_need: Option<Option<i64>>,
    pub preferred_agencies: Option<Vec<String>>,
}

/// Marks a field as present even when its value is `null`, so an absent
/// key and an explicit `null` stay distinguishable.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Scored association between a project and a grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantMatch {
    pub id: String,
    pub project_id: String,
    pub grant_id: String,
    /// 0–100, higher is a better fit.
    pub score: i64,
    pub rationale: Vec<String>,
    pub is_saved: bool,
    pub stale: bool,
    pub stale_reason: Option<String>,
    pub computed_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Drafted,
    Submitted,
    UnderReview,
    Accepted,
    Rejected,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Drafted => "drafted",
            ApplicationStatus::Submitted => "submitted",
            ApplicationStatus::UnderReview => "under_review",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drafted" | "draft" => Ok(ApplicationStatus::Drafted),
            "submitted" => Ok(ApplicationStatus::Submitted),
            "under_review" | "underreview" => Ok(ApplicationStatus::UnderReview),
            "accepted" => Ok(ApplicationStatus::Accepted),
            "rejected" => Ok(ApplicationStatus::Rejected),
            other => Err(format!("unknown application status: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub owner: String,
    pub project_id: String,
    pub grant_id: String,
    pub status: ApplicationStatus,
    pub notes: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub submitted_at: Option<i64>,
    pub decided_at: Option<i64>,
}

/// One row of an application's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationEvent {
    pub application_id: String,
    pub from_status: Option<ApplicationStatus>,
    pub to_status: ApplicationStatus,
    pub at: i64,
}

/// Organisation metadata attached 1:1 to a user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub organization_name: String,
    pub organization_type: String,
    pub bio: String,
    pub avatar_initials: String,
    pub created_at: i64,
}

/// One row of `sync_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub source: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub fetched: i64,
    pub created: i64,
    pub updated: i64,
    pub unchanged: i64,
    pub skipped: i64,
    /// `ok` or `failed`.
    pub status: String,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_grant_accepts_numbers_and_aliases() {
        let raw: RawGrant = serde_json::from_value(json!({
            "id": 42,
            "name": "Silver Generation Fund",
            "agency": "Ministry of Social and Family Development",
            "funding_min": 50000,
            "deadline": "2027-04-30",
            "tags": ["Active Aging", "seniors"]
        }))
        .unwrap();
        assert_eq!(raw.external_id.as_deref(), Some("42"));
        assert_eq!(raw.title.as_deref(), Some("Silver Generation Fund"));
        assert_eq!(raw.funding_min.as_deref(), Some("50000"));
        assert_eq!(raw.closing_date.as_deref(), Some("2027-04-30"));
        assert_eq!(raw.categories, vec!["Active Aging", "seniors"]);
    }

    #[test]
    fn test_raw_grant_splits_comma_separated_categories() {
        let raw: RawGrant =
            serde_json::from_value(json!({ "category": "education, youth" })).unwrap();
        assert_eq!(raw.categories, vec!["education", "youth"]);
    }

    #[test]
    fn test_from_json_prefers_canonical_keys() {
        let raw = RawGrant::from_json(json!({
            "external_id": "SG-9",
            "id": 9,
            "name": "Alias only",
            "deadline": "2027-01-01",
            "closing_date": null,
            "tags": ["arts"],
            "category": "music"
        }))
        .unwrap();
        assert_eq!(raw.external_id.as_deref(), Some("SG-9"));
        assert_eq!(raw.title.as_deref(), Some("Alias only"));
        assert_eq!(raw.closing_date.as_deref(), Some("2027-01-01"));
        assert_eq!(raw.categories, vec!["arts"]);
    }

    #[test]
    fn test_raw_grant_rejects_object_title() {
        let res: Result<RawGrant, _> = serde_json::from_value(json!({ "title": { "x": 1 } }));
        assert!(res.is_err());
    }

    #[test]
    fn test_project_update_tells_null_from_absent() {
        let absent: ProjectUpdate = serde_json::from_value(json!({ "name": "x" })).unwrap();
        assert_eq!(absent.funding_need, None);

        let cleared: ProjectUpdate =
            serde_json::from_value(json!({ "funding_need": null })).unwrap();
        assert_eq!(cleared.funding_need, Some(None));

        let set: ProjectUpdate = serde_json::from_value(json!({ "funding_need": 5000 })).unwrap();
        assert_eq!(set.funding_need, Some(Some(5000)));
    }

    #[test]
    fn test_application_status_parses_variants() {
        assert_eq!(
            "under-review".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::UnderReview
        );
        assert_eq!(
            "Draft".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::Drafted
        );
        assert!("approved".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_format_amount_groups_thousands() {
        assert_eq!(format_amount(0), "$0");
        assert_eq!(format_amount(950), "$950");
        assert_eq!(format_amount(50000), "$50,000");
        assert_eq!(format_amount(1_500_000), "$1,500,000");
    }
}
