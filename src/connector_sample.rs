//! Bundled sample grants for development and demos.
//!
//! Selected only with `sync --sample`; never mixed into a live chain.
//! Deadlines are offsets from the day the source is built so the dataset
//! stays open no matter when it is loaded.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};

use crate::models::RawGrant;
use crate::traits::{FetchOutcome, GrantSource};

pub struct SampleSource {
    today: NaiveDate,
}

impl SampleSource {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn records(&self) -> Vec<RawGrant> {
        SAMPLES
            .iter()
            .map(|s| RawGrant {
                external_id: Some(s.external_id.to_string()),
                title: Some(s.title.to_string()),
                description: Some(s.description.to_string()),
                agency_name: Some(s.agency_name.to_string()),
                agency_acronym: Some(s.acronym.to_string()),
                funding_min: Some(s.funding.0.to_string()),
                funding_max: Some(s.funding.1.to_string()),
                closing_date: Some(
                    (self.today + Duration::days(s.closes_in_days))
                        .format("%Y-%m-%d")
                        .to_string(),
                ),
                status: Some("open".to_string()),
                eligibility: Some(s.eligibility.to_string()),
                categories: s.categories.iter().map(|c| c.to_string()).collect(),
                duration: Some(s.duration.to_string()),
                ..Default::default()
            })
            .collect()
    }
}

#[async_trait]
impl GrantSource for SampleSource {
    fn name(&self) -> &str {
        "sample"
    }

    async fn fetch(&self) -> Result<FetchOutcome> {
        Ok(FetchOutcome::from_records(self.records()))
    }
}

struct Sample {
    external_id: &'static str,
    title: &'static str,
    description: &'static str,
    agency_name: &'static str,
    acronym: &'static str,
    funding: (i64, i64),
    closes_in_days: i64,
    eligibility: &'static str,
    categories: &'static [&'static str],
    duration: &'static str,
}

const SAMPLES: &[Sample] = &[
    Sample {
        external_id: "SG-001",
        title: "Learning Futures Grant",
        description: "Supports education programmes run by schools and non-profits.",
        agency_name: "Ministry of Education",
        acronym: "MOE",
        funding: (50_000, 50_000),
        closes_in_days: 365,
        eligibility: "Registered non-profit organisations and schools.",
        categories: &["education"],
        duration: "1 year",
    },
    Sample {
        external_id: "SG-002",
        title: "Community Care Innovation Fund",
        description: "Supports innovative community care programs for seniors, including dementia care initiatives.",
        agency_name: "Agency for Integrated Care",
        acronym: "AIC",
        funding: (80_000, 150_000),
        closes_in_days: 150,
        eligibility: "Community care providers with an established service.",
        categories: &["eldercare", "dementia", "community care"],
        duration: "2-3 years",
    },
    Sample {
        external_id: "SG-003",
        title: "Silver Generation Fund",
        description: "Funding for active aging initiatives and programs that support senior well-being.",
        agency_name: "Ministry of Social and Family Development",
        acronym: "MSF",
        funding: (50_000, 100_000),
        closes_in_days: 195,
        eligibility: "Social service agencies serving seniors.",
        categories: &["active aging", "seniors"],
        duration: "1-2 years",
    },
    Sample {
        external_id: "SG-004",
        title: "Mental Wellness Support Grant",
        description: "Grants for mental health services and preventive care programs.",
        agency_name: "Health Promotion Board",
        acronym: "HPB",
        funding: (60_000, 120_000),
        closes_in_days: 215,
        eligibility: "Healthcare and social service organisations.",
        categories: &["mental health"],
        duration: "2 years",
    },
    Sample {
        external_id: "SG-005",
        title: "Technology for Seniors Grant",
        description: "Funding for technology solutions that improve the lives of seniors.",
        agency_name: "Infocomm Media Development Authority",
        acronym: "IMDA",
        funding: (40_000, 80_000),
        closes_in_days: 165,
        eligibility: "Companies and non-profits building digital solutions.",
        categories: &["technology", "seniors"],
        duration: "1-2 years",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlines_are_relative_to_today() {
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        let records = SampleSource::new(today).records();
        let first = records
            .iter()
            .find(|r| r.external_id.as_deref() == Some("SG-001"))
            .unwrap();
        assert_eq!(first.closing_date.as_deref(), Some("2027-10-18"));
        assert_eq!(first.funding_min.as_deref(), Some("50000"));
        assert_eq!(first.categories, vec!["education"]);
    }

    #[test]
    fn test_only_one_education_grant() {
        let records = SampleSource::new(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()).records();
        let education: Vec<_> = records
            .iter()
            .filter(|r| {
                let text = format!(
                    "{} {} {}",
                    r.title.as_deref().unwrap_or(""),
                    r.description.as_deref().unwrap_or(""),
                    r.categories.join(" ")
                )
                .to_lowercase();
                text.contains("education")
            })
            .collect();
        assert_eq!(education.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_returns_every_sample() {
        let source = SampleSource::new(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        let outcome = source.fetch().await.unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert!(outcome.rejected.is_empty());
    }
}
