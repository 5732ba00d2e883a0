//! End-to-end library scenarios: sync → match → apply, re-sync drift, and
//! the tracker's match gate.

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use grantmatch::config::{ApplicationsConfig, MatchingConfig};
use grantmatch::connector_sample::SampleSource;
use grantmatch::error::GrantError;
use grantmatch::grants::get_grant_by_external_id;
use grantmatch::ingest::{sample_chain, sync_with_chain};
use grantmatch::matcher::{compute_matches, list_matches, toggle_saved};
use grantmatch::migrate;
use grantmatch::models::{ApplicationStatus, NewProject, Project, RawGrant};
use grantmatch::projects::create_project;
use grantmatch::tracker::{advance_application, application_history, create_application};
use grantmatch::traits::{FetchOutcome, GrantSource, SourceChain};

struct Fixed(Vec<RawGrant>);

#[async_trait]
impl GrantSource for Fixed {
    fn name(&self) -> &str {
        "fixed"
    }
    async fn fetch(&self) -> Result<FetchOutcome> {
        Ok(FetchOutcome::from_records(self.0.clone()))
    }
}

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
}

async fn seeded() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();
    sync_with_chain(&pool, &sample_chain(today()), false, today())
        .await
        .unwrap();
    pool
}

async fn reading_corner(pool: &SqlitePool) -> Project {
    create_project(
        pool,
        NewProject {
            owner: "alice".into(),
            name: "Reading Corner".into(),
            categories: vec!["education".into()],
            funding_need: Some(40_000),
            ..Default::default()
        },
    )
    .await
    .unwrap()
}

/// The sample SG-001 record with its status overridden.
fn sg001_with_status(status: &str) -> RawGrant {
    let mut raw = SampleSource::new(today())
        .records()
        .into_iter()
        .find(|r| r.external_id.as_deref() == Some("SG-001"))
        .unwrap();
    raw.status = Some(status.to_string());
    raw
}

async fn resync(pool: &SqlitePool, records: Vec<RawGrant>) {
    let chain = SourceChain::new().with(Box::new(Fixed(records)));
    sync_with_chain(pool, &chain, false, today()).await.unwrap();
}

#[tokio::test]
async fn test_education_project_matches_and_applies() {
    let pool = seeded().await;
    let project = reading_corner(&pool).await;
    let cfg = MatchingConfig::default();

    let matches = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    let sg001 = get_grant_by_external_id(&pool, "SG-001").await.unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].grant_id, sg001.id);
    assert_eq!(matches[0].score, 74);
    assert!(matches[0]
        .rationale
        .iter()
        .any(|r| r.starts_with("Category overlap: education")));

    let app = create_application(
        &pool,
        &ApplicationsConfig::default(),
        &project.id,
        &sg001.id,
        "first draft",
    )
    .await
    .unwrap();
    assert_eq!(app.status, ApplicationStatus::Drafted);
    assert_eq!(app.owner, "alice");

    for next in [
        ApplicationStatus::Submitted,
        ApplicationStatus::UnderReview,
        ApplicationStatus::Accepted,
    ] {
        advance_application(&pool, &app.id, next).await.unwrap();
    }

    let done = advance_application(&pool, &app.id, ApplicationStatus::Rejected).await;
    assert!(matches!(
        done,
        Err(GrantError::InvalidTransition {
            from: ApplicationStatus::Accepted,
            to: ApplicationStatus::Rejected
        })
    ));

    let history = application_history(&pool, &app.id).await.unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].from_status, None);
    assert_eq!(history[3].to_status, ApplicationStatus::Accepted);

    let stored = grantmatch::tracker::get_application(&pool, &app.id).await.unwrap();
    assert!(stored.submitted_at.is_some());
    assert!(stored.decided_at.is_some());
}

#[tokio::test]
async fn test_draft_cannot_skip_to_review() {
    let pool = seeded().await;
    let project = reading_corner(&pool).await;
    compute_matches(&pool, &MatchingConfig::default(), &project.id, today())
        .await
        .unwrap();
    let sg001 = get_grant_by_external_id(&pool, "SG-001").await.unwrap();
    let app = create_application(&pool, &ApplicationsConfig::default(), &project.id, &sg001.id, "")
        .await
        .unwrap();

    let err = advance_application(&pool, &app.id, ApplicationStatus::UnderReview)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GrantError::InvalidTransition {
            from: ApplicationStatus::Drafted,
            to: ApplicationStatus::UnderReview
        }
    ));

    let stored = grantmatch::tracker::get_application(&pool, &app.id).await.unwrap();
    assert_eq!(stored.status, ApplicationStatus::Drafted);
    assert!(stored.submitted_at.is_none());
    assert_eq!(application_history(&pool, &app.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_closed_grant_keeps_id_and_goes_stale() {
    let pool = seeded().await;
    let project = reading_corner(&pool).await;
    let cfg = MatchingConfig::default();

    compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    let before = get_grant_by_external_id(&pool, "SG-001").await.unwrap();
    let saved = toggle_saved(&pool, &project.id, &before.id).await.unwrap();
    assert!(saved.is_saved);

    resync(&pool, vec![sg001_with_status("closed")]).await;

    let after = get_grant_by_external_id(&pool, "SG-001").await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.status.as_str(), "closed");

    let matches = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    assert!(matches.iter().all(|m| m.grant_id != after.id));

    let live = list_matches(&pool, &project.id, false).await.unwrap();
    assert!(live.is_empty());

    let all = list_matches(&pool, &project.id, true).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].grant_match.stale);
    assert_eq!(all[0].grant_match.stale_reason.as_deref(), Some("closed"));
    assert!(all[0].grant_match.is_saved);

    let err = create_application(
        &pool,
        &ApplicationsConfig::default(),
        &project.id,
        &after.id,
        "",
    )
    .await;
    assert!(matches!(err, Err(GrantError::NoMatchFound { .. })));

    // reopening requalifies the same row
    resync(&pool, vec![sg001_with_status("open")]).await;
    let matches = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    assert_eq!(matches.len(), 1);
    assert!(!matches[0].stale);
    assert!(matches[0].is_saved);
    assert_eq!(matches[0].id, all[0].grant_match.id);
}

#[tokio::test]
async fn test_recompute_is_deterministic_and_unique() {
    let pool = seeded().await;
    let project = create_project(
        &pool,
        NewProject {
            owner: "bob".into(),
            name: "Seniors Connect".into(),
            description: "Community care and digital skills for seniors".into(),
            categories: vec!["eldercare".into(), "technology".into()],
            funding_need: Some(90_000),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let cfg = MatchingConfig::default();

    let first = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    let second = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    assert!(!first.is_empty());

    let key = |ms: &[grantmatch::models::GrantMatch]| {
        ms.iter()
            .map(|m| (m.id.clone(), m.grant_id.clone(), m.score))
            .collect::<Vec<_>>()
    };
    assert_eq!(key(&first), key(&second));
    assert!(first.windows(2).all(|w| w[0].score >= w[1].score));

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM grant_matches WHERE project_id = ?")
        .bind(&project.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows as usize, first.len());
}

#[tokio::test]
async fn test_unscorable_project_leaves_matches_untouched() {
    let pool = seeded().await;
    let project = reading_corner(&pool).await;
    let cfg = MatchingConfig::default();
    let before = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    assert_eq!(before.len(), 1);

    sqlx::query("UPDATE projects SET categories_json = '[]', funding_need = NULL WHERE id = ?")
        .bind(&project.id)
        .execute(&pool)
        .await
        .unwrap();

    let result = compute_matches(&pool, &cfg, &project.id, today()).await.unwrap();
    assert!(result.is_empty());

    let stored = list_matches(&pool, &project.id, false).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].grant_match.id, before[0].id);
}

#[tokio::test]
async fn test_match_gate_can_be_disabled() {
    let pool = seeded().await;
    let project = reading_corner(&pool).await;
    let unrelated = get_grant_by_external_id(&pool, "SG-002").await.unwrap();

    let gated = create_application(
        &pool,
        &ApplicationsConfig::default(),
        &project.id,
        &unrelated.id,
        "",
    )
    .await;
    assert!(matches!(gated, Err(GrantError::NoMatchFound { .. })));

    let open = ApplicationsConfig {
        require_match: false,
    };
    let app = create_application(&pool, &open, &project.id, &unrelated.id, "")
        .await
        .unwrap();
    assert_eq!(app.status, ApplicationStatus::Drafted);
}
