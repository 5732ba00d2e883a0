//! Sync pipeline: source chain → normalize → idempotent upsert.
//!
//! The whole listing is fetched before anything is written, so a
//! [`GrantError::SourceUnavailable`] leaves the grant tables untouched.
//! Each record is then upserted in its own transaction keyed by
//! `external_id`; a record that fails to normalize or write is skipped and
//! counted without affecting the rest of the batch.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, PortalConfig};
use crate::connector_api::ApiSource;
use crate::connector_sample::SampleSource;
use crate::connector_scrape::ScrapeSource;
use crate::db;
use crate::error::{GrantError, GrantResult};
use crate::normalize::{derive_acronym, normalize, NormalizedGrant};
use crate::traits::SourceChain;

/// Counts reported by one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// API first, then the HTML listing.
pub fn live_chain(portal: &PortalConfig) -> Result<SourceChain> {
    Ok(SourceChain::new()
        .with(Box::new(ApiSource::new(portal)?))
        .with(Box::new(ScrapeSource::new(portal)?)))
}

pub fn sample_chain(today: NaiveDate) -> SourceChain {
    SourceChain::new().with(Box::new(SampleSource::new(today)))
}

pub async fn run_sync(config: &Config, sample: bool, dry_run: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let today = db::today();

    let chain = if sample {
        sample_chain(today)
    } else {
        live_chain(&config.portal)?
    };

    let result = sync_with_chain(&pool, &chain, dry_run, today).await;
    pool.close().await;
    let report = result?;

    if report.dry_run {
        println!("sync {} (dry-run)", report.source);
    } else {
        println!("sync {}", report.source);
    }
    println!("  fetched: {}", report.fetched);
    println!("  created: {}", report.created);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  skipped: {}", report.skipped);
    println!("ok");

    Ok(())
}

/// Run one sync against `chain`. With `dry_run` the outcome of every record
/// is computed against the current database but nothing is written.
pub async fn sync_with_chain(
    pool: &SqlitePool,
    chain: &SourceChain,
    dry_run: bool,
    today: NaiveDate,
) -> GrantResult<SyncReport> {
    let started_at = db::now_ts();

    let (source, outcome) = match chain.fetch_first().await {
        Ok(fetched) => fetched,
        Err(e) => {
            if !dry_run {
                let failed = SyncReport {
                    source: "none".to_string(),
                    ..Default::default()
                };
                record_run(pool, &failed, started_at, Some(&e.to_string())).await?;
            }
            return Err(e);
        }
    };

    let mut report = SyncReport {
        source,
        fetched: outcome.records.len() + outcome.rejected.len(),
        skipped: outcome.rejected.len(),
        dry_run,
        ..Default::default()
    };
    for reason in &outcome.rejected {
        warn!(source = %report.source, %reason, "record rejected by source");
    }

    for raw in &outcome.records {
        let grant = match normalize(raw, today) {
            Ok(grant) => grant,
            Err(e) => {
                warn!(source = %report.source, error = %e, "skipping record");
                report.skipped += 1;
                continue;
            }
        };

        let result = if dry_run {
            preview_grant(pool, &grant).await
        } else {
            upsert_grant(pool, &grant).await
        };

        match result {
            Ok(UpsertOutcome::Created) => report.created += 1,
            Ok(UpsertOutcome::Updated) => report.updated += 1,
            Ok(UpsertOutcome::Unchanged) => report.unchanged += 1,
            Err(e) => {
                warn!(external_id = %grant.external_id, error = %e, "failed to store record");
                report.skipped += 1;
            }
        }
    }

    if !dry_run {
        record_run(pool, &report, started_at, None).await?;
    }

    info!(
        source = %report.source,
        fetched = report.fetched,
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        skipped = report.skipped,
        dry_run,
        "sync finished"
    );

    Ok(report)
}

/// Insert or update one grant by external id. The primary key of an
/// existing grant never changes, nor does its agency.
pub async fn upsert_grant(pool: &SqlitePool, grant: &NormalizedGrant) -> GrantResult<UpsertOutcome> {
    let hash = grant.content_hash();
    let now = db::now_ts();
    let mut tx = pool.begin().await?;

    let existing: Option<(String, String)> =
        sqlx::query_as("SELECT id, content_hash FROM grants WHERE external_id = ?")
            .bind(&grant.external_id)
            .fetch_optional(&mut *tx)
            .await?;

    let outcome = match existing {
        Some((_, stored_hash)) if stored_hash == hash => UpsertOutcome::Unchanged,
        Some((id, _)) => {
            sqlx::query(
                r#"
                UPDATE grants SET
                    title = ?, description = ?, eligibility = ?,
                    funding_min = ?, funding_max = ?,
                    opening_date = ?, deadline = ?, status = ?,
                    categories_json = ?, duration = ?,
                    application_url = ?, source_url = ?,
                    content_hash = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&grant.title)
            .bind(&grant.description)
            .bind(&grant.eligibility)
            .bind(grant.funding_min)
            .bind(grant.funding_max)
            .bind(db::date_to_sql(grant.opening_date))
            .bind(db::date_to_sql(grant.deadline))
            .bind(grant.status.as_str())
            .bind(db::list_to_json(&grant.categories))
            .bind(&grant.duration)
            .bind(&grant.application_url)
            .bind(&grant.source_url)
            .bind(&hash)
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            debug!(external_id = %grant.external_id, id = %id, status = %grant.status, "grant updated");
            UpsertOutcome::Updated
        }
        None => {
            let agency_id = resolve_agency(&mut *tx, grant).await?;
            let id = Uuid::new_v4().to_string();
            sqlx::query(
                r#"
                INSERT INTO grants (id, external_id, agency_id, title, description, eligibility,
                    funding_min, funding_max, opening_date, deadline, status, categories_json,
                    duration, application_url, source_url, content_hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(external_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    eligibility = excluded.eligibility,
                    funding_min = excluded.funding_min,
                    funding_max = excluded.funding_max,
                    opening_date = excluded.opening_date,
                    deadline = excluded.deadline,
                    status = excluded.status,
                    categories_json = excluded.categories_json,
                    duration = excluded.duration,
                    application_url = excluded.application_url,
                    source_url = excluded.source_url,
                    content_hash = excluded.content_hash,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&grant.external_id)
            .bind(&agency_id)
            .bind(&grant.title)
            .bind(&grant.description)
            .bind(&grant.eligibility)
            .bind(grant.funding_min)
            .bind(grant.funding_max)
            .bind(db::date_to_sql(grant.opening_date))
            .bind(db::date_to_sql(grant.deadline))
            .bind(grant.status.as_str())
            .bind(db::list_to_json(&grant.categories))
            .bind(&grant.duration)
            .bind(&grant.application_url)
            .bind(&grant.source_url)
            .bind(&hash)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            debug!(external_id = %grant.external_id, id = %id, "grant created");
            UpsertOutcome::Created
        }
    };

    tx.commit().await?;
    Ok(outcome)
}

/// What [`upsert_grant`] would do, without writing.
pub async fn preview_grant(pool: &SqlitePool, grant: &NormalizedGrant) -> GrantResult<UpsertOutcome> {
    let stored_hash: Option<String> =
        sqlx::query_scalar("SELECT content_hash FROM grants WHERE external_id = ?")
            .bind(&grant.external_id)
            .fetch_optional(pool)
            .await?;

    Ok(match stored_hash {
        None => UpsertOutcome::Created,
        Some(h) if h == grant.content_hash() => UpsertOutcome::Unchanged,
        Some(_) => UpsertOutcome::Updated,
    })
}

/// Find the grant's agency, creating it if needed. Looks up by acronym when
/// the source supplied one, otherwise by name; a derived acronym that is
/// already taken gets a numeric suffix.
async fn resolve_agency(conn: &mut SqliteConnection, grant: &NormalizedGrant) -> GrantResult<String> {
    let acronym = match &grant.agency_acronym {
        Some(acronym) => {
            let found: Option<String> =
                sqlx::query_scalar("SELECT id FROM agencies WHERE acronym = ?")
                    .bind(acronym)
                    .fetch_optional(&mut *conn)
                    .await?;
            if let Some(id) = found {
                return Ok(id);
            }
            acronym.clone()
        }
        None => {
            let found: Option<String> =
                sqlx::query_scalar("SELECT id FROM agencies WHERE name = ? COLLATE NOCASE")
                    .bind(&grant.agency_name)
                    .fetch_optional(&mut *conn)
                    .await?;
            if let Some(id) = found {
                return Ok(id);
            }
            unused_acronym(conn, &derive_acronym(&grant.agency_name)).await?
        }
    };

    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO agencies (id, name, acronym, description, website, created_at) VALUES (?, ?, ?, '', NULL, ?)",
    )
    .bind(&id)
    .bind(&grant.agency_name)
    .bind(&acronym)
    .bind(db::now_ts())
    .execute(&mut *conn)
    .await?;

    info!(agency = %grant.agency_name, %acronym, "agency created");
    Ok(id)
}

async fn unused_acronym(conn: &mut SqliteConnection, base: &str) -> GrantResult<String> {
    let mut candidate = base.to_string();
    let mut suffix = 2;
    loop {
        let taken: Option<String> = sqlx::query_scalar("SELECT id FROM agencies WHERE acronym = ?")
            .bind(&candidate)
            .fetch_optional(&mut *conn)
            .await?;
        if taken.is_none() {
            return Ok(candidate);
        }
        candidate = format!("{}{}", base, suffix);
        suffix += 1;
    }
}

async fn record_run(
    pool: &SqlitePool,
    report: &SyncReport,
    started_at: i64,
    error: Option<&str>,
) -> GrantResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_runs (id, source, started_at, finished_at, fetched, created, updated, unchanged, skipped, status, error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&report.source)
    .bind(started_at)
    .bind(db::now_ts())
    .bind(report.fetched as i64)
    .bind(report.created as i64)
    .bind(report.updated as i64)
    .bind(report.unchanged as i64)
    .bind(report.skipped as i64)
    .bind(if error.is_some() { "failed" } else { "ok" })
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}
