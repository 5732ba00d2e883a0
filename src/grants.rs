//! Grant repository reads: browse, search, lookup, agencies, deadlines.
//!
//! Used by the `grants`, `grant`, `agencies` and `deadlines` commands, the
//! matcher, and the HTTP API.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::{GrantError, GrantResult};
use crate::models::{Agency, Grant, GrantStatus};

pub const DEFAULT_DEADLINE_WINDOW_DAYS: i64 = 120;

const GRANT_SELECT: &str = r#"
    SELECT g.id, g.external_id, g.agency_id, a.name AS agency_name, a.acronym AS agency_acronym,
           g.title, g.description, g.eligibility, g.funding_min, g.funding_max,
           g.opening_date, g.deadline, g.status, g.categories_json, g.duration,
           g.application_url, g.source_url, g.created_at, g.updated_at
    FROM grants g
    JOIN agencies a ON a.id = g.agency_id
"#;

/// Browse filters. All optional; combined with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrantFilter {
    /// Case-insensitive substring of title, description, or agency name.
    pub search: Option<String>,
    /// Agency acronym.
    pub agency: Option<String>,
    pub status: Option<GrantStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgencySummary {
    #[serde(flatten)]
    pub agency: Agency,
    pub open_grants: i64,
}

pub(crate) fn grant_from_row(row: &SqliteRow) -> Grant {
    let status: String = row.get("status");
    let categories: String = row.get("categories_json");
    Grant {
        id: row.get("id"),
        external_id: row.get("external_id"),
        agency_id: row.get("agency_id"),
        agency_name: row.get("agency_name"),
        agency_acronym: row.get("agency_acronym"),
        title: row.get("title"),
        description: row.get("description"),
        eligibility: row.get("eligibility"),
        funding_min: row.get("funding_min"),
        funding_max: row.get("funding_max"),
        opening_date: db::date_from_sql(row.get("opening_date")),
        deadline: db::date_from_sql(row.get("deadline")),
        // unknown values never count as open
        status: status.parse().unwrap_or(GrantStatus::Closed),
        categories: db::list_from_json(&categories),
        duration: row.get("duration"),
        application_url: row.get("application_url"),
        source_url: row.get("source_url"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn get_grant(pool: &SqlitePool, id: &str) -> GrantResult<Grant> {
    let row = sqlx::query(&format!("{} WHERE g.id = ?", GRANT_SELECT))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| grant_from_row(&r))
        .ok_or_else(|| GrantError::not_found("grant", id))
}

pub async fn get_grant_by_external_id(pool: &SqlitePool, external_id: &str) -> GrantResult<Grant> {
    let row = sqlx::query(&format!("{} WHERE g.external_id = ?", GRANT_SELECT))
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| grant_from_row(&r))
        .ok_or_else(|| GrantError::not_found("grant", external_id))
}

/// Look a grant up by internal id, falling back to the portal's external id.
pub async fn find_grant(pool: &SqlitePool, key: &str) -> GrantResult<Grant> {
    match get_grant(pool, key).await {
        Err(GrantError::NotFound { .. }) => get_grant_by_external_id(pool, key).await,
        other => other,
    }
}

pub async fn list_grants(pool: &SqlitePool, filter: &GrantFilter) -> GrantResult<Vec<Grant>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(GRANT_SELECT);
    qb.push(" WHERE 1 = 1");

    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = format!("%{}%", term);
        qb.push(" AND (g.title LIKE ")
            .push_bind(pattern.clone())
            .push(" OR g.description LIKE ")
            .push_bind(pattern.clone())
            .push(" OR a.name LIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(agency) = filter.agency.as_deref().filter(|a| !a.is_empty()) {
        qb.push(" AND a.acronym = ")
            .push_bind(agency.to_uppercase());
    }
    if let Some(status) = filter.status {
        qb.push(" AND g.status = ").push_bind(status.as_str());
    }

    qb.push(" ORDER BY g.deadline IS NULL, g.deadline ASC, g.title ASC");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit.max(0));
    }

    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows.iter().map(grant_from_row).collect())
}

/// Every stored grant, ordered by id. The matcher filters these itself.
pub async fn all_grants(pool: &SqlitePool) -> GrantResult<Vec<Grant>> {
    let rows = sqlx::query(&format!("{} ORDER BY g.id", GRANT_SELECT))
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(grant_from_row).collect())
}

pub async fn list_agencies(pool: &SqlitePool) -> GrantResult<Vec<AgencySummary>> {
    let rows = sqlx::query(
        r#"
        SELECT a.id, a.name, a.acronym, a.description, a.website,
               COUNT(g.id) AS open_grants
        FROM agencies a
        LEFT JOIN grants g ON g.agency_id = a.id AND g.status = 'open'
        GROUP BY a.id
        ORDER BY a.name ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| AgencySummary {
            agency: Agency {
                id: row.get("id"),
                name: row.get("name"),
                acronym: row.get("acronym"),
                description: row.get("description"),
                website: row.get("website"),
            },
            open_grants: row.get("open_grants"),
        })
        .collect())
}

/// Open grants whose deadline falls within `within_days` of `today`,
/// soonest first.
pub async fn upcoming_deadlines(
    pool: &SqlitePool,
    today: NaiveDate,
    within_days: i64,
) -> GrantResult<Vec<Grant>> {
    // Dates are compared as ISO text, which only orders correctly up to
    // year 9999, so an overflowing or huge window is capped there.
    let latest = NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX);
    let until = Duration::try_days(within_days.max(0))
        .and_then(|window| today.checked_add_signed(window))
        .map_or(latest, |date| date.min(latest));
    let rows = sqlx::query(&format!(
        "{} WHERE g.status = 'open' AND g.deadline >= ? AND g.deadline <= ? ORDER BY g.deadline ASC, g.id ASC",
        GRANT_SELECT
    ))
    .bind(db::date_to_sql(Some(today)))
    .bind(db::date_to_sql(Some(until)))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(grant_from_row).collect())
}

// ============ CLI ============

fn print_grant_line(grant: &Grant, today: NaiveDate) {
    let closes = match grant.days_until_deadline(today) {
        Some(days) if days >= 0 => format!("closes in {}d", days),
        Some(_) => "closed".to_string(),
        None => "rolling".to_string(),
    };
    println!(
        "{:<12} [{}] {} ({}) {} | {}",
        grant.external_id,
        grant.status,
        grant.title,
        grant.agency_acronym,
        grant.funding_range(),
        closes
    );
}

pub async fn run_grants(config: &Config, filter: GrantFilter) -> Result<()> {
    let pool = db::connect(config).await?;
    let grants = list_grants(&pool, &filter).await?;
    pool.close().await;

    if grants.is_empty() {
        println!("No grants.");
        return Ok(());
    }
    let today = db::today();
    for grant in &grants {
        print_grant_line(grant, today);
    }
    Ok(())
}

pub async fn run_grant(config: &Config, key: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let grant = find_grant(&pool, key).await;
    pool.close().await;
    let grant = grant?;

    println!("--- Grant ---");
    println!("id:           {}", grant.id);
    println!("external_id:  {}", grant.external_id);
    println!("title:        {}", grant.title);
    println!("agency:       {} ({})", grant.agency_name, grant.agency_acronym);
    println!("status:       {}", grant.status);
    println!("funding:      {}", grant.funding_range());
    match grant.deadline {
        Some(d) => println!("deadline:     {}", d),
        None => println!("deadline:     rolling"),
    }
    if let Some(d) = grant.opening_date {
        println!("opens:        {}", d);
    }
    if !grant.categories.is_empty() {
        println!("categories:   {}", grant.categories.join(", "));
    }
    if !grant.duration.is_empty() {
        println!("duration:     {}", grant.duration);
    }
    if let Some(ref url) = grant.application_url {
        println!("apply at:     {}", url);
    }
    if !grant.description.is_empty() {
        println!();
        println!("{}", grant.description);
    }
    if !grant.eligibility.is_empty() {
        println!();
        println!("Eligibility: {}", grant.eligibility);
    }
    Ok(())
}

pub async fn run_agencies(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let agencies = list_agencies(&pool).await?;
    pool.close().await;

    if agencies.is_empty() {
        println!("No agencies.");
        return Ok(());
    }
    println!("{:<8} {:>5}  NAME", "ACRONYM", "OPEN");
    for a in &agencies {
        println!("{:<8} {:>5}  {}", a.agency.acronym, a.open_grants, a.agency.name);
    }
    Ok(())
}

pub async fn run_deadlines(config: &Config, within_days: i64) -> Result<()> {
    let pool = db::connect(config).await?;
    let today = db::today();
    let grants = upcoming_deadlines(&pool, today, within_days).await?;
    pool.close().await;

    if grants.is_empty() {
        println!("No open grants closing in the next {} days.", within_days);
        return Ok(());
    }
    for grant in &grants {
        print_grant_line(grant, today);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{sample_chain, sync_with_chain};
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seeded() -> (SqlitePool, NaiveDate) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        sync_with_chain(&pool, &sample_chain(today), false, today)
            .await
            .unwrap();
        (pool, today)
    }

    #[tokio::test]
    async fn test_search_matches_title_and_agency() {
        let (pool, _) = seeded().await;
        let by_title = list_grants(
            &pool,
            &GrantFilter {
                search: Some("silver".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_title.len(), 1);
        assert_eq!(by_title[0].external_id, "SG-003");

        let by_agency = list_grants(
            &pool,
            &GrantFilter {
                search: Some("Health Promotion".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(by_agency[0].agency_acronym, "HPB");
    }

    #[tokio::test]
    async fn test_agency_filter_and_ordering() {
        let (pool, _) = seeded().await;
        let imda = list_grants(
            &pool,
            &GrantFilter {
                agency: Some("imda".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(imda.len(), 1);

        let all = list_grants(&pool, &GrantFilter::default()).await.unwrap();
        let deadlines: Vec<_> = all.iter().map(|g| g.deadline).collect();
        let mut sorted = deadlines.clone();
        sorted.sort();
        assert_eq!(deadlines, sorted);
    }

    #[tokio::test]
    async fn test_find_grant_by_either_id() {
        let (pool, _) = seeded().await;
        let by_external = find_grant(&pool, "SG-001").await.unwrap();
        let by_id = find_grant(&pool, &by_external.id).await.unwrap();
        assert_eq!(by_external, by_id);
        assert_eq!(by_id.funding_min, Some(50_000));

        let missing = find_grant(&pool, "nope").await.unwrap_err();
        assert!(matches!(missing, GrantError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_upcoming_deadlines_window() {
        let (pool, today) = seeded().await;
        let soon = upcoming_deadlines(&pool, today, DEFAULT_DEADLINE_WINDOW_DAYS)
            .await
            .unwrap();
        assert!(soon.is_empty());

        let within_half_year = upcoming_deadlines(&pool, today, 180).await.unwrap();
        let ids: Vec<_> = within_half_year.iter().map(|g| g.external_id.as_str()).collect();
        assert_eq!(ids, vec!["SG-002", "SG-005"]);
    }

    #[tokio::test]
    async fn test_upcoming_deadlines_huge_window_is_capped() {
        let (pool, today) = seeded().await;
        for window in [1_000_000_000, i64::MAX] {
            let all = upcoming_deadlines(&pool, today, window).await.unwrap();
            assert_eq!(all.len(), 5, "window {}", window);
        }
        assert!(upcoming_deadlines(&pool, today, i64::MIN).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_agencies_count_open_grants() {
        let (pool, _) = seeded().await;
        let agencies = list_agencies(&pool).await.unwrap();
        assert_eq!(agencies.len(), 5);
        assert!(agencies.iter().all(|a| a.open_grants == 1));
    }
}
