//! Database overview: row counts per table and the most recent sync run.
//! Used by `grantmatch stats` and `GET /stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::GrantResult;
use crate::models::SyncRun;

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub agencies: i64,
    pub grants: i64,
    pub open_grants: i64,
    pub projects: i64,
    pub matches: i64,
    pub stale_matches: i64,
    pub saved_matches: i64,
    pub applications: i64,
    pub profiles: i64,
    pub last_sync: Option<SyncRun>,
}

async fn count(pool: &SqlitePool, sql: &str) -> GrantResult<i64> {
    Ok(sqlx::query_scalar(sql).fetch_one(pool).await?)
}

pub async fn get_stats(pool: &SqlitePool) -> GrantResult<Stats> {
    let last_sync = sqlx::query("SELECT * FROM sync_runs ORDER BY finished_at DESC, rowid DESC LIMIT 1")
        .fetch_optional(pool)
        .await?
        .map(|row| SyncRun {
            id: row.get("id"),
            source: row.get("source"),
            started_at: row.get("started_at"),
            finished_at: row.get("finished_at"),
            fetched: row.get("fetched"),
            created: row.get("created"),
            updated: row.get("updated"),
            unchanged: row.get("unchanged"),
            skipped: row.get("skipped"),
            status: row.get("status"),
            error: row.get("error"),
        });

    Ok(Stats {
        agencies: count(pool, "SELECT COUNT(*) FROM agencies").await?,
        grants: count(pool, "SELECT COUNT(*) FROM grants").await?,
        open_grants: count(pool, "SELECT COUNT(*) FROM grants WHERE status = 'open'").await?,
        projects: count(pool, "SELECT COUNT(*) FROM projects").await?,
        matches: count(pool, "SELECT COUNT(*) FROM grant_matches").await?,
        stale_matches: count(pool, "SELECT COUNT(*) FROM grant_matches WHERE stale = 1").await?,
        saved_matches: count(pool, "SELECT COUNT(*) FROM grant_matches WHERE is_saved = 1").await?,
        applications: count(pool, "SELECT COUNT(*) FROM applications").await?,
        profiles: count(pool, "SELECT COUNT(*) FROM user_profiles").await?,
        last_sync,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = get_stats(&pool).await;
    pool.close().await;
    let stats = stats?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("grantmatch — Database Stats");
    println!("===========================");
    println!();
    println!("  Database:      {}", config.db.path.display());
    println!("  Size:          {}", format_bytes(db_size));
    println!();
    println!("  Agencies:      {}", stats.agencies);
    println!("  Grants:        {} ({} open)", stats.grants, stats.open_grants);
    println!("  Projects:      {}", stats.projects);
    println!(
        "  Matches:       {} ({} stale, {} saved)",
        stats.matches, stats.stale_matches, stats.saved_matches
    );
    println!("  Applications:  {}", stats.applications);
    println!("  Profiles:      {}", stats.profiles);
    println!();

    match &stats.last_sync {
        Some(run) => {
            println!(
                "  Last sync:     {} via {} ({})",
                run.status,
                run.source,
                format_ts_relative(run.finished_at, db::now_ts())
            );
            println!(
                "                 fetched {}, created {}, updated {}, unchanged {}, skipped {}",
                run.fetched, run.created, run.updated, run.unchanged, run.skipped
            );
            if let Some(ref err) = run.error {
                println!("                 error: {}", err);
            }
        }
        None => println!("  Last sync:     never"),
    }
    println!();

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64, now: i64) -> String {
    let delta = now - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
