//! Project ↔ grant matching.
//!
//! Scoring is a weighted sum of independent signals, each in `[0, 1]`:
//!
//! | Signal | Meaning |
//! |--------|---------|
//! | category | fraction of the project's tags found among the grant's categories, or as a phrase in its title/description |
//! | funding | 1.0 when the funding need lies inside the grant's range, else the ratio to the nearer bound |
//! | text | fraction of project name/description keywords found in the grant's title/description |
//! | agency | bonus when the grant's agency is one the project prefers |
//!
//! ```text
//! score = round(100 × min(1, Σ weight × signal / (category + funding + text weights)))
//! ```
//!
//! Only open grants whose deadline has not passed are candidates. A
//! candidate qualifies when its category or text signal is non-zero and its
//! score reaches `matching.min_score`. Results are ordered by score
//! (descending), then deadline (soonest first, rolling grants last), then
//! grant id.
//!
//! # Persistence
//!
//! [`compute_matches`] upserts one `grant_matches` row per qualifying
//! `(project, grant)` pair, keeping `is_saved`. Rows that were live before
//! the run but did not qualify this time are marked stale with a reason
//! (`closed`, `expired`, `upcoming`, `below_threshold`) instead of being
//! deleted. A later run that qualifies the pair again clears the flag.

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, MatchingConfig};
use crate::db;
use crate::error::{GrantError, GrantResult};
use crate::grants::{all_grants, find_grant, get_grant};
use crate::models::{format_amount, Grant, GrantMatch, GrantStatus, Project};
use crate::projects::get_project;

const MIN_KEYWORD_LEN: usize = 4;

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "been", "being", "both", "each", "from", "have", "into", "more",
    "most", "other", "over", "some", "such", "than", "that", "their", "them", "then", "there",
    "these", "they", "this", "those", "through", "under", "very", "were", "what", "when",
    "where", "which", "while", "will", "with", "within", "would", "your", "fund", "funding",
    "grant", "grants", "project", "projects",
];

/// A candidate grant that passed eligibility, with its score.
#[derive(Debug, Clone)]
pub struct ScoredGrant<'a> {
    pub grant: &'a Grant,
    pub score: i64,
    pub rationale: Vec<String>,
}

/// Signals computed for one project/grant pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub category: f64,
    pub funding: f64,
    pub text: f64,
    pub preferred_agency: bool,
    pub score: i64,
    pub rationale: Vec<String>,
}

impl Evaluation {
    /// At least one content signal overlaps; funding alone is not a match.
    pub fn is_relevant(&self) -> bool {
        self.category > 0.0 || self.text > 0.0
    }
}

/// A stored match together with its grant.
#[derive(Debug, Clone, Serialize)]
pub struct MatchDetail {
    #[serde(flatten)]
    pub grant_match: GrantMatch,
    pub grant: Grant,
}

/// A project can be scored only if it has category tags or a funding need.
pub fn validate_project(project: &Project) -> GrantResult<()> {
    if project.categories.is_empty() && project.funding_need.is_none() {
        return Err(GrantError::InvalidProject(
            "add category tags or a funding need to this project".to_string(),
        ));
    }
    Ok(())
}

/// Why a grant cannot currently be matched, if it cannot.
pub fn ineligibility(grant: &Grant, today: NaiveDate) -> Option<&'static str> {
    match grant.status {
        GrantStatus::Closed => Some("closed"),
        GrantStatus::Upcoming => Some("upcoming"),
        GrantStatus::Open if grant.deadline.map_or(false, |d| d < today) => Some("expired"),
        GrantStatus::Open => None,
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower-cased words of at least four characters, minus stop-words.
pub fn keywords(text: &str) -> BTreeSet<String> {
    words(text)
        .into_iter()
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn funding_proximity(need: Option<i64>, min: Option<i64>, max: Option<i64>) -> f64 {
    let Some(need) = need else { return 0.0 };
    let ratio = |num: i64, den: i64| {
        if den <= 0 {
            0.0
        } else {
            (num as f64 / den as f64).clamp(0.0, 1.0)
        }
    };
    match (min, max) {
        (None, None) => 0.0,
        (Some(min), _) if need < min => ratio(need, min),
        (_, Some(max)) if need > max => ratio(max, need),
        _ => 1.0,
    }
}

/// Score one grant for one project. Eligibility is not checked here.
pub fn evaluate(project: &Project, grant: &Grant, cfg: &MatchingConfig) -> Evaluation {
    let grant_text = format!("{} {}", grant.title, grant.description);
    let padded = format!(" {} ", words(&grant_text).join(" "));
    let grant_words: HashSet<String> = words(&grant_text).into_iter().collect();
    let mut rationale = Vec::new();

    let matched_tags: Vec<&str> = project
        .categories
        .iter()
        .filter(|tag| {
            grant.categories.iter().any(|c| c == *tag)
                || padded.contains(&format!(" {} ", tag.replace('-', " ")))
        })
        .map(String::as_str)
        .collect();
    let category = if project.categories.is_empty() {
        0.0
    } else {
        matched_tags.len() as f64 / project.categories.len() as f64
    };
    if !matched_tags.is_empty() {
        rationale.push(format!("Category overlap: {}", matched_tags.join(", ")));
    }

    let project_keywords = keywords(&format!("{} {}", project.name, project.description));
    let matched_keywords: Vec<&str> = project_keywords
        .iter()
        .filter(|k| grant_words.contains(*k))
        .map(String::as_str)
        .collect();
    let text = if project_keywords.is_empty() {
        0.0
    } else {
        matched_keywords.len() as f64 / project_keywords.len() as f64
    };
    if !matched_keywords.is_empty() {
        rationale.push(format!("Keyword overlap: {}", matched_keywords.join(", ")));
    }

    let funding = funding_proximity(project.funding_need, grant.funding_min, grant.funding_max);
    if let Some(need) = project.funding_need {
        if funding >= 1.0 {
            rationale.push(format!(
                "Funding need {} fits {}",
                format_amount(need),
                grant.funding_range()
            ));
        } else if funding > 0.0 {
            rationale.push(format!(
                "Funding need {} is near {} ({:.0}%)",
                format_amount(need),
                grant.funding_range(),
                funding * 100.0
            ));
        }
    }

    let preferred_agency = project.preferred_agencies.iter().any(|a| {
        a.eq_ignore_ascii_case(&grant.agency_acronym) || a.eq_ignore_ascii_case(&grant.agency_name)
    });
    if preferred_agency {
        rationale.push(format!("Preferred agency: {}", grant.agency_acronym));
    }

    let weighted = cfg.category_weight * category
        + cfg.funding_weight * funding
        + cfg.text_weight * text
        + if preferred_agency { cfg.agency_weight } else { 0.0 };
    let core = cfg.core_weight_sum();
    let score = if core > 0.0 {
        (100.0 * (weighted / core).min(1.0)).round().clamp(0.0, 100.0) as i64
    } else {
        0
    };

    Evaluation {
        category,
        funding,
        text,
        preferred_agency,
        score,
        rationale,
    }
}

/// Score desc, deadline asc (rolling last), grant id asc.
fn rank_order(a: (i64, Option<NaiveDate>, &str), b: (i64, Option<NaiveDate>, &str)) -> Ordering {
    b.0.cmp(&a.0)
        .then_with(|| match (a.1, b.1) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.2.cmp(b.2))
}

/// Eligible, qualifying grants for `project`, best first. Pure.
pub fn rank_grants<'a>(
    project: &Project,
    grants: &'a [Grant],
    cfg: &MatchingConfig,
    today: NaiveDate,
) -> Vec<ScoredGrant<'a>> {
    let mut ranked: Vec<ScoredGrant<'a>> = grants
        .iter()
        .filter(|g| ineligibility(g, today).is_none())
        .filter_map(|grant| {
            let eval = evaluate(project, grant, cfg);
            (eval.is_relevant() && eval.score >= i64::from(cfg.min_score)).then(|| ScoredGrant {
                grant,
                score: eval.score,
                rationale: eval.rationale,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        rank_order(
            (a.score, a.grant.deadline, a.grant.id.as_str()),
            (b.score, b.grant.deadline, b.grant.id.as_str()),
        )
    });
    ranked
}

fn match_from_row(row: &SqliteRow) -> GrantMatch {
    let rationale: String = row.get("rationale_json");
    GrantMatch {
        id: row.get("id"),
        project_id: row.get("project_id"),
        grant_id: row.get("grant_id"),
        score: row.get("score"),
        rationale: db::list_from_json(&rationale),
        is_saved: row.get::<i64, _>("is_saved") != 0,
        stale: row.get::<i64, _>("stale") != 0,
        stale_reason: row.get("stale_reason"),
        computed_at: row.get("computed_at"),
        created_at: row.get("created_at"),
    }
}

/// Score every grant for a project and persist the results.
///
/// A project that cannot be scored yields an empty result and leaves its
/// stored matches untouched. A missing project is an error.
pub async fn compute_matches(
    pool: &SqlitePool,
    cfg: &MatchingConfig,
    project_id: &str,
    today: NaiveDate,
) -> GrantResult<Vec<GrantMatch>> {
    let project = get_project(pool, project_id).await?;
    if let Err(e) = validate_project(&project) {
        warn!(project_id, error = %e, "project cannot be scored");
        return Ok(Vec::new());
    }

    let grants = all_grants(pool).await?;
    let ranked = rank_grants(&project, &grants, cfg, today);
    let now = db::now_ts();

    let mut tx = pool.begin().await?;

    let previously_live: Vec<String> =
        sqlx::query_scalar("SELECT grant_id FROM grant_matches WHERE project_id = ? AND stale = 0")
            .bind(project_id)
            .fetch_all(&mut *tx)
            .await?;

    for candidate in &ranked {
        sqlx::query(
            r#"
            INSERT INTO grant_matches (id, project_id, grant_id, score, rationale_json,
                is_saved, stale, stale_reason, computed_at, created_at)
            VALUES (?, ?, ?, ?, ?, 0, 0, NULL, ?, ?)
            ON CONFLICT(project_id, grant_id) DO UPDATE SET
                score = excluded.score,
                rationale_json = excluded.rationale_json,
                stale = 0,
                stale_reason = NULL,
                computed_at = excluded.computed_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(&candidate.grant.id)
        .bind(candidate.score)
        .bind(db::list_to_json(&candidate.rationale))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    let refreshed: HashSet<&str> = ranked.iter().map(|c| c.grant.id.as_str()).collect();
    let by_id: HashMap<&str, &Grant> = grants.iter().map(|g| (g.id.as_str(), g)).collect();

    for grant_id in previously_live.iter().filter(|id| !refreshed.contains(id.as_str())) {
        let reason = by_id
            .get(grant_id.as_str())
            .and_then(|g| ineligibility(g, today))
            .unwrap_or("below_threshold");
        sqlx::query(
            "UPDATE grant_matches SET stale = 1, stale_reason = ?, computed_at = ? WHERE project_id = ? AND grant_id = ?",
        )
        .bind(reason)
        .bind(now)
        .bind(project_id)
        .bind(grant_id)
        .execute(&mut *tx)
        .await?;
        info!(project_id, grant_id = %grant_id, reason, "match marked stale");
    }

    let rows = sqlx::query("SELECT * FROM grant_matches WHERE project_id = ? AND stale = 0")
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;
    tx.commit().await?;

    let mut stored: HashMap<String, GrantMatch> = rows
        .iter()
        .map(match_from_row)
        .map(|m| (m.grant_id.clone(), m))
        .collect();

    let matches: Vec<GrantMatch> = ranked
        .iter()
        .filter_map(|c| stored.remove(&c.grant.id))
        .collect();

    info!(project_id, matches = matches.len(), "matches computed");
    Ok(matches)
}

/// Stored matches for a project with their grants, best first. Stale
/// matches are listed after live ones when included.
pub async fn list_matches(
    pool: &SqlitePool,
    project_id: &str,
    include_stale: bool,
) -> GrantResult<Vec<MatchDetail>> {
    get_project(pool, project_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM grant_matches WHERE project_id = ? AND (stale = 0 OR ?)",
    )
    .bind(project_id)
    .bind(include_stale)
    .fetch_all(pool)
    .await?;

    with_grants(pool, rows.iter().map(match_from_row).collect()).await
}

async fn with_grants(pool: &SqlitePool, matches: Vec<GrantMatch>) -> GrantResult<Vec<MatchDetail>> {
    let mut details = Vec::with_capacity(matches.len());
    for grant_match in matches {
        let grant = get_grant(pool, &grant_match.grant_id).await?;
        details.push(MatchDetail { grant_match, grant });
    }
    details.sort_by(|a, b| {
        a.grant_match.stale.cmp(&b.grant_match.stale).then_with(|| {
            rank_order(
                (a.grant_match.score, a.grant.deadline, a.grant.id.as_str()),
                (b.grant_match.score, b.grant.deadline, b.grant.id.as_str()),
            )
        })
    });
    Ok(details)
}

/// Flip the saved flag on an existing match.
pub async fn toggle_saved(
    pool: &SqlitePool,
    project_id: &str,
    grant_id: &str,
) -> GrantResult<GrantMatch> {
    let result = sqlx::query(
        "UPDATE grant_matches SET is_saved = 1 - is_saved WHERE project_id = ? AND grant_id = ?",
    )
    .bind(project_id)
    .bind(grant_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(GrantError::NoMatchFound {
            project_id: project_id.to_string(),
            grant_id: grant_id.to_string(),
        });
    }

    let row = sqlx::query("SELECT * FROM grant_matches WHERE project_id = ? AND grant_id = ?")
        .bind(project_id)
        .bind(grant_id)
        .fetch_one(pool)
        .await?;
    Ok(match_from_row(&row))
}

/// Saved matches across every project the user owns.
pub async fn list_saved(pool: &SqlitePool, owner: &str) -> GrantResult<Vec<MatchDetail>> {
    let rows = sqlx::query(
        r#"
        SELECT m.* FROM grant_matches m
        JOIN projects p ON p.id = m.project_id
        WHERE p.owner = ? AND m.is_saved = 1
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;

    with_grants(pool, rows.iter().map(match_from_row).collect()).await
}

/// A live (non-stale) match for the pair, if one exists.
pub async fn live_match(
    pool: &SqlitePool,
    project_id: &str,
    grant_id: &str,
) -> GrantResult<Option<GrantMatch>> {
    let row = sqlx::query(
        "SELECT * FROM grant_matches WHERE project_id = ? AND grant_id = ? AND stale = 0",
    )
    .bind(project_id)
    .bind(grant_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| match_from_row(&r)))
}

// ============ CLI ============

fn print_match(score: i64, grant: &Grant, rationale: &[String], flags: &str) {
    let deadline = grant
        .deadline
        .map(|d| d.to_string())
        .unwrap_or_else(|| "rolling".to_string());
    println!(
        "{:>3}  {:<12} {} ({}) | closes {}{}",
        score, grant.external_id, grant.title, grant.agency_acronym, deadline, flags
    );
    if !rationale.is_empty() {
        println!("     {}", rationale.join("; "));
    }
}

fn flags(m: &GrantMatch) -> String {
    let mut out = String::new();
    if m.is_saved {
        out.push_str(" [saved]");
    }
    if m.stale {
        out.push_str(&format!(
            " [stale: {}]",
            m.stale_reason.as_deref().unwrap_or("unknown")
        ));
    }
    out
}

pub async fn run_match(config: &Config, project_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let today = db::today();

    let project = get_project(&pool, project_id).await?;
    if let Err(e) = validate_project(&project) {
        pool.close().await;
        println!("No matches: {}.", e);
        return Ok(());
    }

    let matches = compute_matches(&pool, &config.matching, project_id, today).await?;
    let mut rows = Vec::with_capacity(matches.len());
    for m in &matches {
        rows.push((m, get_grant(&pool, &m.grant_id).await?));
    }
    pool.close().await;

    if rows.is_empty() {
        println!("No matching grants.");
        return Ok(());
    }
    println!("matches for {} ({})", project.name, project.id);
    for (m, grant) in &rows {
        print_match(m.score, grant, &m.rationale, &flags(m));
    }
    Ok(())
}

pub async fn run_matches(config: &Config, project_id: &str, include_stale: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let details = list_matches(&pool, project_id, include_stale).await;
    pool.close().await;
    let details = details?;

    if details.is_empty() {
        println!("No stored matches. Run `grantmatch match {}` first.", project_id);
        return Ok(());
    }
    for d in &details {
        print_match(
            d.grant_match.score,
            &d.grant,
            &d.grant_match.rationale,
            &flags(&d.grant_match),
        );
    }
    Ok(())
}

pub async fn run_save(config: &Config, project_id: &str, grant_key: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = match find_grant(&pool, grant_key).await {
        Ok(grant) => toggle_saved(&pool, project_id, &grant.id).await,
        Err(e) => Err(e),
    };
    pool.close().await;

    let m = result?;
    if m.is_saved {
        println!("saved {} for project {}", grant_key, project_id);
    } else {
        println!("unsaved {} for project {}", grant_key, project_id);
    }
    Ok(())
}

pub async fn run_saved(config: &Config, owner: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let details = list_saved(&pool, owner).await;
    pool.close().await;
    let details = details?;

    if details.is_empty() {
        println!("No saved grants.");
        return Ok(());
    }
    for d in &details {
        print_match(
            d.grant_match.score,
            &d.grant,
            &d.grant_match.rationale,
            &flags(&d.grant_match),
        );
    }
    Ok(())
}
