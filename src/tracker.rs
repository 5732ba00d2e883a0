//! Application tracker.
//!
//! ```text
//! Drafted → Submitted → UnderReview → Accepted
//!                                   ↘ Rejected
//! ```
//!
//! `Accepted` and `Rejected` are terminal. Every transition is a
//! compare-and-set on the current status and appends an
//! `application_events` row, so concurrent callers cannot skip a state.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::config::{ApplicationsConfig, Config};
use crate::db;
use crate::error::{GrantError, GrantResult};
use crate::grants::{find_grant, get_grant};
use crate::matcher::live_match;
use crate::models::{Application, ApplicationEvent, ApplicationStatus};
use crate::projects::get_project;

impl ApplicationStatus {
    /// The single forward step allowed from each state.
    pub fn can_transition_to(self, next: ApplicationStatus) -> bool {
        use crate::models::ApplicationStatus::*;
        matches!(
            (self, next),
            (Drafted, Submitted)
                | (Submitted, UnderReview)
                | (UnderReview, Accepted)
                | (UnderReview, Rejected)
        )
    }
}

fn parse_status(value: &str) -> GrantResult<ApplicationStatus> {
    value
        .parse()
        .map_err(|e: String| GrantError::Other(anyhow::anyhow!(e)))
}

fn application_from_row(row: &SqliteRow) -> GrantResult<Application> {
    let status: String = row.get("status");
    Ok(Application {
        id: row.get("id"),
        owner: row.get("owner"),
        project_id: row.get("project_id"),
        grant_id: row.get("grant_id"),
        status: parse_status(&status)?,
        notes: row.get("notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        submitted_at: row.get("submitted_at"),
        decided_at: row.get("decided_at"),
    })
}

/// Open an application in `Drafted`.
///
/// With `require_match` the pair must have a live match, otherwise
/// [`GrantError::NoMatchFound`]. The application's owner is the project's
/// owner.
pub async fn create_application(
    pool: &SqlitePool,
    policy: &ApplicationsConfig,
    project_id: &str,
    grant_id: &str,
    notes: &str,
) -> GrantResult<Application> {
    let project = get_project(pool, project_id).await?;
    get_grant(pool, grant_id).await?;

    if policy.require_match && live_match(pool, project_id, grant_id).await?.is_none() {
        return Err(GrantError::NoMatchFound {
            project_id: project_id.to_string(),
            grant_id: grant_id.to_string(),
        });
    }

    let now = db::now_ts();
    let application = Application {
        id: Uuid::new_v4().to_string(),
        owner: project.owner,
        project_id: project_id.to_string(),
        grant_id: grant_id.to_string(),
        status: ApplicationStatus::Drafted,
        notes: notes.trim().to_string(),
        created_at: now,
        updated_at: now,
        submitted_at: None,
        decided_at: None,
    };

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO applications (id, owner, project_id, grant_id, status, notes, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&application.id)
    .bind(&application.owner)
    .bind(&application.project_id)
    .bind(&application.grant_id)
    .bind(application.status.as_str())
    .bind(&application.notes)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO application_events (application_id, from_status, to_status, at) VALUES (?, NULL, ?, ?)",
    )
    .bind(&application.id)
    .bind(application.status.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(application_id = %application.id, project_id, grant_id, "application drafted");
    Ok(application)
}

pub async fn get_application(pool: &SqlitePool, id: &str) -> GrantResult<Application> {
    let row = sqlx::query("SELECT * FROM applications WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GrantError::not_found("application", id))?;
    application_from_row(&row)
}

/// Move an application to `next`. An illegal step fails with
/// [`GrantError::InvalidTransition`] and changes nothing.
pub async fn advance_application(
    pool: &SqlitePool,
    id: &str,
    next: ApplicationStatus,
) -> GrantResult<Application> {
    let current = get_application(pool, id).await?;
    if !current.status.can_transition_to(next) {
        return Err(GrantError::InvalidTransition {
            from: current.status,
            to: next,
        });
    }

    let now = db::now_ts();
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        r#"
        UPDATE applications SET
            status = ?,
            updated_at = ?,
            submitted_at = CASE WHEN ? = 'submitted' THEN ? ELSE submitted_at END,
            decided_at = CASE WHEN ? IN ('accepted', 'rejected') THEN ? ELSE decided_at END
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(next.as_str())
    .bind(now)
    .bind(next.as_str())
    .bind(now)
    .bind(next.as_str())
    .bind(now)
    .bind(id)
    .bind(current.status.as_str())
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        // someone else moved it first; report against the status they left
        drop(tx);
        let latest = get_application(pool, id).await?;
        return Err(GrantError::InvalidTransition {
            from: latest.status,
            to: next,
        });
    }

    sqlx::query(
        "INSERT INTO application_events (application_id, from_status, to_status, at) VALUES (?, ?, ?, ?)",
    )
    .bind(id)
    .bind(current.status.as_str())
    .bind(next.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(application_id = id, from = %current.status, to = %next, "application advanced");
    get_application(pool, id).await
}

pub async fn list_applications(pool: &SqlitePool, owner: &str) -> GrantResult<Vec<Application>> {
    let rows = sqlx::query("SELECT * FROM applications WHERE owner = ? ORDER BY created_at DESC, id ASC")
        .bind(owner)
        .fetch_all(pool)
        .await?;
    rows.iter().map(application_from_row).collect()
}

/// Audit trail for one application, oldest first.
pub async fn application_history(pool: &SqlitePool, id: &str) -> GrantResult<Vec<ApplicationEvent>> {
    get_application(pool, id).await?;
    let rows = sqlx::query(
        "SELECT application_id, from_status, to_status, at FROM application_events WHERE application_id = ? ORDER BY id ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> GrantResult<ApplicationEvent> {
            let from: Option<String> = row.get("from_status");
            let to: String = row.get("to_status");
            Ok(ApplicationEvent {
                application_id: row.get("application_id"),
                from_status: from.as_deref().map(parse_status).transpose()?,
                to_status: parse_status(&to)?,
                at: row.get("at"),
            })
        })
        .collect()
}

// ============ CLI ============

fn print_application(app: &Application) {
    println!("--- Application ---");
    println!("id:           {}", app.id);
    println!("owner:        {}", app.owner);
    println!("project:      {}", app.project_id);
    println!("grant:        {}", app.grant_id);
    println!("status:       {}", app.status);
    if !app.notes.is_empty() {
        println!("notes:        {}", app.notes);
    }
}

pub async fn run_apply(config: &Config, project_id: &str, grant_key: &str, notes: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = match find_grant(&pool, grant_key).await {
        Ok(grant) => {
            create_application(&pool, &config.applications, project_id, &grant.id, notes).await
        }
        Err(e) => Err(e),
    };
    pool.close().await;
    print_application(&result?);
    Ok(())
}

pub async fn run_advance(config: &Config, id: &str, next: ApplicationStatus) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = advance_application(&pool, id, next).await;
    pool.close().await;
    let app = result?;
    println!("application {} is now {}", app.id, app.status);
    Ok(())
}

pub async fn run_application_show(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = get_application(&pool, id).await;
    pool.close().await;
    print_application(&result?);
    Ok(())
}

pub async fn run_application_list(config: &Config, owner: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = list_applications(&pool, owner).await;
    pool.close().await;
    let apps = result?;

    if apps.is_empty() {
        println!("No applications for {}.", owner);
        return Ok(());
    }
    for app in &apps {
        println!("{}  {:<12}  project {}  grant {}", app.id, app.status, app.project_id, app.grant_id);
    }
    Ok(())
}

pub async fn run_application_history(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = application_history(&pool, id).await;
    pool.close().await;

    for event in result? {
        let at = chrono::DateTime::from_timestamp(event.at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| event.at.to_string());
        match event.from_status {
            Some(from) => println!("{}  {} → {}", at, from, event.to_status),
            None => println!("{}  created as {}", at, event.to_status),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApplicationStatus::*;

    const ALL: [ApplicationStatus; 5] = [Drafted, Submitted, UnderReview, Accepted, Rejected];

    #[test]
    fn test_only_forward_single_steps_are_allowed() {
        let allowed: Vec<_> = ALL
            .iter()
            .flat_map(|from| ALL.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (Drafted, Submitted),
                (Submitted, UnderReview),
                (UnderReview, Accepted),
                (UnderReview, Rejected),
            ]
        );
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [Accepted, Rejected] {
            assert!(ALL.iter().all(|to| !terminal.can_transition_to(*to)));
        }
    }
}
