//! Projects and user profiles.
//!
//! Projects are owned by a user id; update and delete check ownership.
//! Deleting a project removes its matches, applications, and application
//! events in one transaction.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::{GrantError, GrantResult};
use crate::models::{format_amount, NewProject, Project, ProjectUpdate, UserProfile};
use crate::normalize::normalize_categories;

fn project_from_row(row: &SqliteRow) -> Project {
    let categories: String = row.get("categories_json");
    let agencies: String = row.get("preferred_agencies_json");
    Project {
        id: row.get("id"),
        owner: row.get("owner"),
        name: row.get("name"),
        description: row.get("description"),
        categories: db::list_from_json(&categories),
        funding_need: row.get("funding_need"),
        preferred_agencies: db::list_from_json(&agencies),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn clean_agencies(agencies: &[String]) -> Vec<String> {
    agencies
        .iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

fn check_funding(need: Option<i64>) -> GrantResult<()> {
    match need {
        Some(n) if n < 0 => Err(GrantError::Validation(
            "funding_need must not be negative".to_string(),
        )),
        _ => Ok(()),
    }
}

pub async fn create_project(pool: &SqlitePool, new: NewProject) -> GrantResult<Project> {
    if new.owner.trim().is_empty() {
        return Err(GrantError::Validation("owner is required".to_string()));
    }
    if new.name.trim().is_empty() {
        return Err(GrantError::Validation("project name is required".to_string()));
    }
    check_funding(new.funding_need)?;

    let now = db::now_ts();
    let project = Project {
        id: Uuid::new_v4().to_string(),
        owner: new.owner.trim().to_string(),
        name: new.name.trim().to_string(),
        description: new.description.trim().to_string(),
        categories: normalize_categories(&new.categories),
        funding_need: new.funding_need,
        preferred_agencies: clean_agencies(&new.preferred_agencies),
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        r#"
        INSERT INTO projects (id, owner, name, description, categories_json, funding_need,
            preferred_agencies_json, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&project.id)
    .bind(&project.owner)
    .bind(&project.name)
    .bind(&project.description)
    .bind(db::list_to_json(&project.categories))
    .bind(project.funding_need)
    .bind(db::list_to_json(&project.preferred_agencies))
    .bind(project.created_at)
    .bind(project.updated_at)
    .execute(pool)
    .await?;

    info!(project_id = %project.id, owner = %project.owner, "project created");
    Ok(project)
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> GrantResult<Project> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| project_from_row(&r))
        .ok_or_else(|| GrantError::not_found("project", id))
}

pub async fn list_projects(pool: &SqlitePool, owner: &str) -> GrantResult<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects WHERE owner = ? ORDER BY created_at DESC, id ASC")
        .bind(owner)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(project_from_row).collect())
}

async fn owned_project(pool: &SqlitePool, id: &str, owner: &str) -> GrantResult<Project> {
    let project = get_project(pool, id).await?;
    if project.owner != owner {
        // indistinguishable from a missing project for other users
        return Err(GrantError::not_found("project", id));
    }
    Ok(project)
}

pub async fn update_project(
    pool: &SqlitePool,
    id: &str,
    owner: &str,
    update: ProjectUpdate,
) -> GrantResult<Project> {
    let mut project = owned_project(pool, id, owner).await?;

    if let Some(name) = update.name {
        if name.trim().is_empty() {
            return Err(GrantError::Validation("project name is required".to_string()));
        }
        project.name = name.trim().to_string();
    }
    if let Some(description) = update.description {
        project.description = description.trim().to_string();
    }
    if let Some(categories) = update.categories {
        project.categories = normalize_categories(&categories);
    }
    if let Some(need) = update.funding_need {
        check_funding(need)?;
        project.funding_need = need;
    }
    if let Some(agencies) = update.preferred_agencies {
        project.preferred_agencies = clean_agencies(&agencies);
    }
    project.updated_at = db::now_ts();

    sqlx::query(
        r#"
        UPDATE projects SET name = ?, description = ?, categories_json = ?, funding_need = ?,
            preferred_agencies_json = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&project.name)
    .bind(&project.description)
    .bind(db::list_to_json(&project.categories))
    .bind(project.funding_need)
    .bind(db::list_to_json(&project.preferred_agencies))
    .bind(project.updated_at)
    .bind(&project.id)
    .execute(pool)
    .await?;

    Ok(project)
}

/// Delete a project together with its matches and applications.
pub async fn delete_project(pool: &SqlitePool, id: &str, owner: &str) -> GrantResult<()> {
    owned_project(pool, id, owner).await?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM application_events WHERE application_id IN (SELECT id FROM applications WHERE project_id = ?)",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM applications WHERE project_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM grant_matches WHERE project_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(project_id = %id, "project deleted");
    Ok(())
}

// ============ Profiles ============

/// First two characters of the user name, upper-cased.
pub fn avatar_initials(user_id: &str) -> String {
    user_id
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(2)
        .collect::<String>()
        .to_uppercase()
}

fn profile_from_row(row: &SqliteRow) -> UserProfile {
    UserProfile {
        user_id: row.get("user_id"),
        organization_name: row.get("organization_name"),
        organization_type: row.get("organization_type"),
        bio: row.get("bio"),
        avatar_initials: row.get("avatar_initials"),
        created_at: row.get("created_at"),
    }
}

pub async fn get_or_create_profile(pool: &SqlitePool, user_id: &str) -> GrantResult<UserProfile> {
    if user_id.trim().is_empty() {
        return Err(GrantError::Validation("user id is required".to_string()));
    }

    sqlx::query(
        r#"
        INSERT INTO user_profiles (user_id, avatar_initials, created_at)
        VALUES (?, ?, ?)
        ON CONFLICT(user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(avatar_initials(user_id))
    .bind(db::now_ts())
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT * FROM user_profiles WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(profile_from_row(&row))
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ProfileUpdate {
    pub organization_name: Option<String>,
    pub organization_type: Option<String>,
    pub bio: Option<String>,
}

pub async fn update_profile(
    pool: &SqlitePool,
    user_id: &str,
    update: ProfileUpdate,
) -> GrantResult<UserProfile> {
    let mut profile = get_or_create_profile(pool, user_id).await?;
    if let Some(v) = update.organization_name {
        profile.organization_name = v.trim().to_string();
    }
    if let Some(v) = update.organization_type {
        profile.organization_type = v.trim().to_string();
    }
    if let Some(v) = update.bio {
        profile.bio = v.trim().to_string();
    }

    sqlx::query(
        "UPDATE user_profiles SET organization_name = ?, organization_type = ?, bio = ? WHERE user_id = ?",
    )
    .bind(&profile.organization_name)
    .bind(&profile.organization_type)
    .bind(&profile.bio)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(profile)
}

// ============ CLI ============

fn print_project(project: &Project) {
    println!("--- Project ---");
    println!("id:           {}", project.id);
    println!("owner:        {}", project.owner);
    println!("name:         {}", project.name);
    if !project.description.is_empty() {
        println!("description:  {}", project.description);
    }
    println!(
        "categories:   {}",
        if project.categories.is_empty() {
            "(none)".to_string()
        } else {
            project.categories.join(", ")
        }
    );
    match project.funding_need {
        Some(n) => println!("funding need: {}", format_amount(n)),
        None => println!("funding need: (not set)"),
    }
    if !project.preferred_agencies.is_empty() {
        println!("agencies:     {}", project.preferred_agencies.join(", "));
    }
}

pub async fn run_project_create(config: &Config, new: NewProject) -> Result<()> {
    let pool = db::connect(config).await?;
    let project = create_project(&pool, new).await;
    pool.close().await;
    print_project(&project?);
    Ok(())
}

pub async fn run_project_list(config: &Config, owner: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let projects = list_projects(&pool, owner).await;
    pool.close().await;
    let projects = projects?;

    if projects.is_empty() {
        println!("No projects for {}.", owner);
        return Ok(());
    }
    for p in &projects {
        println!("{}  {}  [{}]", p.id, p.name, p.categories.join(", "));
    }
    Ok(())
}

pub async fn run_project_show(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let project = get_project(&pool, id).await;
    pool.close().await;
    print_project(&project?);
    Ok(())
}

pub async fn run_project_update(
    config: &Config,
    id: &str,
    owner: &str,
    update: ProjectUpdate,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let project = update_project(&pool, id, owner, update).await;
    pool.close().await;
    print_project(&project?);
    Ok(())
}

pub async fn run_project_delete(config: &Config, id: &str, owner: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = delete_project(&pool, id, owner).await;
    pool.close().await;
    result?;
    println!("deleted project {}", id);
    Ok(())
}

fn print_profile(profile: &UserProfile) {
    println!("--- Profile ---");
    println!("user:         {}", profile.user_id);
    println!("initials:     {}", profile.avatar_initials);
    println!("organization: {}", profile.organization_name);
    println!("type:         {}", profile.organization_type);
    if !profile.bio.is_empty() {
        println!("bio:          {}", profile.bio);
    }
}

pub async fn run_profile_show(config: &Config, user_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let profile = get_or_create_profile(&pool, user_id).await;
    pool.close().await;
    print_profile(&profile?);
    Ok(())
}

pub async fn run_profile_set(config: &Config, user_id: &str, update: ProfileUpdate) -> Result<()> {
    let pool = db::connect(config).await?;
    let profile = update_profile(&pool, user_id, update).await;
    pool.close().await;
    print_profile(&profile?);
    Ok(())
}
