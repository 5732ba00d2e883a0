//! JSON HTTP API over the sync client, matcher, and application tracker.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Row counts and last sync run |
//! | `POST` | `/sync` | Run a sync (`{"sample": bool, "dry_run": bool}`) |
//! | `GET`  | `/grants` | Browse grants (`search`, `agency`, `status`, `limit`) |
//! | `GET`  | `/grants/{id}` | One grant by id or external id |
//! | `GET`  | `/agencies` | Agencies with open grant counts |
//! | `GET`  | `/deadlines` | Open grants closing within `days` (default 120) |
//! | `POST` | `/projects` | Create a project |
//! | `GET`  | `/projects?owner=` | A user's projects |
//! | `GET`/`PATCH`/`DELETE` | `/projects/{id}` | Read, update, delete (owner only) |
//! | `POST` | `/projects/{id}/match` | Recompute matches |
//! | `GET`  | `/projects/{id}/matches` | Stored matches (`include_stale`) |
//! | `POST` | `/projects/{id}/matches/{grant_id}/save` | Toggle saved |
//! | `GET`  | `/users/{id}/saved` | Saved matches across a user's projects |
//! | `GET`/`PUT` | `/users/{id}/profile` | Profile (created on first read) |
//! | `POST` | `/applications` | Open an application |
//! | `GET`  | `/applications?owner=` | A user's applications |
//! | `GET`  | `/applications/{id}` | One application |
//! | `POST` | `/applications/{id}/advance` | Transition (`{"status": "submitted"}`) |
//! | `GET`  | `/applications/{id}/history` | Transition audit trail |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_transition", "message": "invalid transition from drafted to accepted" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `not_found` | 404 |
//! | `invalid_transition` | 409 |
//! | `invalid_project`, `no_match_found`, `record_parse`, `bad_request` | 422 |
//! | `source_unavailable` | 503 |
//! | `internal` | 500 |

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::error::GrantError;
use crate::grants::{self, GrantFilter, DEFAULT_DEADLINE_WINDOW_DAYS};
use crate::ingest::{self, SyncReport};
use crate::matcher::{self, MatchDetail};
use crate::migrate;
use crate::models::{
    Application, ApplicationEvent, ApplicationStatus, Grant, GrantMatch, NewProject, Project,
    ProjectUpdate, UserProfile,
};
use crate::projects::{self, ProfileUpdate};
use crate::stats::{self, Stats};
use crate::tracker;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
}

/// Starts the HTTP server on `[server].bind`. Creates the schema if needed
/// and runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let app = router(Arc::new(config.clone()), pool);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("grantmatch server listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// The full route table over an existing pool.
pub fn router(config: Arc<Config>, pool: SqlitePool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/sync", post(handle_sync))
        .route("/grants", get(handle_list_grants))
        .route("/grants/{id}", get(handle_get_grant))
        .route("/agencies", get(handle_agencies))
        .route("/deadlines", get(handle_deadlines))
        .route("/projects", post(handle_create_project).get(handle_list_projects))
        .route(
            "/projects/{id}",
            get(handle_get_project)
                .patch(handle_update_project)
                .delete(handle_delete_project),
        )
        .route("/projects/{id}/match", post(handle_compute_matches))
        .route("/projects/{id}/matches", get(handle_list_matches))
        .route(
            "/projects/{id}/matches/{grant_id}/save",
            post(handle_toggle_saved),
        )
        .route("/users/{id}/saved", get(handle_list_saved))
        .route(
            "/users/{id}/profile",
            get(handle_get_profile).put(handle_update_profile),
        )
        .route(
            "/applications",
            post(handle_create_application).get(handle_list_applications),
        )
        .route("/applications/{id}", get(handle_get_application))
        .route("/applications/{id}/advance", post(handle_advance_application))
        .route("/applications/{id}/history", get(handle_application_history))
        .layer(cors)
        .with_state(AppState { config, pool })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl GrantError {
    fn status_code(&self) -> StatusCode {
        match self {
            GrantError::NotFound { .. } => StatusCode::NOT_FOUND,
            GrantError::InvalidTransition { .. } => StatusCode::CONFLICT,
            GrantError::InvalidProject(_)
            | GrantError::NoMatchFound { .. }
            | GrantError::RecordParse { .. }
            | GrantError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GrantError::SourceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GrantError::Database(_) | GrantError::Json(_) | GrantError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GrantError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, GrantError>;

// ============ Health / stats / sync ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_stats(State(state): State<AppState>) -> ApiResult<Stats> {
    Ok(Json(stats::get_stats(&state.pool).await?))
}

#[derive(Deserialize, Default)]
struct SyncRequest {
    #[serde(default)]
    sample: bool,
    #[serde(default)]
    dry_run: bool,
}

async fn handle_sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<SyncReport> {
    let today = db::today();
    let chain = if req.sample {
        ingest::sample_chain(today)
    } else {
        ingest::live_chain(&state.config.portal)?
    };
    let report = ingest::sync_with_chain(&state.pool, &chain, req.dry_run, today).await?;
    Ok(Json(report))
}

// ============ Grants ============

async fn handle_list_grants(
    State(state): State<AppState>,
    Query(filter): Query<GrantFilter>,
) -> ApiResult<Vec<Grant>> {
    Ok(Json(grants::list_grants(&state.pool, &filter).await?))
}

async fn handle_get_grant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Grant> {
    Ok(Json(grants::find_grant(&state.pool, &id).await?))
}

async fn handle_agencies(State(state): State<AppState>) -> ApiResult<Vec<grants::AgencySummary>> {
    Ok(Json(grants::list_agencies(&state.pool).await?))
}

#[derive(Deserialize)]
struct DeadlineQuery {
    days: Option<i64>,
}

async fn handle_deadlines(
    State(state): State<AppState>,
    Query(q): Query<DeadlineQuery>,
) -> ApiResult<Vec<Grant>> {
    let days = q.days.unwrap_or(DEFAULT_DEADLINE_WINDOW_DAYS);
    Ok(Json(
        grants::upcoming_deadlines(&state.pool, db::today(), days).await?,
    ))
}

// ============ Projects ============

#[derive(Deserialize)]
struct OwnerQuery {
    owner: String,
}

async fn handle_create_project(
    State(state): State<AppState>,
    Json(new): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), GrantError> {
    let project = projects::create_project(&state.pool, new).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn handle_list_projects(
    State(state): State<AppState>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Vec<Project>> {
    Ok(Json(projects::list_projects(&state.pool, &q.owner).await?))
}

async fn handle_get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Project> {
    Ok(Json(projects::get_project(&state.pool, &id).await?))
}

#[derive(Deserialize)]
struct ProjectPatch {
    owner: String,
    #[serde(flatten)]
    update: ProjectUpdate,
}

async fn handle_update_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<ProjectPatch>,
) -> ApiResult<Project> {
    Ok(Json(
        projects::update_project(&state.pool, &id, &patch.owner, patch.update).await?,
    ))
}

async fn handle_delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<OwnerQuery>,
) -> Result<StatusCode, GrantError> {
    projects::delete_project(&state.pool, &id, &q.owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Matches ============

#[derive(Serialize)]
struct MatchResponse {
    matches: Vec<GrantMatch>,
    /// Set when the project lacks the details needed to score it.
    #[serde(skip_serializing_if = "Option::is_none")]
    notice: Option<String>,
}

async fn handle_compute_matches(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<MatchResponse> {
    let project = projects::get_project(&state.pool, &id).await?;
    let notice = matcher::validate_project(&project).err().map(|e| e.to_string());
    let matches =
        matcher::compute_matches(&state.pool, &state.config.matching, &id, db::today()).await?;
    Ok(Json(MatchResponse { matches, notice }))
}

#[derive(Deserialize)]
struct MatchesQuery {
    #[serde(default)]
    include_stale: bool,
}

async fn handle_list_matches(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<MatchesQuery>,
) -> ApiResult<Vec<MatchDetail>> {
    Ok(Json(
        matcher::list_matches(&state.pool, &id, q.include_stale).await?,
    ))
}

async fn handle_toggle_saved(
    State(state): State<AppState>,
    Path((id, grant_key)): Path<(String, String)>,
) -> ApiResult<GrantMatch> {
    let grant = grants::find_grant(&state.pool, &grant_key).await?;
    Ok(Json(matcher::toggle_saved(&state.pool, &id, &grant.id).await?))
}

async fn handle_list_saved(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Vec<MatchDetail>> {
    Ok(Json(matcher::list_saved(&state.pool, &owner).await?))
}

// ============ Profiles ============

async fn handle_get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<UserProfile> {
    Ok(Json(
        projects::get_or_create_profile(&state.pool, &user_id).await?,
    ))
}

async fn handle_update_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<ProfileUpdate>,
) -> ApiResult<UserProfile> {
    Ok(Json(
        projects::update_profile(&state.pool, &user_id, update).await?,
    ))
}

// ============ Applications ============

#[derive(Deserialize)]
struct NewApplication {
    project_id: String,
    grant_id: String,
    #[serde(default)]
    notes: String,
}

async fn handle_create_application(
    State(state): State<AppState>,
    Json(req): Json<NewApplication>,
) -> Result<(StatusCode, Json<Application>), GrantError> {
    let grant = grants::find_grant(&state.pool, &req.grant_id).await?;
    let app = tracker::create_application(
        &state.pool,
        &state.config.applications,
        &req.project_id,
        &grant.id,
        &req.notes,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(app)))
}

async fn handle_list_applications(
    State(state): State<AppState>,
    Query(q): Query<OwnerQuery>,
) -> ApiResult<Vec<Application>> {
    Ok(Json(tracker::list_applications(&state.pool, &q.owner).await?))
}

async fn handle_get_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Application> {
    Ok(Json(tracker::get_application(&state.pool, &id).await?))
}

#[derive(Deserialize)]
struct AdvanceRequest {
    status: String,
}

async fn handle_advance_application(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> ApiResult<Application> {
    let next: ApplicationStatus = req.status.parse().map_err(GrantError::Validation)?;
    Ok(Json(
        tracker::advance_application(&state.pool, &id, next).await?,
    ))
}

async fn handle_application_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ApplicationEvent>> {
    Ok(Json(tracker::application_history(&state.pool, &id).await?))
}
