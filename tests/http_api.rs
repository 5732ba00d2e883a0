//! The HTTP API served from an in-memory database.

use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;

use grantmatch::config::Config;
use grantmatch::{migrate, server};

async fn spawn_api() -> String {
    let config: Config = toml::from_str("[db]\npath = \"unused.sqlite\"\n").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate::apply(&pool).await.unwrap();

    let app = server::router(Arc::new(config), pool);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_health() {
    let base = spawn_api().await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_match_and_apply_over_http() {
    let base = spawn_api().await;
    let client = reqwest::Client::new();

    let report: Value = client
        .post(format!("{}/sync", base))
        .json(&json!({ "sample": true }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["source"], "sample");
    assert_eq!(report["created"], 5);

    let resp = client
        .post(format!("{}/projects", base))
        .json(&json!({
            "owner": "alice",
            "name": "Reading Corner",
            "categories": ["education"],
            "funding_need": 40000
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let project: Value = resp.json().await.unwrap();
    let project_id = project["id"].as_str().unwrap().to_string();

    let matched: Value = client
        .post(format!("{}/projects/{}/match", base, project_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let matches = matched["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["score"], 74);
    assert!(matched.get("notice").is_none());

    let resp = client
        .post(format!("{}/applications", base))
        .json(&json!({ "project_id": project_id, "grant_id": "SG-001" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let app: Value = resp.json().await.unwrap();
    assert_eq!(app["status"], "drafted");
    let app_id = app["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/applications/{}/advance", base, app_id))
        .json(&json!({ "status": "accepted" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "invalid_transition");

    let resp = client
        .post(format!("{}/applications/{}/advance", base, app_id))
        .json(&json!({ "status": "submitted" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let app: Value = resp.json().await.unwrap();
    assert_eq!(app["status"], "submitted");
}

#[tokio::test]
async fn test_error_contract() {
    let base = spawn_api().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/grants/SG-404", base)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "not_found");
    assert_eq!(err["error"]["message"], "grant not found: SG-404");

    let resp = client
        .post(format!("{}/projects", base))
        .json(&json!({ "owner": "alice", "name": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_unscorable_project_gets_notice() {
    let base = spawn_api().await;
    let client = reqwest::Client::new();

    let project: Value = client
        .post(format!("{}/projects", base))
        .json(&json!({ "owner": "bob", "name": "Someday" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let matched: Value = client
        .post(format!("{}/projects/{}/match", base, project["id"].as_str().unwrap()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(matched["matches"], json!([]));
    assert!(matched["notice"].as_str().unwrap().contains("category tags"));
}

#[tokio::test]
async fn test_patch_null_clears_funding_need() {
    let base = spawn_api().await;
    let client = reqwest::Client::new();

    let project: Value = client
        .post(format!("{}/projects", base))
        .json(&json!({
            "owner": "alice",
            "name": "Reading Corner",
            "categories": ["education"],
            "funding_need": 40000
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = format!("{}/projects/{}", base, project["id"].as_str().unwrap());

    let renamed: Value = client
        .patch(&url)
        .json(&json!({ "owner": "alice", "name": "Reading Pals" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(renamed["funding_need"], 40000);

    let resp = client
        .patch(&url)
        .json(&json!({ "owner": "alice", "funding_need": null }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let cleared: Value = resp.json().await.unwrap();
    assert_eq!(cleared["funding_need"], Value::Null);
    assert_eq!(cleared["name"], "Reading Pals");
}

#[tokio::test]
async fn test_deadlines_accepts_huge_window() {
    let base = spawn_api().await;
    let client = reqwest::Client::new();
    client
        .post(format!("{}/sync", base))
        .json(&json!({ "sample": true }))
        .send()
        .await
        .unwrap();

    let resp = client
        .get(format!("{}/deadlines?days=1000000000", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let grants: Value = resp.json().await.unwrap();
    assert_eq!(grants.as_array().unwrap().len(), 5);
}
