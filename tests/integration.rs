use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn grantmatch_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_grantmatch"))
}

/// A config whose portal points at a port nothing listens on, so a live
/// sync can only fail.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/grantmatch.sqlite"

[portal]
base_url = "http://127.0.0.1:9"
api_url = "http://127.0.0.1:9/api/grants"
timeout_secs = 2
max_retries = 0

[log]
filter = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("grantmatch.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_grantmatch(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = grantmatch_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run grantmatch binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn field<'a>(stdout: &'a str, label: &str) -> &'a str {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix(label))
        .map(str::trim)
        .unwrap_or_else(|| panic!("no '{}' line in output: {}", label, stdout))
}

fn seeded_env() -> (TempDir, PathBuf) {
    let (tmp, config_path) = setup_test_env();
    let (_, stderr, ok) = run_grantmatch(&config_path, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    let (_, stderr, ok) = run_grantmatch(&config_path, &["sync", "--sample"]);
    assert!(ok, "sample sync failed: {}", stderr);
    (tmp, config_path)
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_grantmatch(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/grantmatch.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_grantmatch(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_grantmatch(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_grantmatch(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_sample_sync_then_resync_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    run_grantmatch(&config_path, &["init"]);

    let (stdout, stderr, success) = run_grantmatch(&config_path, &["sync", "--sample"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("sync sample"));
    assert!(stdout.contains("created: 5"));
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_grantmatch(&config_path, &["sync", "--sample"]);
    assert!(success);
    assert!(stdout.contains("created: 0"), "got: {}", stdout);
    assert!(stdout.contains("unchanged: 5"), "got: {}", stdout);
}

#[test]
fn test_sync_dry_run_writes_nothing() {
    let (_tmp, config_path) = setup_test_env();
    run_grantmatch(&config_path, &["init"]);

    let (stdout, _, success) = run_grantmatch(&config_path, &["sync", "--sample", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("created: 5"));

    let (stdout, _, _) = run_grantmatch(&config_path, &["grants"]);
    assert!(stdout.contains("No grants."), "got: {}", stdout);
}

#[test]
fn test_unreachable_portal_fails_without_writes() {
    let (_tmp, config_path) = setup_test_env();
    run_grantmatch(&config_path, &["init"]);

    let (_, stderr, success) = run_grantmatch(&config_path, &["sync"]);
    assert!(!success, "sync against a dead portal must fail");
    assert!(stderr.contains("grant source unavailable"), "stderr: {}", stderr);

    let (stdout, _, _) = run_grantmatch(&config_path, &["stats"]);
    assert!(stdout.contains("Grants:        0"), "got: {}", stdout);
    assert!(stdout.contains("failed via none"), "got: {}", stdout);
}

#[test]
fn test_browse_and_lookup() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, success) = run_grantmatch(&config_path, &["grants", "--agency", "MOE"]);
    assert!(success);
    assert!(stdout.contains("SG-001"));
    assert!(!stdout.contains("SG-002"));

    let (stdout, _, success) = run_grantmatch(&config_path, &["grant", "SG-001"]);
    assert!(success);
    assert!(stdout.contains("Learning Futures Grant"));
    assert!(stdout.contains("$50,000"));

    let (_, stderr, success) = run_grantmatch(&config_path, &["grant", "SG-999"]);
    assert!(!success);
    assert!(stderr.contains("grant not found"), "stderr: {}", stderr);

    let (stdout, _, success) = run_grantmatch(&config_path, &["agencies"]);
    assert!(success);
    assert!(stdout.contains("IMDA"));
}

#[test]
fn test_match_apply_and_advance() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, stderr, success) = run_grantmatch(
        &config_path,
        &[
            "project", "create", "--owner", "alice", "--name", "Reading Corner",
            "--category", "education", "--need", "40000",
        ],
    );
    assert!(success, "project create failed: {}", stderr);
    let project_id = field(&stdout, "id:").to_string();

    // no match yet, so the tracker refuses
    let (_, stderr, success) = run_grantmatch(&config_path, &["apply", &project_id, "SG-001"]);
    assert!(!success);
    assert!(stderr.contains("no match exists"), "stderr: {}", stderr);

    let (stdout, _, success) = run_grantmatch(&config_path, &["match", &project_id]);
    assert!(success);
    assert!(stdout.contains("SG-001"), "got: {}", stdout);
    assert!(stdout.contains(" 74  SG-001"), "got: {}", stdout);

    let (stdout, stderr, success) = run_grantmatch(&config_path, &["apply", &project_id, "SG-001"]);
    assert!(success, "apply failed: {}", stderr);
    assert!(stdout.contains("drafted"));
    let app_id = field(&stdout, "id:").to_string();

    let (_, stderr, success) =
        run_grantmatch(&config_path, &["application", "advance", &app_id, "accepted"]);
    assert!(!success);
    assert!(stderr.contains("invalid transition from drafted to accepted"), "stderr: {}", stderr);

    let (stdout, _, success) =
        run_grantmatch(&config_path, &["application", "advance", &app_id, "submitted"]);
    assert!(success);
    assert!(stdout.contains("is now submitted"));

    let (stdout, _, _) = run_grantmatch(&config_path, &["application", "history", &app_id]);
    assert!(stdout.contains("created as drafted"));
    assert!(stdout.contains("drafted → submitted"));
}

#[test]
fn test_stats_after_sample_sync() {
    let (_tmp, config_path) = seeded_env();

    let (stdout, _, success) = run_grantmatch(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Grants:        5 (5 open)"), "got: {}", stdout);
    assert!(stdout.contains("Agencies:      5"), "got: {}", stdout);
    assert!(stdout.contains("ok via sample"), "got: {}", stdout);
}
