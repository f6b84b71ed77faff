//! End-to-end runs of the command tree against a scratch state directory

use pkrguard_cli::{cli, run, EXIT_FINDINGS, EXIT_OK};
use pkrguard_test_utils::{
    scratch, write_fixture, CLEAN_DOCKER, HARDCODED_PASSWORD, SSH_TIMEOUT_LOG, TRAILING_COMMA,
};
use std::path::Path;

async fn invoke(state: &Path, args: &[&str]) -> (u8, String) {
    let state = state.to_string_lossy().into_owned();
    let mut argv = vec!["pkrguard", "--state-dir", state.as_str()];
    argv.extend_from_slice(args);
    let matches = cli().try_get_matches_from(argv).unwrap();
    let mut out = Vec::new();
    let code = run(&matches, &mut out).await.unwrap();
    (code, String::from_utf8(out).unwrap())
}

#[test]
fn command_tree_is_consistent() {
    cli().debug_assert();
}

#[test]
fn subcommand_is_required() {
    assert!(cli().try_get_matches_from(["pkrguard"]).is_err());
    assert!(cli().try_get_matches_from(["pkrguard", "analyze"]).is_err());
}

#[tokio::test]
async fn analyze_exit_code_tracks_blocking_findings() {
    let dir = scratch();
    let state = dir.path().join("state");
    let dirty = write_fixture(dir.path(), "web.json", HARDCODED_PASSWORD);
    let clean = write_fixture(dir.path(), "app.json", CLEAN_DOCKER);

    let (code, out) = invoke(&state, &["analyze", dirty.to_str().unwrap()]).await;
    assert_eq!(code, EXIT_FINDINGS);
    assert!(out.contains("[critical]"));

    let (code, _) = invoke(&state, &["analyze", clean.to_str().unwrap()]).await;
    assert_eq!(code, EXIT_OK);
}

#[tokio::test]
async fn unparseable_input_is_labelled_partial() {
    let dir = scratch();
    let state = dir.path().join("state");
    let broken = write_fixture(dir.path(), "broken.json", TRAILING_COMMA);

    let (_, out) = invoke(&state, &["analyze", broken.to_str().unwrap()]).await;
    assert!(out.contains("partial textual analysis"));

    let (code, out) = invoke(&state, &["validate", broken.to_str().unwrap()]).await;
    assert_eq!(code, EXIT_FINDINGS);
    assert!(out.contains("no certificate"));
}

#[tokio::test]
async fn validate_issues_and_refuses() {
    let dir = scratch();
    let state = dir.path().join("state");
    let clean = write_fixture(dir.path(), "app.json", CLEAN_DOCKER);
    let dirty = write_fixture(dir.path(), "web.json", HARDCODED_PASSWORD);

    let (code, out) = invoke(&state, &["validate", clean.to_str().unwrap()]).await;
    assert_eq!(code, EXIT_OK);
    assert!(out.contains("issued"));
    let stored = std::fs::read_dir(state.join("certificates")).unwrap().count();
    assert_eq!(stored, 1);

    let (code, out) = invoke(&state, &["validate", dirty.to_str().unwrap()]).await;
    assert_eq!(code, EXIT_FINDINGS);
    assert!(out.contains("certificate refused"));
    assert!(out.contains("security"));
}

#[tokio::test]
async fn validate_reads_build_results() {
    let dir = scratch();
    let state = dir.path().join("state");
    let clean = write_fixture(dir.path(), "app.json", CLEAN_DOCKER);
    let build = write_fixture(
        dir.path(),
        "build.json",
        r#"{"success": false, "duration_secs": 120.0}"#,
    );

    let (code, out) = invoke(
        &state,
        &[
            "--json",
            "validate",
            clean.to_str().unwrap(),
            "--build",
            build.to_str().unwrap(),
        ],
    )
    .await;
    assert_eq!(code, EXIT_FINDINGS);
    let value: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(value["certification"]["status"], "refused");
    assert!(value["metrics"].is_object());
}

#[tokio::test]
async fn diagnose_shows_the_plan() {
    let dir = scratch();
    let state = dir.path().join("state");
    let log = write_fixture(dir.path(), "build.log", SSH_TIMEOUT_LOG);

    let (code, out) = invoke(&state, &["diagnose", log.to_str().unwrap()]).await;
    assert_eq!(code, EXIT_OK);
    assert!(out.contains("retry-with-backoff"));
}

#[tokio::test]
async fn optimize_emits_json() {
    let dir = scratch();
    let state = dir.path().join("state");
    let dirty = write_fixture(dir.path(), "web.json", HARDCODED_PASSWORD);

    let (code, out) = invoke(&state, &["optimize", dirty.to_str().unwrap(), "--json"]).await;
    assert_eq!(code, EXIT_OK);
    let value: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(value["hints"][0]["id"], "undersized-instance");
}

#[tokio::test]
async fn settings_file_is_honoured() {
    let dir = scratch();
    let state = dir.path().join("custom-state");
    let settings = write_fixture(
        dir.path(),
        "pkrguard.toml",
        &format!("state_dir = {:?}\n", state.to_string_lossy()),
    );
    let clean = write_fixture(dir.path(), "app.json", CLEAN_DOCKER);

    let matches = cli()
        .try_get_matches_from([
            "pkrguard",
            "--settings",
            settings.to_str().unwrap(),
            "analyze",
            clean.to_str().unwrap(),
        ])
        .unwrap();
    let mut out = Vec::new();
    assert_eq!(run(&matches, &mut out).await.unwrap(), EXIT_OK);
    assert!(state.join("signing.key").exists());
}

#[tokio::test]
async fn missing_input_is_an_error() {
    let dir = scratch();
    let matches = cli()
        .try_get_matches_from([
            "pkrguard",
            "--state-dir",
            dir.path().join("state").to_str().unwrap(),
            "optimize",
            dir.path().join("absent.json").to_str().unwrap(),
        ])
        .unwrap();
    let mut out = Vec::new();
    assert!(run(&matches, &mut out).await.is_err());
}
