//! Toolkit wiring against a real state directory

use pkrguard_core::{Certification, Toolkit, ToolkitError, ToolkitSettings};
use pkrguard_test_utils::{
    scratch, write_fixture, CLEAN_DOCKER, HARDCODED_PASSWORD, SSH_TIMEOUT_LOG, TRAILING_COMMA,
};
use pkrguard_recovery::{CancelSignal, RecoveryTarget};
use pkrguard_validation::Dimension;
use std::time::Duration;

fn settings(dir: &std::path::Path) -> ToolkitSettings {
    ToolkitSettings {
        state_dir: dir.join("state"),
        ..ToolkitSettings::default()
    }
}

#[tokio::test]
async fn open_creates_persistent_state() {
    let dir = scratch();
    let settings = settings(dir.path());
    let toolkit = Toolkit::open(settings.clone()).await.unwrap();
    assert!(settings.pattern_store_path().exists());
    assert!(settings.signing_key_path().exists());
    assert!(settings.certificate_dir_path().is_dir());
    toolkit.shutdown().await.unwrap();

    let key = std::fs::read(settings.signing_key_path()).unwrap();
    let reopened = Toolkit::open(settings.clone()).await.unwrap();
    assert_eq!(std::fs::read(settings.signing_key_path()).unwrap(), key);
    reopened.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_completes_with_learning_engines_alive() {
    let dir = scratch();
    let toolkit = Toolkit::open(settings(dir.path())).await.unwrap();
    let engine = toolkit.recovery().clone();
    let path = write_fixture(dir.path(), "broken.json", TRAILING_COMMA);
    let log = "==> docker: Failed to parse template: invalid character '}' looking for beginning of object key string";

    let result = engine
        .recover(log, &RecoveryTarget::for_config(&path), &CancelSignal::new())
        .await
        .unwrap();
    engine.learn_from_recovery(&result, None).unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(5), toolkit.shutdown())
        .await
        .expect("shutdown finished")
        .unwrap()
        .unwrap();
    assert_eq!(stats.applied, 1);
    assert!(engine.learn_from_recovery(&result, None).is_err());
}

#[tokio::test]
async fn analysis_is_audited() {
    let dir = scratch();
    let settings = settings(dir.path());
    let toolkit = Toolkit::open(settings.clone()).await.unwrap();
    let path = write_fixture(dir.path(), "web.json", HARDCODED_PASSWORD);

    let outcome = toolkit.analyze_path(&path).await.unwrap();
    assert!(!outcome.is_partial());
    assert!(outcome.analysis.has_blocking_findings());
    toolkit.shutdown().await.unwrap();

    let audit = std::fs::read_to_string(settings.audit_log_path()).unwrap();
    assert_eq!(audit.lines().count(), 1);
}

#[tokio::test]
async fn broken_json_falls_back_to_text() {
    let dir = scratch();
    let toolkit = Toolkit::in_memory(ToolkitSettings::default()).unwrap();
    let path = write_fixture(dir.path(), "broken.json", TRAILING_COMMA);

    let outcome = toolkit.analyze_path(&path).await.unwrap();
    assert!(outcome.is_partial());
    assert!(outcome.config.is_none());
    assert!(!outcome.analysis.is_clean());
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = scratch();
    let toolkit = Toolkit::in_memory(ToolkitSettings::default()).unwrap();
    let err = toolkit
        .analyze_path(&dir.path().join("absent.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, ToolkitError::Parse(_)));
    assert!(!err.allows_textual_fallback());
}

#[tokio::test]
async fn certify_issues_and_persists() {
    let dir = scratch();
    let settings = settings(dir.path());
    let toolkit = Toolkit::open(settings.clone()).await.unwrap();
    let path = write_fixture(dir.path(), "app.json", CLEAN_DOCKER);
    let config = toolkit.load_configuration(&path).await.unwrap();

    let outcome = toolkit.certify(&config, None).await.unwrap();
    let certificate = outcome.certificate().unwrap();
    assert!(toolkit.validation().validate_certificate(certificate));
    assert!(toolkit.validation().validate_stored(&config.hash()).unwrap());
    toolkit.shutdown().await.unwrap();
}

#[tokio::test]
async fn certify_reports_refusal() {
    let toolkit = Toolkit::in_memory(ToolkitSettings::default()).unwrap();
    let dir = scratch();
    let path = write_fixture(dir.path(), "web.json", HARDCODED_PASSWORD);
    let config = toolkit.load_configuration(&path).await.unwrap();

    let outcome = toolkit.certify(&config, None).await.unwrap();
    match outcome.certification {
        Certification::Refused {
            failing_dimensions, ..
        } => assert_eq!(failing_dimensions, vec![Dimension::Security]),
        Certification::Issued { .. } => panic!("credential configuration was certified"),
    }
}

#[tokio::test]
async fn diagnose_leaves_files_alone() {
    let dir = scratch();
    let settings = settings(dir.path());
    let toolkit = Toolkit::open(settings.clone()).await.unwrap();
    let path = write_fixture(dir.path(), "web.json", HARDCODED_PASSWORD);
    let before = std::fs::read(&path).unwrap();

    let outcome = toolkit.diagnose(SSH_TIMEOUT_LOG, Some(&path)).await.unwrap();
    assert_eq!(outcome.plan.unwrap().template, "retry-with-backoff");
    assert!(outcome.escalation.is_none());

    let unknown = toolkit.diagnose("nothing useful\n", None).await.unwrap();
    assert!(unknown.plan.is_none());
    assert!(unknown.escalation.is_some());

    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(!settings.escalation_log_path().exists());
    toolkit.shutdown().await.unwrap();
}
