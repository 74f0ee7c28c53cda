use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use jobwire::config::ModelConfig;
use jobwire::protocol::NamedValues;
use jobwire::worker::{CommandModel, Model, ModelError, RunControl};

/// Create a model running `command` inside a fresh temporary directory
fn test_model(command: &str) -> (CommandModel, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ModelConfig::new(command).with_working_dir(dir.path());
    (CommandModel::new(config), dir)
}

fn parameters() -> NamedValues {
    [("alpha".to_string(), 0.25), ("beta".to_string(), 4.0)].into()
}

#[tokio::test]
async fn test_execute_reads_observations() {
    let (model, _dir) = test_model("printf 'o1 42.5\\no2 -1e-3\\n' > observations.txt");

    let observations = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap();

    assert_eq!(observations.len(), 2);
    assert_eq!(observations.get("o1"), Some(&42.5));
    assert_eq!(observations.get("o2"), Some(&-0.001));
}

#[tokio::test]
async fn test_execute_writes_parameter_file() {
    let (model, dir) = test_model("cp parameters.txt observations.txt");

    let observations = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap();
    assert_eq!(observations, parameters());

    let written = std::fs::read_to_string(dir.path().join("parameters.txt")).unwrap();
    assert!(written.contains("alpha "));
    assert!(written.contains("beta "));
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (model, _dir) = test_model("echo 'mesh too coarse' >&2; exit 3");

    let err = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap_err();
    match err {
        ModelError::CommandFailed { code, stderr } => {
            assert_eq!(code, Some(3));
            assert_eq!(stderr, "mesh too coarse");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_execute_missing_observation_file() {
    let (model, _dir) = test_model("true");

    let err = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::ReadOutput { .. }));
}

#[tokio::test]
async fn test_stale_observations_are_not_reused() {
    let (model, dir) = test_model("true");
    std::fs::write(dir.path().join("observations.txt"), "o1 1.0\n").unwrap();

    let err = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::ReadOutput { .. }));
}

#[tokio::test]
async fn test_malformed_observations() {
    let (model, _dir) = test_model("echo 'o1 not-a-number' > observations.txt");

    let err = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::ParseOutput { line: 1, .. }));
}

#[tokio::test]
async fn test_cancel_kills_command() {
    let (model, _dir) = test_model("sleep 30");
    let control = Arc::new(RunControl::new());

    let canceller = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.request_cancel();
    });

    let started = Instant::now();
    let err = model.execute(&parameters(), &control).await.unwrap_err();

    assert!(matches!(err, ModelError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_missing_working_dir_fails_to_write() {
    let dir = tempfile::tempdir().unwrap();
    let config = ModelConfig::new("true").with_working_dir(dir.path().join("absent"));
    let model = CommandModel::new(config);

    let err = model
        .execute(&parameters(), &RunControl::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ModelError::WriteInput { .. }));
}
