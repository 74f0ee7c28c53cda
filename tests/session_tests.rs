
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use jobwire::agent::SessionOutcome;
use jobwire::error::AgentError;
use jobwire::protocol::payload;
use jobwire::protocol::{Envelope, MessageKind};
use test_harness::{
    join, slow_model, spawn_session, test_config, AgentConnection, FailingModel,
    FakeCoordinator, FixedModel, SumModel,
};

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_finished_run_reports_observations_then_ready() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1", "p2"], &["o1"]).await;
    conn.start_run(1, 7, &[1.0, 2.0]).await;

    let finished = conn.recv().await;
    assert_eq!(finished.kind, MessageKind::RunFinished);
    assert_eq!((finished.group_id, finished.run_id), (1, 7));
    assert!(finished.info_text.contains("run took"));

    let values = payload::decode_run_output(
        &finished.payload,
        &names(&["p1", "p2"]),
        &names(&["o1"]),
    )
    .unwrap();
    assert_eq!(values.parameters.get("p1"), Some(&1.0));
    assert_eq!(values.parameters.get("p2"), Some(&2.0));
    assert_eq!(values.observations.get("o1"), Some(&3.0));
    assert!(values.run_seconds > 0.0);

    let ready = conn.recv().await;
    assert_eq!(ready.kind, MessageKind::Ready);
    assert_eq!(ready.info_text, finished.info_text);

    conn.send_kind(MessageKind::Terminate).await;
    assert!(matches!(join(agent).await, Ok(SessionOutcome::Completed)));
    assert!(conn.recv_or_closed().await.is_none());
}

#[tokio::test]
async fn test_failed_run_reports_failure_text() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(
        test_config(coordinator.port),
        Arc::new(FailingModel("solver diverged")),
    );
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1"]).await;
    conn.start_run(2, 3, &[0.5]).await;

    let failed = conn.recv().await;
    assert_eq!(failed.kind, MessageKind::RunFailed);
    assert_eq!((failed.group_id, failed.run_id), (2, 3));
    assert!(failed.info_text.contains("solver diverged"));

    let ready = conn.recv().await;
    assert_eq!(ready.kind, MessageKind::Ready);

    conn.send_kind(MessageKind::Terminate).await;
    assert!(matches!(join(agent).await, Ok(SessionOutcome::Completed)));
}

#[tokio::test]
async fn test_missing_observation_reports_failure() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(
        test_config(coordinator.port),
        Arc::new(FixedModel::new(&[("o1", 1.0)])),
    );
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1", "o2"]).await;
    conn.start_run(1, 1, &[0.0]).await;

    let failed = conn.recv().await;
    assert_eq!(failed.kind, MessageKind::RunFailed);
    assert!(failed.info_text.contains("o2"));
    assert_eq!(conn.recv().await.kind, MessageKind::Ready);

    conn.send_kind(MessageKind::Terminate).await;
    assert!(join(agent).await.is_ok());
}

#[tokio::test]
async fn test_kill_sends_exactly_one_run_killed() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), slow_model());
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1"]).await;
    conn.start_run(4, 9, &[1.0]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.send_kind(MessageKind::RequestKill).await;
    conn.send_kind(MessageKind::RequestKill).await;

    let killed = conn.recv().await;
    assert_eq!(killed.kind, MessageKind::RunKilled);
    assert_eq!((killed.group_id, killed.run_id), (4, 9));
    assert_eq!(conn.recv().await.kind, MessageKind::Ready);
    assert!(conn.try_recv(Duration::from_millis(200)).await.is_none());

    conn.send_kind(MessageKind::Terminate).await;
    assert!(matches!(join(agent).await, Ok(SessionOutcome::Completed)));
}

#[tokio::test]
async fn test_terminate_during_run_sends_nothing() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), slow_model());
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1"]).await;
    conn.start_run(1, 1, &[1.0]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.send_kind(MessageKind::Terminate).await;

    assert!(matches!(join(agent).await, Ok(SessionOutcome::Completed)));
    assert!(conn.recv_or_closed().await.is_none());
}

#[tokio::test]
async fn test_pings_answered_during_long_run() {
    let coordinator = FakeCoordinator::bind().await;
    let model = FixedModel::new(&[("o1", 5.0)]).with_delay(Duration::from_millis(400));
    let agent = spawn_session(test_config(coordinator.port), Arc::new(model));
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1"]).await;
    conn.start_run(1, 2, &[1.0]).await;

    // Each reply must come back within a few dispatch ticks of 10 ms
    for _ in 0..3 {
        conn.send_kind(MessageKind::Ping).await;
        let reply = tokio::time::timeout(Duration::from_millis(100), conn.recv())
            .await
            .expect("ping not answered within the dispatch cadence");
        assert_eq!(reply.kind, MessageKind::Ping);
    }

    assert_eq!(conn.recv().await.kind, MessageKind::RunFinished);
    assert_eq!(conn.recv().await.kind, MessageKind::Ready);

    conn.send_kind(MessageKind::Terminate).await;
    assert!(join(agent).await.is_ok());
}

#[tokio::test]
async fn test_idle_requests_are_answered() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    conn.send_kind(MessageKind::Ping).await;
    assert_eq!(conn.recv().await.kind, MessageKind::Ping);

    conn.send_kind(MessageKind::RequestRunDir).await;
    let run_dir = conn.recv().await;
    assert_eq!(run_dir.kind, MessageKind::RunDir);
    let cwd = std::env::current_dir().unwrap();
    assert_eq!(run_dir.payload.as_ref(), cwd.to_string_lossy().as_bytes());

    conn.send_kind(MessageKind::RequestLinpack).await;
    let linpack = conn.recv().await;
    assert_eq!(linpack.kind, MessageKind::Linpack);
    let report: serde_json::Value = serde_json::from_str(&linpack.info_text).unwrap();
    assert_eq!(report["size"], 100);
    assert!(report["mflops"].as_f64().unwrap() > 0.0);

    conn.send_kind(MessageKind::Terminate).await;
    assert!(join(agent).await.is_ok());
}

#[tokio::test]
async fn test_idle_kill_and_unsupported_kinds_are_ignored() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    conn.send_kind(MessageKind::RequestKill).await;
    conn.send_kind(MessageKind::RunFinished).await;
    conn.send_kind(MessageKind::Ready).await;
    assert!(conn.try_recv(Duration::from_millis(150)).await.is_none());

    conn.send_kind(MessageKind::Ping).await;
    assert_eq!(conn.recv().await.kind, MessageKind::Ping);

    conn.send_kind(MessageKind::Terminate).await;
    assert!(matches!(join(agent).await, Ok(SessionOutcome::Completed)));
}

#[tokio::test]
async fn test_corrupt_name_list_is_reported() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    conn.send(Envelope::control(MessageKind::ParameterNames).with_payload(vec![0x01u8, 0xff]))
        .await;

    let reply = conn.recv().await;
    assert_eq!(reply.kind, MessageKind::CorruptMessage);
    assert!(conn.recv_or_closed().await.is_none());
    assert!(matches!(
        join(agent).await,
        Err(AgentError::CorruptMessage(_))
    ));
}

#[tokio::test]
async fn test_unknown_kind_is_corrupt_and_restartable() {
    let coordinator = FakeCoordinator::bind().await;
    let config = test_config(coordinator.port).with_restart_on_error(true);
    let agent = spawn_session(config, Arc::new(SumModel));

    let mut stream = coordinator.accept_stream().await;
    let mut frame = Vec::new();
    frame.extend_from_slice(&16u32.to_be_bytes());
    frame.extend_from_slice(&99i32.to_be_bytes());
    frame.extend_from_slice(&0i32.to_be_bytes());
    frame.extend_from_slice(&0i32.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes());
    stream.write_all(&frame).await.unwrap();

    let mut conn = AgentConnection::new(stream);
    assert_eq!(conn.recv().await.kind, MessageKind::CorruptMessage);
    match join(agent).await {
        Ok(SessionOutcome::RestartRequested(err)) => assert!(err.is_corrupt()),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_start_run_payload_must_match_names() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1", "p2"], &["o1"]).await;
    conn.start_run(1, 1, &[1.0]).await;

    assert_eq!(conn.recv().await.kind, MessageKind::CorruptMessage);
    assert!(matches!(
        join(agent).await,
        Err(AgentError::CorruptMessage(_))
    ));
}

#[tokio::test]
async fn test_unexpected_message_during_run_is_fatal() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), slow_model());
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1"]).await;
    conn.start_run(1, 1, &[1.0]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.send_kind(MessageKind::RequestRunDir).await;

    assert!(matches!(
        join(agent).await,
        Err(AgentError::ProtocolViolation(MessageKind::RequestRunDir))
    ));
    assert!(conn.recv_or_closed().await.is_none());
}

#[tokio::test]
async fn test_silent_coordinator_is_declared_dead() {
    let coordinator = FakeCoordinator::bind().await;
    let config = test_config(coordinator.port).with_max_no_ping_secs(1);
    let agent = spawn_session(config, Arc::new(SumModel));
    let _conn = coordinator.accept().await;

    assert!(matches!(
        join(agent).await,
        Err(AgentError::PeerSilent { .. })
    ));
}

#[tokio::test]
async fn test_zero_threshold_waits_forever() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!agent.is_finished());

    conn.send_kind(MessageKind::Terminate).await;
    assert!(matches!(join(agent).await, Ok(SessionOutcome::Completed)));
}

#[tokio::test]
async fn test_peer_close_without_restart_is_fatal() {
    let coordinator = FakeCoordinator::bind().await;
    let agent = spawn_session(test_config(coordinator.port), Arc::new(SumModel));
    let conn = coordinator.accept().await;
    drop(conn);

    assert!(matches!(join(agent).await, Err(AgentError::PeerClosed)));
}

#[tokio::test]
async fn test_run_info_records_current_run() {
    let dir = tempfile::tempdir().unwrap();
    let info_path = dir.path().join("run.info");

    let coordinator = FakeCoordinator::bind().await;
    let config = test_config(coordinator.port).with_run_info_path(&info_path);
    let agent = spawn_session(config, Arc::new(SumModel));
    let mut conn = coordinator.accept().await;

    conn.send_names(&["p1"], &["o1"]).await;
    conn.start_run(3, 11, &[2.0]).await;
    assert_eq!(conn.recv().await.kind, MessageKind::RunFinished);
    assert_eq!(conn.recv().await.kind, MessageKind::Ready);

    let contents = std::fs::read_to_string(&info_path).unwrap();
    assert!(contents.contains("run_id, 11"));
    assert!(contents.contains("group_id, 3"));
    assert!(contents.contains("started_at, "));

    conn.send_kind(MessageKind::Terminate).await;
    assert!(join(agent).await.is_ok());
}
