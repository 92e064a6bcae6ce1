//! Integration tests for the embedded server supervisor
//!
//! The fake embedded servers are inline /bin/sh scripts speaking the
//! one-shot stdout handshake.


use lumen::{ProcessSupervisor, ServiceState, SupervisorError};
use std::path::PathBuf;
use std::time::Duration;
use test_utils::*;

const READY_SERVER: &str = r#"echo '{"serverUrl":"http://127.0.0.1:45231"}'; sleep 30"#;

#[tokio::test]
async fn test_successful_handshake_resolves_endpoint() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    let endpoint = supervisor
        .start("/data/node1")
        .await
        .expect("start should succeed");

    assert_eq!(endpoint.server_url, "http://127.0.0.1:45231");
    assert_eq!(endpoint.node_path, PathBuf::from("/data/node1"));
    assert_eq!(
        endpoint.secret,
        supervisor.store().get_or_create_secret().unwrap()
    );
    assert_eq!(supervisor.state(), ServiceState::Running);

    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_failure_handshake_surfaces_reason_verbatim() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(
        sh_server(r#"echo '{"error":"cannot bind"}'; sleep 30"#),
        open_store(dir.path()),
    );

    let err = supervisor
        .start("/data/node1")
        .await
        .expect_err("start should fail");

    assert!(matches!(err, SupervisorError::Handshake(_)));
    assert_eq!(err.to_string(), "cannot bind");
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_unrecognized_message_is_a_protocol_violation() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(
        sh_server(r#"echo 'listening on port 9000'; sleep 30"#),
        open_store(dir.path()),
    );

    let err = supervisor
        .start("/data/node1")
        .await
        .expect_err("start should fail");

    assert!(matches!(err, SupervisorError::Protocol(_)));
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_spawn_failure_is_immediate() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(
        lumen::SupervisorConfig::new("/nonexistent/embedded-server-123456"),
        open_store(dir.path()),
    );

    let err = supervisor
        .start("/data/node1")
        .await
        .expect_err("start should fail");

    assert!(matches!(err, SupervisorError::Spawn { .. }));
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_exit_before_handshake() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server("exit 1"), open_store(dir.path()));

    let err = supervisor
        .start("/data/node1")
        .await
        .expect_err("start should fail");

    assert!(matches!(err, SupervisorError::UnexpectedExit));
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let dir = temp_dir();
    let mut config = sh_server("sleep 30");
    config.handshake_timeout = Some(Duration::from_millis(200));
    let mut supervisor = ProcessSupervisor::new(config, open_store(dir.path()));

    let err = supervisor
        .start("/data/node1")
        .await
        .expect_err("start should time out");

    assert!(matches!(err, SupervisorError::HandshakeTimeout(_)));
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    // Stopping a supervisor that never started is a no-op
    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServiceState::Stopped);

    supervisor.start("/data/node1").await.unwrap();
    supervisor.stop().await;
    supervisor.stop().await;
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_restart_terminates_prior_instance_first() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    supervisor.start("/data/node1").await.unwrap();
    let first_pid = supervisor.pid().expect("active child has a pid");
    assert!(process_alive(first_pid));

    // The second start reaps the first child before spawning; by the time
    // it returns there is exactly one server alive
    supervisor.start("/data/node2").await.unwrap();
    let second_pid = supervisor.pid().expect("active child has a pid");

    assert!(!process_alive(first_pid));
    assert!(process_alive(second_pid));
    assert_ne!(first_pid, second_pid);
    assert_eq!(supervisor.state(), ServiceState::Running);

    supervisor.stop().await;
    assert!(wait_for(|| !process_alive(second_pid), 5).await);
}

#[tokio::test]
async fn test_self_exit_transitions_to_stopped() {
    let dir = temp_dir();
    // Completes the handshake and exits immediately
    let mut supervisor = ProcessSupervisor::new(
        sh_server(r#"echo '{"serverUrl":"http://127.0.0.1:1"}'"#),
        open_store(dir.path()),
    );

    supervisor.start("/data/node1").await.unwrap();

    let stopped = wait_for(|| supervisor.state() == ServiceState::Stopped, 5).await;
    assert!(stopped, "supervisor should observe the child's exit");
}

#[tokio::test]
async fn test_dropping_supervisor_kills_child() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    supervisor.start("/data/node1").await.unwrap();
    let pid = supervisor.pid().expect("active child has a pid");

    drop(supervisor);

    assert!(wait_for(|| !process_alive(pid), 5).await);
}

#[tokio::test]
async fn test_maybe_auto_start_disabled_is_a_no_op() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    let endpoint = supervisor.maybe_auto_start().await.unwrap();

    assert!(endpoint.is_none());
    assert_eq!(supervisor.state(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_maybe_auto_start_uses_stored_path() {
    let dir = temp_dir();
    let store = open_store(dir.path());
    store.set_auto_start(true).unwrap();
    store.set_node_path(std::path::Path::new("/data/node7")).unwrap();

    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), store);

    let endpoint = supervisor
        .maybe_auto_start()
        .await
        .unwrap()
        .expect("auto-start should launch the server");

    assert_eq!(endpoint.node_path, PathBuf::from("/data/node7"));
    supervisor.stop().await;
}

#[tokio::test]
async fn test_maybe_auto_start_without_path_is_an_error() {
    let dir = temp_dir();
    let store = open_store(dir.path());
    store.set_auto_start(true).unwrap();

    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), store);

    let err = supervisor.maybe_auto_start().await.expect_err("no path stored");
    assert!(matches!(err, SupervisorError::MissingNodePath));
}

#[tokio::test]
async fn test_enable_persists_preference_on_success() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    supervisor.enable("/data/node3").await.unwrap();

    assert!(supervisor.store().auto_start().unwrap());
    assert_eq!(
        supervisor.store().node_path().unwrap(),
        Some(PathBuf::from("/data/node3"))
    );

    supervisor.disable().await.unwrap();
    assert!(!supervisor.store().auto_start().unwrap());
    assert_eq!(supervisor.state(), ServiceState::Stopped);
    // The stored path survives disable for the next enable
    assert_eq!(
        supervisor.store().node_path().unwrap(),
        Some(PathBuf::from("/data/node3"))
    );
}

#[tokio::test]
async fn test_enable_does_not_persist_on_failure() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(
        sh_server(r#"echo '{"error":"no such node"}'"#),
        open_store(dir.path()),
    );

    supervisor
        .enable("/data/node4")
        .await
        .expect_err("enable should fail");

    assert!(!supervisor.store().auto_start().unwrap());
    assert_eq!(supervisor.store().node_path().unwrap(), None);
}

#[tokio::test]
async fn test_secret_is_stable_across_restarts() {
    let dir = temp_dir();
    let mut supervisor = ProcessSupervisor::new(sh_server(READY_SERVER), open_store(dir.path()));

    let first = supervisor.start("/data/node1").await.unwrap();
    let second = supervisor.start("/data/node1").await.unwrap();

    assert_eq!(first.secret, second.secret);
    supervisor.stop().await;
}
