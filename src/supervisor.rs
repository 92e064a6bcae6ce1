//! Embedded server process supervision
//!
//! Owns at most one embedded API server child process at a time, injects
//! its access credentials through the environment, performs the one-shot
//! startup handshake, and tears the process down on stop or exit.

use crate::credentials::{CredentialError, CredentialStore};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Login identity used by the wallet against the embedded server's API.
const LOGIN_ID: &str = "lumen";

/// Lifecycle state of the supervised server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// Errors from a start attempt or auto-start.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The child image could not be launched at all. The supervisor never
    /// enters Starting for this attempt.
    #[error("failed to launch embedded server {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child reported a structured startup error. The display text is
    /// the child's reason, verbatim.
    #[error("{0}")]
    Handshake(String),

    /// The child's first message did not match the handshake shape.
    #[error("embedded server sent an invalid handshake: {0}")]
    Protocol(String),

    /// The child exited before completing its handshake.
    #[error("embedded server exited before completing its handshake")]
    UnexpectedExit,

    #[error("embedded server did not complete its handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("auto-start is enabled but no node path is stored")]
    MissingNodePath,

    #[error(transparent)]
    Store(#[from] CredentialError),
}

/// Everything injected into the child's environment, enumerated explicitly.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Port for the server to bind; 0 asks the OS for any available port.
    pub port: u16,

    /// Data path of the Lightning node the server fronts.
    pub node_path: PathBuf,

    /// Login credential, the secret used as both identifier and passphrase.
    pub login: String,
}

impl SpawnConfig {
    pub fn new(node_path: &Path, secret: &str) -> Self {
        Self {
            port: 0,
            node_path: node_path.to_path_buf(),
            login: format!("{LOGIN_ID}:{secret}:{secret}"),
        }
    }

    /// Environment variables handed to the child. The controller exposes
    /// only the API: TLS and static UI assets are disabled.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            ("PORT", self.port.to_string()),
            ("NODE_PATH", self.node_path.display().to_string()),
            ("LOGIN", self.login.clone()),
            ("NO_TLS", "1".to_string()),
            ("NO_WEBUI", "1".to_string()),
            ("ENV", "production".to_string()),
        ]
    }
}

/// How to launch the embedded server image.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the embedded server executable.
    pub command: PathBuf,

    /// Extra arguments passed to the executable.
    pub args: Vec<String>,

    /// Upper bound on the handshake wait. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
}

impl SupervisorConfig {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            handshake_timeout: None,
        }
    }
}

/// Composed result of a successful start, handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicEndpoint {
    /// The bound address reported by the child, exactly as reported.
    pub server_url: String,
    pub secret: String,
    pub node_path: PathBuf,
}

/// The child's one-shot startup handshake, resolved from its first
/// non-empty stdout line.
#[derive(Debug)]
enum HandshakeOutcome {
    Ready(String),
    Failed(String),
    Invalid(String),
}

fn parse_handshake(line: &str) -> HandshakeOutcome {
    #[derive(Deserialize)]
    struct Wire {
        #[serde(rename = "serverUrl")]
        server_url: Option<String>,
        error: Option<String>,
    }

    match serde_json::from_str::<Wire>(line) {
        Ok(Wire {
            server_url: Some(url),
            ..
        }) => HandshakeOutcome::Ready(url),
        Ok(Wire {
            error: Some(reason),
            ..
        }) => HandshakeOutcome::Failed(reason),
        _ => HandshakeOutcome::Invalid(line.to_string()),
    }
}

/// Handle to one running child. Exclusively owned by the supervisor.
struct ActiveProcess {
    state: Arc<Mutex<ServiceState>>,
    pid: Option<u32>,
    started_at: SystemTime,
    kill_tx: Option<oneshot::Sender<()>>,
    reader: JoinHandle<()>,
    stderr_reader: Option<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

/// Supervises the embedded API server process.
///
/// At most one child is active at any time: `start` always fully stops a
/// prior instance before spawning. The supervisor object has exclusive
/// ownership of the process handle; dropping it terminates the child.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    store: CredentialStore,
    active: Option<ActiveProcess>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, store: CredentialStore) -> Self {
        Self {
            config,
            store,
            active: None,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Observed lifecycle state.
    pub fn state(&self) -> ServiceState {
        match &self.active {
            Some(active) => *active.state.lock().unwrap(),
            None => ServiceState::Stopped,
        }
    }

    /// OS pid of the active child, while it is alive.
    pub fn pid(&self) -> Option<u32> {
        self.active
            .as_ref()
            .filter(|active| *active.state.lock().unwrap() != ServiceState::Stopped)
            .and_then(|active| active.pid)
    }

    /// Creation timestamp of the current process handle.
    pub fn started_at(&self) -> Option<SystemTime> {
        self.active.as_ref().map(|active| active.started_at)
    }

    /// Stop any prior instance, spawn the embedded server for `node_path`,
    /// and wait for its one-shot handshake.
    pub async fn start(
        &mut self,
        node_path: impl Into<PathBuf>,
    ) -> Result<PublicEndpoint, SupervisorError> {
        let node_path = node_path.into();

        // A prior instance is always fully stopped (detached, terminated,
        // reaped) before the new spawn, so two handshakes never overlap.
        self.stop().await;

        let secret = self.store.get_or_create_secret()?;
        let spawn = SpawnConfig::new(&node_path, &secret);

        info!("starting embedded server for {}", node_path.display());

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(spawn.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                command: self.config.command.display().to_string(),
                source,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            // Both were requested as pipes; absence means the launch is unusable.
            let _ = child.start_kill();
            return Err(SupervisorError::Spawn {
                command: self.config.command.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "child stdio pipes unavailable",
                ),
            });
        };

        let pid = child.id();
        let state = Arc::new(Mutex::new(ServiceState::Starting));

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let reader = tokio::spawn(forward_child_stdout(stdout, handshake_tx));
        let stderr_reader = tokio::spawn(forward_child_stderr(stderr));
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(supervise_child(child, kill_rx, Arc::clone(&state)));

        self.active = Some(ActiveProcess {
            state: Arc::clone(&state),
            pid,
            started_at: SystemTime::now(),
            kill_tx: Some(kill_tx),
            reader,
            stderr_reader: Some(stderr_reader),
            monitor,
        });

        let outcome = match self.config.handshake_timeout {
            Some(limit) => match time::timeout(limit, handshake_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.stop().await;
                    return Err(SupervisorError::HandshakeTimeout(limit));
                }
            },
            None => handshake_rx.await,
        };

        match outcome {
            Ok(HandshakeOutcome::Ready(server_url)) => {
                set_state_if_starting(&state, ServiceState::Running);
                info!("embedded server ready at {server_url}");
                Ok(PublicEndpoint {
                    server_url,
                    secret,
                    node_path,
                })
            }
            Ok(HandshakeOutcome::Failed(reason)) => {
                set_state_if_starting(&state, ServiceState::Failed);
                self.stop().await;
                Err(SupervisorError::Handshake(reason))
            }
            Ok(HandshakeOutcome::Invalid(raw)) => {
                set_state_if_starting(&state, ServiceState::Failed);
                self.stop().await;
                Err(SupervisorError::Protocol(raw))
            }
            // Sender dropped: stdout closed before any handshake message.
            Err(_) => {
                self.stop().await;
                Err(SupervisorError::UnexpectedExit)
            }
        }
    }

    /// Terminate the active child, if any. Idempotent; listeners are
    /// detached before the kill so a dying child cannot deliver a stray
    /// handshake to a later start.
    pub async fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        if *active.state.lock().unwrap() != ServiceState::Stopped {
            info!("stopping embedded server");
        }

        active.reader.abort();
        if let Some(stderr_reader) = active.stderr_reader.take() {
            stderr_reader.abort();
        }
        if let Some(kill) = active.kill_tx.take() {
            let _ = kill.send(());
        }
        let _ = active.monitor.await;

        *active.state.lock().unwrap() = ServiceState::Stopped;
    }

    /// Start the embedded server if the stored auto-start preference says
    /// so; otherwise resolve with no endpoint and no side effects.
    pub async fn maybe_auto_start(&mut self) -> Result<Option<PublicEndpoint>, SupervisorError> {
        if !self.store.auto_start()? {
            return Ok(None);
        }

        match self.store.node_path()? {
            Some(node_path) => self.start(node_path).await.map(Some),
            None => Err(SupervisorError::MissingNodePath),
        }
    }

    /// Start the embedded server and, on success, persist the auto-start
    /// preference and node path for later launches.
    pub async fn enable(
        &mut self,
        node_path: impl Into<PathBuf>,
    ) -> Result<PublicEndpoint, SupervisorError> {
        let node_path = node_path.into();
        let endpoint = self.start(node_path.clone()).await?;

        self.store.set_auto_start(true)?;
        self.store.set_node_path(&node_path)?;

        Ok(endpoint)
    }

    /// Clear the auto-start preference and stop the embedded server.
    pub async fn disable(&mut self) -> Result<(), SupervisorError> {
        self.store.set_auto_start(false)?;
        self.stop().await;
        Ok(())
    }
}

fn set_state_if_starting(state: &Mutex<ServiceState>, next: ServiceState) {
    let mut guard = state.lock().unwrap();
    if *guard == ServiceState::Starting {
        *guard = next;
    }
}

/// Resolve the one-shot handshake from the first non-empty stdout line,
/// then forward the rest as informational log output.
async fn forward_child_stdout(stdout: ChildStdout, handshake_tx: oneshot::Sender<HandshakeOutcome>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut pending = Some(handshake_tx);

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match pending.take() {
            Some(tx) => {
                let _ = tx.send(parse_handshake(line));
            }
            None => debug!("embedded server: {line}"),
        }
    }
}

async fn forward_child_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            debug!("embedded server stderr: {}", line.trim());
        }
    }
}

/// Owns the child for its whole life: reaps it on self-exit, kills and
/// reaps it when termination is requested (or the supervisor is dropped,
/// which closes the kill channel).
async fn supervise_child(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    state: Arc<Mutex<ServiceState>>,
) {
    let self_exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    match self_exit {
        Some(Ok(status)) => info!("embedded server exited with {status}"),
        Some(Err(e)) => warn!("failed waiting on embedded server: {e}"),
        None => {
            if let Err(e) = child.start_kill() {
                debug!("embedded server already gone: {e}");
            }
            let _ = child.wait().await;
        }
    }

    *state.lock().unwrap() = ServiceState::Stopped;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handshake_ready() {
        let outcome = parse_handshake(r#"{"serverUrl":"http://127.0.0.1:45231"}"#);
        assert!(matches!(
            outcome,
            HandshakeOutcome::Ready(url) if url == "http://127.0.0.1:45231"
        ));
    }

    #[test]
    fn test_parse_handshake_error() {
        let outcome = parse_handshake(r#"{"error":"cannot bind"}"#);
        assert!(matches!(
            outcome,
            HandshakeOutcome::Failed(reason) if reason == "cannot bind"
        ));
    }

    #[test]
    fn test_parse_handshake_server_url_wins() {
        // Both fields present: the success payload takes precedence.
        let outcome =
            parse_handshake(r#"{"serverUrl":"http://127.0.0.1:1","error":"ignored"}"#);
        assert!(matches!(outcome, HandshakeOutcome::Ready(_)));
    }

    #[test]
    fn test_parse_handshake_rejects_other_shapes() {
        for line in ["not json", "42", "{}", r#"{"unrelated":true}"#] {
            assert!(
                matches!(parse_handshake(line), HandshakeOutcome::Invalid(_)),
                "line {line:?} should be an invalid handshake"
            );
        }
    }

    #[test]
    fn test_spawn_config_env() {
        let spawn = SpawnConfig::new(Path::new("/data/node1"), "deadbeef");
        let env = spawn.env_vars();

        let get = |name: &str| {
            env.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| panic!("missing env var {name}"))
        };

        assert_eq!(get("PORT"), "0");
        assert_eq!(get("NODE_PATH"), "/data/node1");
        assert_eq!(get("LOGIN"), "lumen:deadbeef:deadbeef");
        assert_eq!(get("NO_TLS"), "1");
        assert_eq!(get("NO_WEBUI"), "1");
        assert_eq!(get("ENV"), "production");
    }
}
