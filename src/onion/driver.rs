// Anonymity-network driver for the stock tor daemon

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{HiddenServiceConfig, OnionError};

const TOR_BINARY: &str = "tor";

/// Number of trailing log lines kept for bootstrap failure reports.
const LOG_TAIL: usize = 8;

/// Launches one configured hidden service and returns once it is ready or
/// failed. Each attempt fires exactly one of those two outcomes.
#[async_trait]
pub trait OnionDriver: Send + Sync {
    async fn launch(&self, config: &HiddenServiceConfig) -> Result<(), OnionError>;
}

/// Driver backed by an external tor daemon, configured entirely through
/// command-line options.
pub struct TorDaemon {
    binary: PathBuf,
}

impl TorDaemon {
    /// Provision the driver: use the explicit binary path when given,
    /// otherwise search `PATH`.
    pub fn acquire(explicit: Option<&Path>) -> Result<Self, OnionError> {
        let binary = match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(OnionError::DriverNotFound(path.display().to_string()));
                }
                path.to_path_buf()
            }
            None => find_in_path(TOR_BINARY)
                .ok_or_else(|| OnionError::DriverNotFound(TOR_BINARY.to_string()))?,
        };

        debug!("using tor binary at {}", binary.display());
        Ok(Self { binary })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl OnionDriver for TorDaemon {
    async fn launch(&self, config: &HiddenServiceConfig) -> Result<(), OnionError> {
        prepare_directories(config)?;

        let mut child = Command::new(&self.binary)
            .args(config.to_args())
            .args(["--Log", "notice stdout"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(OnionError::DriverSpawn)?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(OnionError::DriverSpawn(std::io::Error::new(
                std::io::ErrorKind::Other,
                "tor stdout pipe unavailable",
            )));
        };

        let mut lines = BufReader::new(stdout).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL);
        let mut ready = false;

        while let Ok(Some(line)) = lines.next_line().await {
            debug!("tor: {line}");

            if line.contains("Bootstrapped 100%") {
                ready = true;
                break;
            }

            if tail.len() == LOG_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        if ready {
            info!("tor bootstrap complete");

            // The daemon stays up in the background serving the hidden
            // service; keep draining its log and report an exit.
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("tor: {line}");
                }
                match child.wait().await {
                    Ok(status) => warn!("tor daemon exited with {status}"),
                    Err(e) => warn!("failed waiting on tor daemon: {e}"),
                }
            });

            return Ok(());
        }

        // Log stream closed before the bootstrap completed
        let _ = child.start_kill();
        let _ = child.wait().await;

        let reason = if tail.is_empty() {
            "tor exited without producing output".to_string()
        } else {
            tail.into_iter().collect::<Vec<_>>().join(" | ")
        };
        Err(OnionError::Bootstrap(reason))
    }
}

fn prepare_directories(config: &HiddenServiceConfig) -> Result<(), OnionError> {
    std::fs::create_dir_all(&config.data_directory).map_err(OnionError::DataDir)?;
    std::fs::create_dir_all(&config.hidden_service_dir).map_err(OnionError::DataDir)?;

    // tor refuses hidden service directories that are group accessible
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(
            &config.hidden_service_dir,
            std::fs::Permissions::from_mode(0o700),
        )
        .map_err(OnionError::DataDir)?;
    }

    Ok(())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_in_path_locates_sh() {
        // sh is present on any unix test host
        assert!(find_in_path("sh").is_some());
    }

    #[test]
    fn test_find_in_path_misses_nonsense() {
        assert!(find_in_path("this-binary-does-not-exist-123456").is_none());
    }

    #[test]
    fn test_acquire_rejects_missing_explicit_path() {
        let result = TorDaemon::acquire(Some(Path::new("/nonexistent/tor")));
        assert!(matches!(result, Err(OnionError::DriverNotFound(_))));
    }

    #[test]
    fn test_acquire_accepts_existing_explicit_path() {
        let daemon = TorDaemon::acquire(Some(Path::new("/bin/sh"))).unwrap();
        assert_eq!(daemon.binary(), Path::new("/bin/sh"));
    }
}
