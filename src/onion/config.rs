// Hidden service configuration handed to the tor driver

use std::path::{Path, PathBuf};

use super::OnionError;

/// Directory name under the wallet data dir holding tor state.
const TOR_DIR: &str = "tor";

/// Subdirectory of the tor data dir holding the hidden service keys and
/// the published hostname.
const HIDDEN_SERVICE_DIR: &str = "hidden_service";

/// Inbound port advertised on the hidden service.
const INBOUND_PORT: u16 = 80;

/// Caller-facing options for a publish attempt.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Tor data directory.
    pub data_dir: PathBuf,

    /// Hidden service directory; the `hostname` file appears here.
    pub hidden_service_dir: PathBuf,

    /// Explicit opt-in to single-hop, non-anonymous operation. Trades the
    /// privacy guarantee for lower latency.
    pub non_anonymous: bool,

    /// Explicit path to a tor binary, overriding the `PATH` search.
    pub tor_binary: Option<PathBuf>,
}

impl PublishOptions {
    /// Options rooted at the given tor data directory, with the hidden
    /// service directory in its default place underneath.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let hidden_service_dir = data_dir.join(HIDDEN_SERVICE_DIR);

        Self {
            data_dir,
            hidden_service_dir,
            non_anonymous: false,
            tor_binary: None,
        }
    }

    /// Default options under `~/.lumen/tor`.
    pub fn from_home() -> Result<Self, OnionError> {
        let home = std::env::var("HOME").map_err(|_| OnionError::NoHome)?;
        Ok(Self::with_data_dir(
            PathBuf::from(home).join(".lumen").join(TOR_DIR),
        ))
    }
}

/// One hidden service descriptor, built fresh per publish attempt from the
/// bound local port.
#[derive(Debug, Clone)]
pub struct HiddenServiceConfig {
    pub data_directory: PathBuf,
    pub hidden_service_dir: PathBuf,

    /// Hidden service protocol version. Always 3.
    pub version: u8,

    /// Port advertised on the hidden service.
    pub inbound_port: u16,

    /// Local loopback port the hidden service forwards to.
    pub local_port: u16,

    pub non_anonymous: bool,
}

impl HiddenServiceConfig {
    pub fn new(options: &PublishOptions, local_port: u16) -> Self {
        Self {
            data_directory: options.data_dir.clone(),
            hidden_service_dir: options.hidden_service_dir.clone(),
            version: 3,
            inbound_port: INBOUND_PORT,
            local_port,
            non_anonymous: options.non_anonymous,
        }
    }

    /// Render the configuration as tor command-line options.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "--DataDirectory".to_string(),
            self.data_directory.display().to_string(),
            "--HiddenServiceDir".to_string(),
            self.hidden_service_dir.display().to_string(),
            "--HiddenServiceVersion".to_string(),
            self.version.to_string(),
            "--HiddenServicePort".to_string(),
            format!("{} 127.0.0.1:{}", self.inbound_port, self.local_port),
        ];

        if self.non_anonymous {
            args.extend(
                [
                    "--SocksPort",
                    "0",
                    "--HiddenServiceNonAnonymousMode",
                    "1",
                    "--HiddenServiceSingleHopMode",
                    "1",
                ]
                .map(str::to_string),
            );
        }

        args
    }

    /// Path of the hostname file tor persists once the service exists.
    pub fn hostname_path(&self) -> PathBuf {
        self.hidden_service_dir.join("hostname")
    }
}

/// Read and trim the published hostname from the hidden service directory.
pub(crate) fn read_hostname(hidden_service_dir: &Path) -> Result<String, OnionError> {
    let raw = std::fs::read_to_string(hidden_service_dir.join("hostname"))
        .map_err(OnionError::Hostname)?;
    Ok(raw.trim().to_string())
}
