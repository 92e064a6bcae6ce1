// Hidden service publication
//
// Binds an ephemeral loopback HTTP listener in front of a request handler
// and republishes it as a Tor v3 hidden service.

pub mod config;
pub mod driver;
pub mod publisher;

pub use config::{HiddenServiceConfig, PublishOptions};
pub use driver::{OnionDriver, TorDaemon};
pub use publisher::{OnionPublisher, RequestHandler};

use thiserror::Error;

/// Errors from a publish attempt. All are fatal to that attempt and never
/// retried by the publisher.
#[derive(Debug, Error)]
pub enum OnionError {
    /// The local loopback listener could not be bound. Fails the attempt
    /// before any anonymity-network work starts.
    #[error("failed to bind local listener: {0}")]
    Bind(#[from] hyper::Error),

    #[error("HOME environment variable not set")]
    NoHome,

    #[error("tor binary not found ({0}); install tor or point at it explicitly")]
    DriverNotFound(String),

    #[error("failed to launch tor: {0}")]
    DriverSpawn(#[source] std::io::Error),

    #[error("failed to prepare tor directories: {0}")]
    DataDir(#[source] std::io::Error),

    #[error("hidden service bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("failed to read hidden service hostname: {0}")]
    Hostname(#[source] std::io::Error),
}
