//! lumen - Embedded service lifecycle and exposure controller
//!
//! This library is the service-controller core of a desktop Lightning
//! wallet shell: it supervises the embedded API server process (spawn,
//! credential injection, one-shot startup handshake, termination) and can
//! republish a local HTTP listener as a Tor hidden service.

pub mod credentials;
pub mod onion;
pub mod supervisor;

pub use credentials::{CredentialError, CredentialStore};
pub use onion::{
    HiddenServiceConfig, OnionDriver, OnionError, OnionPublisher, PublishOptions, RequestHandler,
    TorDaemon,
};
pub use supervisor::{
    ProcessSupervisor, PublicEndpoint, ServiceState, SpawnConfig, SupervisorConfig,
    SupervisorError,
};
