//! lumen - headless wallet shell entry point
//!
//! Wires the controller together the way the desktop shell does: open the
//! credential store, start (or auto-start) the embedded API server, and
//! optionally republish it as a Tor hidden service through a reverse
//! proxy. Ctrl-C stops the embedded server before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use lumen::{
    CredentialStore, OnionPublisher, ProcessSupervisor, PublishOptions, RequestHandler,
    SupervisorConfig,
};

/// lumen - supervise the wallet's embedded API server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Lightning node data directory to front
    ///
    /// When given, the embedded server is started for this node and the
    /// choice is persisted for auto-start on later launches. When omitted,
    /// the stored auto-start preference decides.
    #[arg(short = 'n', long)]
    node_path: Option<PathBuf>,

    /// Embedded API server executable
    #[arg(short = 's', long, default_value = "lumen-server")]
    server_bin: PathBuf,

    /// Extra argument for the embedded server (repeatable)
    #[arg(long)]
    server_arg: Vec<String>,

    /// Application data directory holding credentials and tor state
    ///
    /// Default: ~/.lumen
    #[arg(short = 'd', long)]
    data_dir: Option<PathBuf>,

    /// Seconds to wait for the startup handshake (0 waits forever)
    #[arg(long, default_value = "60")]
    handshake_timeout: u64,

    /// Republish the embedded server as a Tor hidden service
    #[arg(long)]
    onion: bool,

    /// Run the hidden service in non-anonymous single-hop mode
    ///
    /// Explicit opt-in: reduces latency but eliminates the privacy
    /// guarantee of onion routing.
    #[arg(long, requires = "onion")]
    non_anonymous: bool,

    /// Disable auto-start and exit without launching anything
    #[arg(long, conflicts_with = "node_path")]
    disable: bool,
}

async fn run(cli: Cli) -> Result<()> {
    let data_dir = match cli.data_dir {
        Some(ref dir) => dir.clone(),
        None => {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".lumen")
        }
    };

    let store = CredentialStore::open(&data_dir).context("Failed to open credential store")?;

    let mut config = SupervisorConfig::new(&cli.server_bin);
    config.args = cli.server_arg.clone();
    if cli.handshake_timeout > 0 {
        config.handshake_timeout = Some(Duration::from_secs(cli.handshake_timeout));
    }

    let mut supervisor = ProcessSupervisor::new(config, store);

    if cli.disable {
        supervisor.disable().await?;
        info!("embedded server auto-start disabled");
        return Ok(());
    }

    let endpoint = match &cli.node_path {
        Some(node_path) => Some(supervisor.enable(node_path.clone()).await?),
        None => supervisor.maybe_auto_start().await?,
    };

    let Some(endpoint) = endpoint else {
        info!("auto-start is disabled; pass --node-path to start the embedded server");
        return Ok(());
    };

    info!("embedded server API at {}", endpoint.server_url);

    if cli.onion {
        let mut options = PublishOptions::with_data_dir(data_dir.join("tor"));
        options.non_anonymous = cli.non_anonymous;

        let mut publisher = OnionPublisher::new(options);
        let public_url = publisher
            .publish(proxy_to(endpoint.server_url.clone()))
            .await
            .context("Failed to publish hidden service")?;

        info!("publicly reachable at {public_url}");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutting down");
    supervisor.stop().await;

    Ok(())
}

/// Reverse proxy forwarding hidden-service requests to the embedded server.
fn proxy_to(base_url: String) -> impl RequestHandler {
    let client: Client<HttpConnector> = Client::new();
    let base = base_url.trim_end_matches('/').to_string();

    move |mut request: Request<Body>| {
        let client = client.clone();
        let base = base.clone();

        async move {
            let path_and_query = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());

            let target: Uri = match format!("{base}{path_and_query}").parse() {
                Ok(uri) => uri,
                Err(e) => {
                    warn!("rejecting request with unusable URI: {e}");
                    return bad_gateway();
                }
            };

            *request.uri_mut() = target;
            request.headers_mut().remove(hyper::header::HOST);

            match client.request(request).await {
                Ok(response) => response,
                Err(e) => {
                    error!("proxying to embedded server failed: {e}");
                    bad_gateway()
                }
            }
        }
    }
}

fn bad_gateway() -> Response<Body> {
    let mut response = Response::new(Body::from("embedded server unavailable"));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    run(cli).await
}
