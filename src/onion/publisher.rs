// Republishes a local HTTP listener as a hidden service endpoint

use futures::future::BoxFuture;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::config::{read_hostname, HiddenServiceConfig, PublishOptions};
use super::driver::{OnionDriver, TorDaemon};
use super::OnionError;

/// Handler for requests arriving through the hidden service.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request<Body>) -> BoxFuture<'static, Response<Body>>;
}

impl<F, Fut> RequestHandler for F
where
    F: Fn(Request<Body>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Body>> + Send + 'static,
{
    fn handle(&self, request: Request<Body>) -> BoxFuture<'static, Response<Body>> {
        Box::pin((self)(request))
    }
}

/// Publishes local HTTP listeners as anonymity-network endpoints.
///
/// The driver is provisioned lazily on the first publish attempt and
/// cached for later ones.
pub struct OnionPublisher {
    options: PublishOptions,
    driver: Option<Box<dyn OnionDriver>>,
    listeners: Vec<JoinHandle<()>>,
}

impl OnionPublisher {
    pub fn new(options: PublishOptions) -> Self {
        Self {
            options,
            driver: None,
            listeners: Vec::new(),
        }
    }

    /// Publisher with a pre-acquired driver.
    pub fn with_driver(options: PublishOptions, driver: Box<dyn OnionDriver>) -> Self {
        Self {
            options,
            driver: Some(driver),
            listeners: Vec::new(),
        }
    }

    /// Bind a loopback listener in front of `handler`, launch a hidden
    /// service pointing at it, and return the public base URL.
    ///
    /// Resolves or fails exactly once per attempt; a failure produces no
    /// address and leaves no listener behind.
    pub async fn publish<H: RequestHandler>(&mut self, handler: H) -> Result<String, OnionError> {
        // Local listener on an OS-assigned port, bound before any
        // anonymity-network work starts.
        let handler = Arc::new(handler);
        let make_svc = make_service_fn(move |_conn| {
            let handler = Arc::clone(&handler);
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler.handle(request).await) }
                }))
            }
        });

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = Server::try_bind(&addr)?.serve(make_svc);
        let local_port = server.local_addr().port();
        info!("local listener bound on 127.0.0.1:{local_port}");

        let listener = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("local listener failed: {e}");
            }
        });

        let config = HiddenServiceConfig::new(&self.options, local_port);
        if config.non_anonymous {
            warn!(
                "hidden service configured in NON-ANONYMOUS single-hop mode; \
                 it will provide no privacy"
            );
        }

        let launched = {
            let driver = match self.ensure_driver() {
                Ok(driver) => driver,
                Err(e) => {
                    listener.abort();
                    return Err(e);
                }
            };
            driver.launch(&config).await
        };
        if let Err(e) = launched {
            listener.abort();
            return Err(e);
        }

        let hostname = match read_hostname(&config.hidden_service_dir) {
            Ok(hostname) => hostname,
            Err(e) => {
                listener.abort();
                return Err(e);
            }
        };

        self.listeners.push(listener);

        let url = format!("http://{hostname}");
        info!("hidden service published at {url}");
        Ok(url)
    }

    /// Acquire the driver on first use; later calls reuse it.
    fn ensure_driver(&mut self) -> Result<&dyn OnionDriver, OnionError> {
        let driver = match &mut self.driver {
            Some(driver) => driver,
            slot => {
                let daemon = TorDaemon::acquire(self.options.tor_binary.as_deref())?;
                slot.insert(Box::new(daemon))
            }
        };
        Ok(&**driver)
    }
}
