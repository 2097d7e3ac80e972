//! Demo HTTP server with one route per strategy.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::extractor::{HeaderKeyExtractor, KeyExtractor};
use super::middleware::{admission_middleware, AdmissionLayer};
use crate::config::TurnstileConfig;
use crate::error::Result;
use crate::ratelimit::{build_strategy, Clock, StrategyKind};
use crate::store::CounterStore;

/// Path of the route limited by `kind`.
pub fn route_path(kind: StrategyKind) -> String {
    format!("/{}", kind.as_str().replace('_', "-"))
}

/// Build the demo router: `/health` plus one limited route per strategy.
pub fn router(store: Arc<dyn CounterStore>, clock: Clock, config: &TurnstileConfig) -> Router {
    let extractor: Arc<dyn KeyExtractor> =
        Arc::new(HeaderKeyExtractor::new(config.limits.client_headers.clone()));
    let bucket = config.token_bucket.settings();

    let mut app = Router::new().route("/health", get(health));

    for kind in StrategyKind::ALL {
        let strategy = build_strategy(kind, store.clone(), clock.clone(), &bucket);
        let layer = AdmissionLayer::new(
            strategy,
            extractor.clone(),
            config.limits.max_requests,
            config.limits.window(),
        )
        .with_check_timeout(config.server.check_timeout())
        .with_key_prefix(kind.as_str());

        app = app.route(
            &route_path(kind),
            get(hello).layer(middleware::from_fn_with_state(layer, admission_middleware)),
        );
    }

    app
}

async fn hello() -> &'static str {
    "Hello, World!"
}

async fn health() -> &'static str {
    "ok"
}

/// HTTP server for the demo routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Routes to serve
    router: Router,
}

impl HttpServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}
