use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile::config::{LoggingConfig, StoreBackend, TurnstileConfig};
use turnstile::http::{router, HttpServer};
use turnstile::ratelimit::system_clock;
use turnstile::store::{CounterStore, MemoryStore, RedisStore};

/// How often the in-process store drops expired keys.
const PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// Rate limited demo server backed by a shared counter store.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "TURNSTILE_CONFIG")]
    config: Option<String>,

    /// HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Redis connection URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Keep counters in process instead of Redis
    #[arg(long)]
    memory: bool,

    /// Log filter directive, e.g. `debug` or `turnstile=trace`
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut TurnstileConfig) {
        if let Some(listen) = self.listen {
            config.server.http_addr = listen;
        }
        if let Some(url) = self.redis_url {
            config.redis.url = url;
        }
        if self.memory {
            config.store = StoreBackend::Memory;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging);

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.store,
        max_requests = config.limits.max_requests,
        window_secs = config.limits.window_secs,
        "Configuration loaded"
    );

    let clock = system_clock();
    let store: Arc<dyn CounterStore> = match config.store {
        StoreBackend::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
        StoreBackend::Memory => {
            warn!("Using in-process store; limits are not shared between instances");
            let memory = Arc::new(MemoryStore::new(clock.clone()));
            let sweeper = memory.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(PURGE_INTERVAL);
                loop {
                    tick.tick().await;
                    sweeper.purge_expired();
                }
            });
            memory as Arc<dyn CounterStore>
        }
    };

    let app = router(store, clock, &config);
    HttpServer::new(config.server.http_addr, app)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
