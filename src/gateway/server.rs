//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::proxy::{Forwarder, HttpForwarder, RouteTable, dispatch};
use super::rate_limit::RouteRateLimiter;
use crate::config::Config;
use crate::manager::{ManagerFactory, WriteFailure};
use crate::oauth::{
    DefinitionWatcher, FileRepository, InMemoryRepository, LoadReport, Loader, Repository,
    TokenCapture,
};
use crate::store::{self, InMemoryStore, Store};
use crate::{Error, Result};

/// OAuth gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Live routes
    routes: Arc<RouteTable>,
    /// Route loader
    loader: Arc<Loader>,
    /// Set when definitions come from a directory
    files: Option<Arc<FileRepository>>,
    /// Failed background token writes
    failures: Option<mpsc::Receiver<WriteFailure>>,
    /// Token store, swept for expired entries
    store: Arc<dyn Store>,
    /// Shared API rate limiter, when enabled
    limiter: Option<Arc<RouteRateLimiter>>,
}

/// How often stale rate-limit buckets and expired store entries are dropped
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

impl Gateway {
    /// Create a new gateway connected to the configured store
    pub async fn new(config: Config) -> Result<Self> {
        let store = store::connect(
            &config.storage.dsn,
            config.storage.pool_size,
            config.storage.timeout,
        )
        .await?;
        let http = reqwest::Client::builder()
            .timeout(config.server.request_timeout)
            .build()?;
        let forwarder = Arc::new(HttpForwarder::new(http.clone(), config.server.max_body_size));
        Self::assemble(config, store, http, forwarder).await
    }

    /// Create a gateway over an explicit store and forwarder, without
    /// loading any routes yet
    pub async fn assemble(
        config: Config,
        store: Arc<dyn Store>,
        http: reqwest::Client,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self> {
        let (failure_tx, failure_rx) = mpsc::channel(config.oauth.write_failure_buffer.max(1));
        let factory = ManagerFactory::new(Arc::clone(&store), http, config.oauth.introspection_timeout)
            .with_failure_sink(failure_tx);

        let files = match &config.repository.directory {
            Some(dir) => Some(Arc::new(
                FileRepository::open(dir, config.servers.clone()).await?,
            )),
            None => None,
        };
        let repository: Arc<dyn Repository> = match &files {
            Some(files) => Arc::clone(files) as Arc<dyn Repository>,
            None => Arc::new(InMemoryRepository::with_servers(config.servers.clone())) as Arc<dyn Repository>,
        };

        let capture = Arc::new(TokenCapture::new(
            Arc::clone(&repository),
            factory.clone(),
            config.oauth.capture_timeout,
            config.server.max_body_size,
        ));
        let routes = Arc::new(RouteTable::new(forwarder));
        let limiter = RouteRateLimiter::from_config(&config.rate_limit, &store);
        let loader = Loader::new(repository, factory, Arc::clone(&routes), capture)
            .with_apis(config.apis.clone())
            .with_rate_limiter(limiter.clone());

        Ok(Self {
            config,
            routes,
            loader: Arc::new(loader),
            files,
            failures: Some(failure_rx),
            store,
            limiter,
        })
    }

    /// Build against an in-memory store, touching no network; used by
    /// `check` to validate configuration and definitions
    pub async fn offline(config: Config) -> Result<Self> {
        let http = reqwest::Client::new();
        let forwarder = Arc::new(HttpForwarder::new(http.clone(), config.server.max_body_size));
        Self::assemble(config, Arc::new(InMemoryStore::new()), http, forwarder).await
    }

    /// Run one load cycle
    pub async fn reload(&self) -> Result<LoadReport> {
        self.loader.reload().await
    }

    /// Live route table
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Receiver of failed background token writes; `None` once taken
    pub fn take_write_failures(&mut self) -> Option<mpsc::Receiver<WriteFailure>> {
        self.failures.take()
    }

    /// HTTP application: `/health` plus the dynamic route table
    pub fn router(&self) -> Router {
        let table = Arc::clone(&self.routes);

        #[allow(deprecated)]
        let timeout = TimeoutLayer::new(self.config.server.request_timeout);

        Router::new()
            .route("/health", get(health_handler))
            .fallback(dispatch)
            .with_state(table)
            .layer(DefaultBodyLimit::max(self.config.server.max_body_size))
            .layer(timeout)
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
    }

    /// Run the gateway
    pub async fn run(mut self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        let report = self.reload().await?;
        if report.routes == 0 {
            warn!("No routes registered; every request will be answered with 404");
        }

        let _watcher = match &self.files {
            Some(files) => match DefinitionWatcher::start(
                Arc::clone(files),
                Arc::clone(&self.loader),
                self.config.repository.watch,
                self.config.repository.poll_interval,
                shutdown_tx.subscribe(),
            ) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(error = %e, "Failed to start definition watcher, hot-reload disabled");
                    None
                }
            },
            None => None,
        };

        if let Some(failures) = self.take_write_failures() {
            spawn_failure_drain(failures, shutdown_tx.subscribe());
        }
        let _pruning = spawn_pruning(
            Arc::clone(&self.store),
            self.limiter.clone(),
            PRUNE_INTERVAL,
            shutdown_tx.subscribe(),
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("OAUTH GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(dsn = %store_kind(&self.config.storage.dsn), "Token store");
        for route in self.routes.routes() {
            info!("  {route}");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Gateway stopped");
        Ok(())
    }
}

/// DSN scheme only; never log credentials
fn store_kind(dsn: &str) -> &str {
    dsn.split("://").next().unwrap_or("unknown")
}

/// Count failed background writes until shutdown. Each failure is already
/// logged where it happened.
fn spawn_failure_drain(mut failures: mpsc::Receiver<WriteFailure>, mut shutdown_rx: broadcast::Receiver<()>) {
    tokio::spawn(async move {
        let mut count: u64 = 0;
        loop {
            tokio::select! {
                Some(failure) = failures.recv() => {
                    count += 1;
                    tracing::debug!(op = %failure.op, error = %failure.error, total = count, "Token write failure recorded");
                }
                _ = shutdown_rx.recv() => {
                    if count > 0 {
                        warn!(total = count, "Token writes failed during this run");
                    }
                    break;
                }
            }
        }
    });
}

/// Periodically drop refilled rate-limit buckets and expired store entries
/// until shutdown
fn spawn_pruning(
    store: Arc<dyn Store>,
    limiter: Option<Arc<RouteRateLimiter>>,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(limiter) = &limiter {
                        limiter.retain_recent();
                    }
                    match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => tracing::debug!(purged, "Dropped expired store entries"),
                        Err(e) => warn!(error = %e, "Store sweep failed"),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

async fn health_handler(State(table): State<Arc<RouteTable>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": table.len()
    }))
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
