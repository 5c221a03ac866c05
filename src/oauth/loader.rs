//! Route (re)registration from the repository
//!
//! One load cycle reads every OAuth server, builds its manager, and
//! registers its endpoints and protected APIs in the [`RouteTable`] with the
//! middleware chain of each endpoint's role. Cycles are serialized; paths
//! registered by the previous cycle and absent from this one are removed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ApiDefinition, EndpointRole, OAuthServer, Repository, TokenCapture};
use crate::Result;
use crate::gateway::{Inbound, ResponsePlugin, RouteSpec, RouteTable, RouteRateLimiter};
use crate::manager::{Manager, ManagerFactory};

/// Outcome of one load cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Servers whose manager was built
    pub servers: usize,
    /// Servers skipped for invalid strategy settings
    pub skipped_servers: usize,
    /// Routes registered this cycle
    pub routes: usize,
    /// Endpoints and APIs skipped
    pub skipped_routes: usize,
    /// Stale routes removed
    pub removed: usize,
}

/// Builds and registers routes for every OAuth server in a repository
pub struct Loader {
    repository: Arc<dyn Repository>,
    factory: ManagerFactory,
    routes: Arc<RouteTable>,
    capture: Arc<TokenCapture>,
    apis: Vec<ApiDefinition>,
    rate_limiter: Option<Arc<RouteRateLimiter>>,
    /// Paths registered by the last cycle; the lock serializes cycles
    registered: Mutex<BTreeSet<String>>,
}

impl Loader {
    /// Loader registering into `routes`
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        factory: ManagerFactory,
        routes: Arc<RouteTable>,
        capture: Arc<TokenCapture>,
    ) -> Self {
        Self {
            repository,
            factory,
            routes,
            capture,
            apis: Vec::new(),
            rate_limiter: None,
            registered: Mutex::new(BTreeSet::new()),
        }
    }

    /// Also register `apis`, protected by their server's manager
    #[must_use]
    pub fn with_apis(mut self, apis: Vec<ApiDefinition>) -> Self {
        self.apis = apis;
        self
    }

    /// Put `limiter` in front of every protected API
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RouteRateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    /// Route table this loader registers into
    #[must_use]
    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Run one load cycle.
    ///
    /// # Errors
    ///
    /// Only a failing repository aborts the cycle (leaving the previous
    /// routes in place); bad servers and endpoints are skipped.
    pub async fn reload(&self) -> Result<LoadReport> {
        let mut registered = self.registered.lock().await;
        let servers = self.repository.find_all().await?;

        let mut report = LoadReport::default();
        let mut managers: HashMap<String, Arc<dyn Manager>> = HashMap::new();
        let mut specs = Vec::new();

        for server in &servers {
            let manager = match self.factory.build_for(server) {
                Ok(manager) => manager,
                Err(e) => {
                    warn!(server = %server.name, error = %e, "Skipping OAuth server");
                    report.skipped_servers += 1;
                    continue;
                }
            };
            report.servers += 1;
            specs.extend(self.server_routes(server, &manager, &mut report));
            managers.insert(server.name.clone(), manager);
        }

        for api in &self.apis {
            let Some(manager) = managers.get(&api.oauth_server) else {
                warn!(api = %api.name, server = %api.oauth_server, "Skipping API, OAuth server not loaded");
                report.skipped_routes += 1;
                continue;
            };
            let endpoint = api.endpoint();
            if !endpoint.is_valid() {
                warn!(api = %api.name, path = %endpoint.listen_path, "Skipping API with invalid listen path");
                report.skipped_routes += 1;
                continue;
            }
            // budgets are counted per authenticated caller, so the limiter
            // sits behind the bearer check
            let mut spec =
                RouteSpec::new(&api.name, endpoint).inbound(Inbound::BearerCheck(Arc::clone(manager)));
            if let Some(limiter) = &self.rate_limiter {
                spec = spec.inbound(Inbound::RateLimit(Arc::clone(limiter)));
            }
            specs.push(spec);
        }

        let mut current = BTreeSet::new();
        for spec in &specs {
            let path = &spec.endpoint.listen_path;
            if !current.insert(path.clone()) {
                warn!(path = %path, owner = %spec.owner, "Listen path registered twice, last one wins");
            }
            match self.routes.register(spec) {
                Ok(()) => report.routes += 1,
                Err(e) => {
                    warn!(path = %path, error = %e, "Route registration failed");
                    report.skipped_routes += 1;
                }
            }
        }

        for stale in registered.difference(&current) {
            if self.routes.deregister(stale) {
                report.removed += 1;
            }
        }
        *registered = current;

        info!(
            servers = report.servers,
            skipped_servers = report.skipped_servers,
            routes = report.routes,
            skipped_routes = report.skipped_routes,
            removed = report.removed,
            "OAuth routes loaded"
        );
        Ok(report)
    }

    fn server_routes(
        &self,
        server: &OAuthServer,
        manager: &Arc<dyn Manager>,
        report: &mut LoadReport,
    ) -> Vec<RouteSpec> {
        let mut specs = Vec::new();
        for (role, endpoint) in server.roles() {
            if !endpoint.is_valid() {
                warn!(server = %server.name, role = %role, path = %endpoint.listen_path, "Skipping invalid endpoint");
                report.skipped_routes += 1;
                continue;
            }

            let cors = Inbound::Cors(server.cors.clone());
            let spec = RouteSpec::new(&server.name, endpoint.clone()).inbound(cors);
            let spec = match role {
                EndpointRole::Authorize
                | EndpointRole::Info
                | EndpointRole::CreateClient
                | EndpointRole::RemoveClient => spec,
                EndpointRole::Token => spec
                    .inbound(Inbound::ClientSecret(Arc::new(server.client_secrets.clone())))
                    .outbound(Arc::clone(&self.capture) as Arc<dyn ResponsePlugin>),
                EndpointRole::Revoke => spec.inbound(Inbound::Revoke(Arc::clone(manager))),
            };
            debug!(server = %server.name, role = %role, path = %endpoint.listen_path, "Endpoint route prepared");
            specs.push(spec);
        }
        specs
    }
}
