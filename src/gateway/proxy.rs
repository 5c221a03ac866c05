//! Live route table and upstream forwarding
//!
//! Every registered route is compiled into its own axum [`Router`]: a
//! forwarding fallback wrapped by the route's inbound middlewares, with the
//! outbound plugins run on the upstream response. The [`RouteTable`] owns
//! the compiled routes and dispatches requests by longest listen-path prefix.
//!
//! Registration overwrites the binding at a listen path, so a reload that
//! registers the same path again swaps the middleware chain (and the manager
//! bound in it) without duplicating the route.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    middleware,
    response::Response,
};
use parking_lot::RwLock;
use serde::Serialize;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::auth::{bearer_check, error_response};
use super::client_secret::{ClientSecrets, inject_client_secret};
use super::cors::cors_layer;
use super::rate_limit::{RouteBudget, RouteRateLimiter, rate_limit};
use super::revoke::revoke_token;
use crate::manager::Manager;
use crate::oauth::{CorsPolicy, Endpoint};
use crate::{Error, Result};

/// Sends a request (already rewritten to its absolute upstream URI) upstream
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Forward `request` and return the upstream response
    async fn forward(&self, request: Request) -> Result<Response>;
}

/// What an outbound plugin knows about the request that produced a response
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    /// Request method
    pub method: Method,
    /// Absolute upstream URL, query included
    pub url: String,
    /// Headers as sent upstream
    pub headers: HeaderMap,
}

/// Runs on an upstream response before it is relayed to the caller
#[async_trait]
pub trait ResponsePlugin: Send + Sync + 'static {
    /// Name shown in route listings
    fn name(&self) -> &'static str;

    /// Inspect or replace `response`. Must hand back a usable response
    /// whatever happens inside.
    async fn on_response(&self, request: &ForwardedRequest, response: Response) -> Response;
}

/// Inbound middleware attached to a route
#[derive(Clone)]
pub enum Inbound {
    /// Cross-origin handling
    Cors(CorsPolicy),
    /// Basic-auth injection for public clients
    ClientSecret(ClientSecrets),
    /// Token removal after the revocation endpoint
    Revoke(Arc<dyn Manager>),
    /// Bearer-token validation
    BearerCheck(Arc<dyn Manager>),
    /// Per-caller request budget, counted per listen path
    RateLimit(Arc<RouteRateLimiter>),
}

impl Inbound {
    /// Name shown in route listings
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cors(_) => "cors",
            Self::ClientSecret(_) => "client_secret",
            Self::Revoke(_) => "revoke",
            Self::BearerCheck(_) => "bearer_check",
            Self::RateLimit(_) => "rate_limit",
        }
    }

    fn wrap(&self, router: Router, listen_path: &str) -> Router {
        match self {
            Self::Cors(policy) if policy.enabled => router.layer(cors_layer(policy)),
            Self::Cors(_) => router,
            Self::ClientSecret(secrets) => router.layer(middleware::from_fn_with_state(
                Arc::clone(secrets),
                inject_client_secret,
            )),
            Self::Revoke(manager) => {
                router.layer(middleware::from_fn_with_state(Arc::clone(manager), revoke_token))
            }
            Self::BearerCheck(manager) => {
                router.layer(middleware::from_fn_with_state(Arc::clone(manager), bearer_check))
            }
            Self::RateLimit(limiter) => router.layer(middleware::from_fn_with_state(
                RouteBudget::new(Arc::clone(limiter), listen_path),
                rate_limit,
            )),
        }
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A route to register: where it listens, where it forwards, and what runs
/// around the forward
#[derive(Clone)]
pub struct RouteSpec {
    /// Owning OAuth server or API name
    pub owner: String,
    /// Listen path, upstream and method filter
    pub endpoint: Endpoint,
    /// Inbound middlewares, first = outermost
    pub inbound: Vec<Inbound>,
    /// Outbound plugins, run in order
    pub outbound: Vec<Arc<dyn ResponsePlugin>>,
}

impl RouteSpec {
    /// Route for `endpoint` with no middleware
    #[must_use]
    pub fn new(owner: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            owner: owner.into(),
            endpoint,
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Append an inbound middleware
    #[must_use]
    pub fn inbound(mut self, inbound: Inbound) -> Self {
        self.inbound.push(inbound);
        self
    }

    /// Append an outbound plugin
    #[must_use]
    pub fn outbound(mut self, plugin: Arc<dyn ResponsePlugin>) -> Self {
        self.outbound.push(plugin);
        self
    }

    /// Comparable description of this route
    #[must_use]
    pub fn summary(&self) -> RouteSummary {
        RouteSummary {
            listen_path: self.endpoint.listen_path.clone(),
            upstream_url: self.endpoint.upstream_url.clone(),
            methods: self.endpoint.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            owner: self.owner.clone(),
            inbound: self.inbound.iter().map(Inbound::name).collect(),
            outbound: self.outbound.iter().map(|p| p.name()).collect(),
        }
    }
}

/// Snapshot of a registered route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteSummary {
    /// Listen path
    pub listen_path: String,
    /// Upstream URL
    pub upstream_url: String,
    /// Allowed methods, upper-case (empty = any)
    pub methods: Vec<String>,
    /// Owning server or API
    pub owner: String,
    /// Inbound middleware names, outermost first
    pub inbound: Vec<&'static str>,
    /// Outbound plugin names
    pub outbound: Vec<&'static str>,
}

impl fmt::Display for RouteSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods = if self.methods.is_empty() {
            "*".to_string()
        } else {
            self.methods.join(",")
        };
        write!(
            f,
            "{:<32} {:<12} -> {} [{}] in=[{}] out=[{}]",
            self.listen_path,
            methods,
            self.upstream_url,
            self.owner,
            self.inbound.join(","),
            self.outbound.join(",")
        )
    }
}

struct CompiledRoute {
    summary: RouteSummary,
    router: Router,
    /// Preflight requests reach the CORS layer regardless of the method filter
    preflight: bool,
}

impl CompiledRoute {
    fn allows(&self, method: &Method) -> bool {
        self.summary.methods.is_empty()
            || (self.preflight && method == Method::OPTIONS)
            || self.summary.methods.iter().any(|m| m == method.as_str())
    }
}

/// State of a route's forwarding fallback
struct Target {
    endpoint: Endpoint,
    forwarder: Arc<dyn Forwarder>,
    outbound: Vec<Arc<dyn ResponsePlugin>>,
}

impl Target {
    /// Absolute upstream URL for an inbound `path` and `query`
    fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let listen = self.endpoint.listen_path.trim_end_matches('/');
        let suffix = if self.endpoint.strip_path {
            path.strip_prefix(listen).unwrap_or(path)
        } else {
            path
        };

        let base = self.endpoint.upstream_url.as_str();
        let mut url = if suffix.is_empty() {
            base.to_string()
        } else {
            format!(
                "{}/{}",
                base.trim_end_matches('/'),
                suffix.trim_start_matches('/')
            )
        };
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

async fn forward(State(target): State<Arc<Target>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    let url = target.upstream_url(parts.uri.path(), parts.uri.query());

    parts.uri = match url.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(url = %url, error = %e, "Invalid upstream URL");
            return error_response(StatusCode::BAD_GATEWAY, "bad_gateway", "invalid upstream URL");
        }
    };
    parts.headers.remove(header::HOST);

    let forwarded = ForwardedRequest {
        method: parts.method.clone(),
        url,
        headers: parts.headers.clone(),
    };

    let mut response = match target.forwarder.forward(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %forwarded.url, error = %e, "Upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "bad_gateway", "upstream request failed");
        }
    };

    for plugin in &target.outbound {
        response = plugin.on_response(&forwarded, response).await;
    }
    response
}

fn compile(spec: &RouteSpec, forwarder: Arc<dyn Forwarder>) -> Router {
    let target = Arc::new(Target {
        endpoint: spec.endpoint.clone(),
        forwarder,
        outbound: spec.outbound.clone(),
    });

    let mut router = Router::new().fallback(forward).with_state(target);
    for inbound in spec.inbound.iter().rev() {
        router = inbound.wrap(router, &spec.endpoint.listen_path);
    }
    router
}

/// Whether `path` falls under `listen_path` on a segment boundary
fn path_matches(path: &str, listen_path: &str) -> bool {
    if listen_path.ends_with('/') {
        return path.starts_with(listen_path) || path == listen_path.trim_end_matches('/');
    }
    path.strip_prefix(listen_path)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

/// The gateway's registered routes
pub struct RouteTable {
    forwarder: Arc<dyn Forwarder>,
    routes: RwLock<HashMap<String, Arc<CompiledRoute>>>,
}

impl RouteTable {
    /// Empty table forwarding through `forwarder`
    #[must_use]
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            forwarder,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register `spec`, replacing any binding at its listen path.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the listen path is empty or contains whitespace.
    pub fn register(&self, spec: &RouteSpec) -> Result<()> {
        if !spec.endpoint.is_valid() {
            return Err(Error::Config(format!(
                "invalid listen path {:?}",
                spec.endpoint.listen_path
            )));
        }

        let summary = spec.summary();
        let route = Arc::new(CompiledRoute {
            router: compile(spec, Arc::clone(&self.forwarder)),
            summary: summary.clone(),
            preflight: spec
                .inbound
                .iter()
                .any(|i| matches!(i, Inbound::Cors(policy) if policy.enabled)),
        });

        let replaced = self
            .routes
            .write()
            .insert(summary.listen_path.clone(), route)
            .is_some();
        debug!(path = %summary.listen_path, owner = %summary.owner, replaced, "Route registered");
        Ok(())
    }

    /// Remove the route at `listen_path`; `true` when one existed
    pub fn deregister(&self, listen_path: &str) -> bool {
        let removed = self.routes.write().remove(listen_path).is_some();
        if removed {
            info!(path = %listen_path, "Route removed");
        }
        removed
    }

    /// Registered routes ordered by listen path
    #[must_use]
    pub fn routes(&self) -> Vec<RouteSummary> {
        let mut routes: Vec<_> = self
            .routes
            .read()
            .values()
            .map(|r| r.summary.clone())
            .collect();
        routes.sort_by(|a, b| a.listen_path.cmp(&b.listen_path));
        routes
    }

    /// Number of registered routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// No routes registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    fn resolve(&self, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .read()
            .iter()
            .filter(|(listen_path, _)| path_matches(path, listen_path))
            .max_by_key(|(listen_path, _)| listen_path.len())
            .map(|(_, route)| Arc::clone(route))
    }

    /// Route `request` to the longest matching listen path
    pub async fn dispatch(&self, request: Request) -> Response {
        let Some(route) = self.resolve(request.uri().path()) else {
            debug!(path = %request.uri().path(), "No route");
            return error_response(StatusCode::NOT_FOUND, "not_found", "no route for path");
        };

        if !route.allows(request.method()) {
            return error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                "method not allowed on this route",
            );
        }

        // the router is cheap to clone; the lock is not held across the call
        match route.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

/// Axum handler dispatching through a shared [`RouteTable`]
pub async fn dispatch(State(table): State<Arc<RouteTable>>, request: Request) -> Response {
    table.dispatch(request).await
}

/// Hop-by-hop headers that never cross the proxy
const HOP_BY_HOP: [header::HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Forwarder over a shared `reqwest` client.
///
/// Request bodies are buffered (up to `max_body_size`) before sending;
/// response bodies are streamed back.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    max_body_size: usize,
}

impl HttpForwarder {
    /// Forward with `client`
    #[must_use]
    pub fn new(client: reqwest::Client, max_body_size: usize) -> Self {
        Self {
            client,
            max_body_size,
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: Request) -> Result<Response> {
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }

        let body = to_bytes(body, self.max_body_size)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read request body: {e}")))?;

        let upstream = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let mut builder = Response::builder().status(upstream.status());
        if let Some(out) = builder.headers_mut() {
            for (name, value) in upstream.headers() {
                if !HOP_BY_HOP.contains(name) {
                    out.append(name.clone(), value.clone());
                }
            }
        }

        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| Error::Internal(format!("Failed to build upstream response: {e}")))
    }
}
