//! Request path: middlewares, live route table, HTTP server

pub mod auth;
pub mod client_secret;
pub mod cors;
pub mod proxy;
pub mod rate_limit;
pub mod revoke;
mod server;

pub use auth::{AuthError, bearer_check};
pub use proxy::{
    ForwardedRequest, Forwarder, HttpForwarder, Inbound, ResponsePlugin, RouteSpec, RouteSummary,
    RouteTable,
};
pub use rate_limit::RouteRateLimiter;
pub use server::Gateway;
