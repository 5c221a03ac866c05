//! OAuth server definitions and everything loaded from them
//!
//! - [`OAuthServer`] / [`ApiDefinition`]: the definition format
//! - [`Repository`]: where definitions come from ([`InMemoryRepository`],
//!   [`FileRepository`])
//! - [`TokenCapture`]: persists tokens seen on token-endpoint responses
//! - [`Loader`]: turns definitions into registered routes
//! - [`DefinitionWatcher`]: reloads when definition files change

mod capture;
mod definition;
mod file_repository;
mod loader;
mod repository;
mod watcher;

pub use capture::TokenCapture;
pub use definition::{
    ApiDefinition, ClientEndpoints, CorsPolicy, Endpoint, EndpointRole, Endpoints, OAuthServer,
    TokenStrategy,
};
pub use file_repository::FileRepository;
pub use loader::{LoadReport, Loader};
pub use repository::{InMemoryRepository, Repository};
pub use watcher::DefinitionWatcher;
