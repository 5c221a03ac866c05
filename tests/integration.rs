//! Integration tests for the OAuth gateway

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    extract::Request,
    http::{StatusCode, header},
};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

use common::RecordingUpstream;
use oauth_gateway::config::Config;
use oauth_gateway::gateway::Gateway;
use oauth_gateway::manager::{Manager, ManagerFactory};
use oauth_gateway::oauth::{ApiDefinition, Endpoint, FileRepository, OAuthServer, Repository};
use oauth_gateway::store::{InMemoryStore, Store};

const TOKEN_URL: &str = "http://idp.local/oauth/token";

fn svc() -> OAuthServer {
    let mut server = OAuthServer::named("svc");
    server.client_secrets = HashMap::from([("abc".to_string(), "s3cr3t".to_string())]);
    server.endpoints.token = Some(Endpoint::new("/token", TOKEN_URL));
    server.endpoints.revoke = Some(Endpoint::new("/revoke", "http://idp.local/oauth/revoke"));
    server
}

fn orders() -> ApiDefinition {
    ApiDefinition {
        name: "orders".to_string(),
        listen_path: "/orders".to_string(),
        upstream_url: "http://orders.internal".to_string(),
        methods: Vec::new(),
        strip_path: true,
        oauth_server: "svc".to_string(),
    }
}

async fn gateway(config: Config) -> (Gateway, Arc<RecordingUpstream>, Arc<dyn Store>) {
    let upstream = RecordingUpstream::new();
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let gateway = Gateway::assemble(config, Arc::clone(&store), reqwest::Client::new(), upstream.clone())
        .await
        .unwrap();
    gateway.reload().await.unwrap();
    (gateway, upstream, store)
}

/// Poll until `check` holds; background writes land after the response
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_token_capture_and_revocation_end_to_end() {
    let config = Config {
        servers: vec![svc()],
        ..Config::default()
    };
    let (gateway, upstream, store) = gateway(config).await;
    upstream.reply(TOKEN_URL, r#"{"access_token":"tok1","expires_in":3600}"#);
    let manager = ManagerFactory::new(store, reqwest::Client::new(), Duration::from_secs(1))
        .build_for(&svc())
        .unwrap();

    // Token request from a public client
    let response = gateway
        .routes()
        .dispatch(Request::get("/token?client_id=abc").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], br#"{"access_token":"tok1","expires_in":3600}"#);

    let seen = upstream.last().unwrap();
    assert_eq!(seen.headers[header::AUTHORIZATION], "Basic YWJjOnMzY3IzdA==");

    // The issued token is now known
    let manager = &manager;
    assert!(eventually(|| async move { manager.is_key_authorised("tok1").await.is_some() }).await);
    let session = manager.is_key_authorised("tok1").await.unwrap();
    assert_eq!(session.expires_in, 3600);
    assert_eq!(session.client_id, "abc");
    assert_eq!(session.server_name, "svc");

    // Revocation without Authorization forgets it
    let response = gateway
        .routes()
        .dispatch(
            Request::post("/revoke")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("access_token=tok1"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(upstream.last().unwrap().uri, "http://idp.local/oauth/revoke");

    assert!(eventually(|| async move { manager.is_key_authorised("tok1").await.is_none() }).await);
}

#[tokio::test]
async fn test_revocation_with_authorization_keeps_the_session() {
    let config = Config {
        servers: vec![svc()],
        ..Config::default()
    };
    let (gateway, upstream, store) = gateway(config).await;
    upstream.reply(TOKEN_URL, r#"{"access_token":"tok2","expires_in":60}"#);
    let manager = ManagerFactory::new(store, reqwest::Client::new(), Duration::from_secs(1))
        .build_for(&svc())
        .unwrap();

    gateway
        .routes()
        .dispatch(Request::post("/token").body(Body::empty()).unwrap())
        .await;
    let manager = &manager;
    assert!(eventually(|| async move { manager.is_key_authorised("tok2").await.is_some() }).await);

    gateway
        .routes()
        .dispatch(
            Request::post("/revoke")
                .header(header::AUTHORIZATION, "Basic YWJjOnMzY3IzdA==")
                .body(Body::from("access_token=tok2"))
                .unwrap(),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(manager.is_key_authorised("tok2").await.is_some());
}

fn get_orders() -> Request {
    Request::get("/orders/7")
        .header(header::AUTHORIZATION, "Bearer tok3")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_captured_token_opens_protected_api() {
    let config = Config {
        servers: vec![svc()],
        apis: vec![orders()],
        ..Config::default()
    };
    let (gateway, upstream, _store) = gateway(config).await;
    upstream.reply(TOKEN_URL, r#"{"access_token":"tok3","expires_in":60}"#);

    assert_eq!(
        gateway.routes().dispatch(get_orders()).await.status(),
        StatusCode::UNAUTHORIZED
    );

    gateway
        .routes()
        .dispatch(Request::get("/token?client_id=abc").body(Body::empty()).unwrap())
        .await;

    let routes = gateway.routes();
    let opened = eventually(|| async move {
        routes.dispatch(get_orders()).await.status() == StatusCode::OK
    })
    .await;
    assert!(opened);
    assert_eq!(upstream.last().unwrap().uri, "http://orders.internal/7");
}

#[tokio::test]
async fn test_reload_twice_registers_the_same_routes() {
    let config = Config {
        servers: vec![svc()],
        apis: vec![orders()],
        ..Config::default()
    };
    let (gateway, _upstream, _store) = gateway(config).await;

    let once = gateway.routes().routes();
    let report = gateway.reload().await.unwrap();
    let twice = gateway.routes().routes();

    assert_eq!(once, twice);
    assert_eq!(report.routes, 3);
    assert_eq!(report.removed, 0);
}

#[tokio::test]
async fn test_unknown_path_and_method() {
    let mut server = svc();
    if let Some(token) = server.endpoints.token.as_mut() {
        token.methods = vec!["post".to_string()];
    }
    let config = Config {
        servers: vec![server],
        ..Config::default()
    };
    let (gateway, upstream, _store) = gateway(config).await;

    let missing = gateway
        .routes()
        .dispatch(Request::get("/nowhere").body(Body::empty()).unwrap())
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let wrong_method = gateway
        .routes()
        .dispatch(Request::get("/token").body(Body::empty()).unwrap())
        .await;
    assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(upstream.seen().is_empty());
}

#[tokio::test]
async fn test_health_endpoint() {
    let config = Config {
        servers: vec![svc()],
        ..Config::default()
    };
    let (gateway, _upstream, _store) = gateway(config).await;

    let response = gateway
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["routes"], 2);
}

#[tokio::test]
async fn test_definitions_directory_drives_routes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("svc.yaml"),
        "name: svc\nendpoints:\n  token:\n    listen_path: /svc/token\n    upstream_url: http://idp.local/oauth/token\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.repository.directory = Some(dir.path().to_path_buf());
    let (gateway, _upstream, _store) = gateway(config).await;
    assert_eq!(gateway.routes().len(), 1);

    // A definition added through the repository is written to disk and
    // picked up by the next cycle
    let repository = FileRepository::open(dir.path(), Vec::new()).await.unwrap();
    let mut other = OAuthServer::named("other");
    other.endpoints.token = Some(Endpoint::new("/other/token", "http://other.local/token"));
    repository.add(other).await.unwrap();
    assert!(dir.path().join("other.json").exists());

    let files = FileRepository::open(dir.path(), Vec::new()).await.unwrap();
    assert_eq!(files.find_all().await.unwrap().len(), 2);
}
