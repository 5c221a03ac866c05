//! Token capture on the token endpoint's responses
//!
//! Successful token responses are buffered, parsed as a [`Session`] and
//! handed to the issuing server's manager. The response relayed to the
//! caller carries the same bytes, whatever the capture outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, BodyDataStream, Bytes},
    http::header,
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{StreamExt, stream};
use tracing::{debug, info, warn};

use super::Repository;
use crate::gateway::{ForwardedRequest, ResponsePlugin};
use crate::manager::ManagerFactory;
use crate::session::Session;

/// A token response body after an attempt to buffer it
enum Buffered {
    /// Read completely within the size and time limits
    Complete(Bytes),
    /// Gave up part-way; the chunks already read lead the rest of the stream
    Relay(Body),
}

/// Outbound plugin persisting tokens issued through the gateway
pub struct TokenCapture {
    repository: Arc<dyn Repository>,
    factory: ManagerFactory,
    timeout: Duration,
    max_body_size: usize,
}

impl TokenCapture {
    /// Capture into managers built by `factory` for servers in `repository`.
    /// Body reads are bounded by `timeout` and `max_body_size`.
    #[must_use]
    pub fn new(
        repository: Arc<dyn Repository>,
        factory: ManagerFactory,
        timeout: Duration,
        max_body_size: usize,
    ) -> Self {
        Self {
            repository,
            factory,
            timeout,
            max_body_size,
        }
    }

    /// Read `body` up to `max_body_size` within `timeout`. Whatever happens,
    /// the bytes of the original body are preserved for the caller.
    async fn buffer(&self, body: Body) -> Buffered {
        let mut rest = body.into_data_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut size = 0;
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            match tokio::time::timeout_at(deadline, rest.next()).await {
                Ok(Some(Ok(chunk))) => {
                    size += chunk.len();
                    chunks.push(chunk);
                    if size > self.max_body_size {
                        debug!(size, "Token response too large to capture");
                        return Buffered::Relay(resume(chunks, None, rest));
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "Failed to read token response body");
                    return Buffered::Relay(resume(chunks, Some(e), rest));
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(timeout = ?self.timeout, "Timed out reading token response body, relaying uncaptured");
                    return Buffered::Relay(resume(chunks, None, rest));
                }
            }
        }

        match chunks.len() {
            0 => Buffered::Complete(Bytes::new()),
            1 => Buffered::Complete(chunks.remove(0)),
            _ => Buffered::Complete(Bytes::from(chunks.concat())),
        }
    }

    /// Persist the token in `body`, if any. Failures are logged.
    async fn capture(&self, request: &ForwardedRequest, body: &[u8]) {
        let mut session: Session = match serde_json::from_slice(body) {
            Ok(session) => session,
            Err(e) => {
                debug!(error = %e, "Token response is not a session");
                return;
            }
        };
        if session.access_token.is_empty() {
            debug!("Token response carries no access token");
            return;
        }

        let url = token_url(&request.url);
        let server = match self.repository.find_by_token_url(url).await {
            Ok(server) => server,
            Err(e) => {
                warn!(url = %url, error = %e, "No OAuth server for token endpoint");
                return;
            }
        };

        let manager = match self.factory.build_for(&server) {
            Ok(manager) => manager,
            Err(e) => {
                warn!(server = %server.name, error = %e, "Cannot build token manager for capture");
                return;
            }
        };

        session.server_name.clone_from(&server.name);
        if session.client_id.is_empty() {
            if let Some(client_id) = client_id(request) {
                session.client_id = client_id;
            }
        }
        if session.token_type.is_empty() {
            session.token_type = "Bearer".to_string();
        }

        let token = session.access_token.clone();
        let ttl = session.expires_in;
        // detached: the caller's response does not wait on the store
        drop(manager.set(&token, &session, ttl));
        info!(server = %server.name, client = %session.client_id, ttl, "Captured access token");
    }
}

#[async_trait]
impl ResponsePlugin for TokenCapture {
    fn name(&self) -> &'static str {
        "token_capture"
    }

    async fn on_response(&self, request: &ForwardedRequest, response: Response) -> Response {
        if response.status().as_u16() >= 300 {
            return response;
        }

        let declared = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        match declared {
            Some(0) => return response,
            Some(len) if len > self.max_body_size => {
                debug!(len, "Token response too large to capture");
                return response;
            }
            _ => {}
        }

        let (parts, body) = response.into_parts();
        let bytes = match self.buffer(body).await {
            Buffered::Complete(bytes) => bytes,
            Buffered::Relay(body) => return Response::from_parts(parts, body),
        };

        if !bytes.is_empty() {
            self.capture(request, &bytes).await;
        }

        Response::from_parts(parts, Body::from(bytes))
    }
}

/// Body yielding `read`, then `error` if reading failed, then whatever is
/// left of `rest`
fn resume(read: Vec<Bytes>, error: Option<axum::Error>, rest: BodyDataStream) -> Body {
    let head = read.into_iter().map(Ok).chain(error.map(Err));
    Body::from_stream(stream::iter(head).chain(rest))
}

/// Scheme, host and path of `url`; query and fragment dropped
pub(crate) fn token_url(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Client id from the request's Basic credentials or its `client_id` query
fn client_id(request: &ForwardedRequest) -> Option<String> {
    let from_basic = request
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, encoded) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("basic").then_some(encoded)
        })
        .and_then(|encoded| STANDARD.decode(encoded).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|pair| pair.split_once(':').map(|(id, _)| id.to_string()))
        .filter(|id| !id.is_empty());

    from_basic.or_else(|| {
        let (_, query) = request.url.split_once('?')?;
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
        pairs
            .into_iter()
            .find_map(|(key, value)| (key == "client_id").then_some(value))
            .filter(|id| !id.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::Manager;
    use crate::oauth::{Endpoint, InMemoryRepository, OAuthServer};
    use crate::store::{InMemoryStore, Store};
    use axum::body::to_bytes;
    use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const TOKEN_URL: &str = "http://idp.local/oauth/token";

    fn setup() -> (TokenCapture, Arc<dyn Store>) {
        setup_with_limit(1024 * 1024)
    }

    fn setup_with_limit(max_body_size: usize) -> (TokenCapture, Arc<dyn Store>) {
        let mut server = OAuthServer::named("svc");
        server.endpoints.token = Some(Endpoint::new("/svc/token", TOKEN_URL));
        let repository = Arc::new(InMemoryRepository::with_servers([server]));
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let factory = ManagerFactory::new(Arc::clone(&store), reqwest::Client::new(), Duration::from_secs(1));
        let capture = TokenCapture::new(repository, factory, Duration::from_secs(1), max_body_size);
        (capture, store)
    }

    fn request(url: &str, authorization: Option<&str>) -> ForwardedRequest {
        let mut headers = HeaderMap::new();
        if let Some(value) = authorization {
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        ForwardedRequest {
            method: Method::POST,
            url: url.to_string(),
            headers,
        }
    }

    fn response(status: StatusCode, body: &str) -> Response {
        Response::builder()
            .status(status)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_of(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Detached writes land shortly after the response is relayed.
    async fn wait_for(store: &Arc<dyn Store>, key: &str) -> Option<Session> {
        for _ in 0..50 {
            if let Ok(raw) = store.get(key).await {
                return Session::from_json(&raw).ok();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[test]
    fn test_token_url_drops_query() {
        assert_eq!(token_url("http://idp/token?client_id=abc"), "http://idp/token");
        assert_eq!(token_url("http://idp/token#x"), "http://idp/token");
        assert_eq!(token_url("http://idp/token"), "http://idp/token");
    }

    #[test]
    fn test_client_id_sources() {
        let basic = request(TOKEN_URL, Some("Basic YWJjOnMzY3IzdA=="));
        assert_eq!(client_id(&basic), Some("abc".to_string()));

        let query = request(&format!("{TOKEN_URL}?client_id=pub"), None);
        assert_eq!(client_id(&query), Some("pub".to_string()));

        assert_eq!(client_id(&request(TOKEN_URL, None)), None);
    }

    #[tokio::test]
    async fn test_captures_issued_token() {
        let (capture, store) = setup();
        let body = json!({ "access_token": "tok1", "expires_in": 3600, "token_type": "bearer" }).to_string();

        let relayed = capture
            .on_response(
                &request(&format!("{TOKEN_URL}?client_id=abc"), None),
                response(StatusCode::OK, &body),
            )
            .await;

        assert_eq!(relayed.status(), StatusCode::OK);
        assert_eq!(body_of(relayed).await, body);

        let session = wait_for(&store, "tok1").await.unwrap();
        assert_eq!(session.server_name, "svc");
        assert_eq!(session.client_id, "abc");
        assert_eq!(session.expires_in, 3600);
    }

    #[tokio::test]
    async fn test_error_response_is_untouched() {
        let (capture, store) = setup();
        let body = json!({ "access_token": "tok1", "expires_in": 60 }).to_string();

        let relayed = capture
            .on_response(&request(TOKEN_URL, None), response(StatusCode::BAD_REQUEST, &body))
            .await;

        assert_eq!(relayed.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(relayed).await, body);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("tok1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_body_passes_through() {
        let (capture, _store) = setup();
        let relayed = capture
            .on_response(&request(TOKEN_URL, None), response(StatusCode::OK, "<html>hi</html>"))
            .await;
        assert_eq!(relayed.status(), StatusCode::OK);
        assert_eq!(body_of(relayed).await, "<html>hi</html>");
    }

    #[tokio::test]
    async fn test_unknown_token_endpoint_is_not_captured() {
        let (capture, store) = setup();
        let body = json!({ "access_token": "tok2", "expires_in": 60 }).to_string();

        let relayed = capture
            .on_response(&request("http://elsewhere/token", None), response(StatusCode::OK, &body))
            .await;

        assert_eq!(body_of(relayed).await, body);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("tok2").await.unwrap());
    }

    #[tokio::test]
    async fn test_captured_token_authorises() {
        let (capture, store) = setup();
        let body = json!({ "access_token": "tok3", "expires_in": 120 }).to_string();
        let _ = capture
            .on_response(&request(TOKEN_URL, None), response(StatusCode::OK, &body))
            .await;
        wait_for(&store, "tok3").await.unwrap();

        let manager = crate::manager::StorageManager::new(store);
        let session = manager.is_key_authorised("tok3").await.unwrap();
        assert_eq!(session.expires_in, 120);
        assert_eq!(session.token_type, "Bearer");
    }

    #[tokio::test]
    async fn test_oversized_body_without_length_is_relayed_intact() {
        let (capture, store) = setup_with_limit(16);
        let body = json!({ "access_token": "tok4", "expires_in": 60, "scope": "read write" }).to_string();
        assert!(body.len() > 16);

        let relayed = capture
            .on_response(&request(TOKEN_URL, None), response(StatusCode::OK, &body))
            .await;

        assert_eq!(relayed.status(), StatusCode::OK);
        assert_eq!(body_of(relayed).await, body);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!store.exists("tok4").await.unwrap());
    }

    #[tokio::test]
    async fn test_chunked_body_is_captured_and_relayed() {
        let (capture, store) = setup();
        let body = json!({ "access_token": "tok5", "expires_in": 60 }).to_string();
        let (head, tail) = body.split_at(10);
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from(head.to_string())), Ok(Bytes::from(tail.to_string()))];
        let streamed = Response::new(Body::from_stream(stream::iter(chunks)));

        let relayed = capture.on_response(&request(TOKEN_URL, None), streamed).await;

        assert_eq!(body_of(relayed).await, body);
        assert_eq!(wait_for(&store, "tok5").await.unwrap().expires_in, 60);
    }

    #[tokio::test]
    async fn test_oversized_stream_keeps_every_chunk() {
        let (capture, _store) = setup_with_limit(16);
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            (0..4).map(|i| Ok(Bytes::from(format!("{i}").repeat(16)))).collect();
        let streamed = Response::new(Body::from_stream(stream::iter(chunks)));

        let relayed = capture.on_response(&request(TOKEN_URL, None), streamed).await;

        assert_eq!(relayed.status(), StatusCode::OK);
        assert_eq!(
            body_of(relayed).await,
            "0000000000000000111111111111111122222222222222223333333333333333"
        );
    }

    #[tokio::test]
    async fn test_read_error_keeps_status_and_read_bytes() {
        let (capture, _store) = setup();
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"access_token\"")),
            Err(std::io::Error::other("connection reset")),
        ];
        let streamed = Response::new(Body::from_stream(stream::iter(chunks)));

        let relayed = capture.on_response(&request(TOKEN_URL, None), streamed).await;

        assert_eq!(relayed.status(), StatusCode::OK);
        let mut relayed_stream = relayed.into_body().into_data_stream();
        assert_eq!(
            relayed_stream.next().await.unwrap().unwrap(),
            Bytes::from_static(b"{\"access_token\"")
        );
        assert!(relayed_stream.next().await.unwrap().is_err());
    }
}
