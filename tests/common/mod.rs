//! Shared test fixtures

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use parking_lot::Mutex;

use oauth_gateway::Result;
use oauth_gateway::gateway::Forwarder;

/// One request as the upstream saw it
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
}

/// Forwarder that records requests and answers with canned bodies
#[derive(Default)]
pub struct RecordingUpstream {
    seen: Mutex<Vec<Seen>>,
    replies: Mutex<Vec<(String, String)>>,
}

impl RecordingUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer requests whose URI starts with `prefix` with `body` (JSON)
    pub fn reply(&self, prefix: &str, body: &str) {
        self.replies.lock().push((prefix.to_string(), body.to_string()));
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn last(&self) -> Option<Seen> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl Forwarder for RecordingUpstream {
    async fn forward(&self, request: Request) -> Result<Response> {
        let uri = request.uri().to_string();
        self.seen.lock().push(Seen {
            method: request.method().to_string(),
            uri: uri.clone(),
            headers: request.headers().clone(),
        });

        let body = self
            .replies
            .lock()
            .iter()
            .find(|(prefix, _)| uri.starts_with(prefix.as_str()))
            .map_or_else(|| "{}".to_string(), |(_, body)| body.clone());

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap())
    }
}
