//! HTTP client abstraction for the polling transport.
//!
//! The actual HTTP stack is supplied by the host through [`HttpClient`], so
//! the transport works with any client library and is testable without a
//! network.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;

/// A decoded HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// JSON body (`Null` when empty).
    pub body: Value,
}

impl HttpResponse {
    /// A 200 response with `body`.
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    /// A response with `status` and an empty body.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Value::Null,
        }
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// `Err` means the request never produced a response (DNS, connect,
/// timeout). Non-2xx responses are returned as `Ok` and judged by the
/// caller.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request with a bearer token.
    async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse, String>;

    /// Sends a JSON POST request with a bearer token.
    async fn post(&self, url: &str, bearer: &str, body: Value) -> Result<HttpResponse, String>;
}

/// A request seen by [`ScriptedHttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// `"GET"` or `"POST"`.
    pub method: &'static str,
    /// Full URL including query.
    pub url: String,
    /// Bearer token.
    pub bearer: String,
    /// POST body.
    pub body: Option<Value>,
}

/// An HTTP client answering from scripted responses.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    gets: Mutex<VecDeque<Result<HttpResponse, String>>>,
    posts: Mutex<VecDeque<Result<HttpResponse, String>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedHttpClient {
    /// Creates a client with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next GET answer.
    pub fn push_get(&self, response: Result<HttpResponse, String>) {
        self.gets.lock().push_back(response);
    }

    /// Scripts the next POST answer.
    pub fn push_post(&self, response: Result<HttpResponse, String>) {
        self.posts.lock().push_back(response);
    }

    /// Returns every request received.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of POST requests received.
    pub fn post_count(&self) -> usize {
        self.requests.lock().iter().filter(|r| r.method == "POST").count()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse, String> {
        self.requests.lock().push(RecordedRequest {
            method: "GET",
            url: url.to_string(),
            bearer: bearer.to_string(),
            body: None,
        });
        self.gets
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err("no scripted GET response".into()))
    }

    async fn post(&self, url: &str, bearer: &str, body: Value) -> Result<HttpResponse, String> {
        self.requests.lock().push(RecordedRequest {
            method: "POST",
            url: url.to_string(),
            bearer: bearer.to_string(),
            body: Some(body),
        });
        self.posts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err("no scripted POST response".into()))
    }
}
