use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::{EngineError, HttpError};
use crate::tags::TagSet;

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    /// Disable keep-alive pooling so every request opens a new connection.
    pub no_connection_reuse: bool,
    /// Max requests in flight for one `batch` call.
    pub batch: usize,
    /// Max requests in flight per host for one `batch` call.
    pub batch_per_host: usize,
    pub timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: concat!("scenario-stress/", env!("CARGO_PKG_VERSION")).to_string(),
            no_connection_reuse: false,
            batch: 20,
            batch_per_host: 6,
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Extra tags for the samples this request produces (`name` among them).
    pub tags: TagSet,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            tags: TagSet::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        self.tag("name", name)
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn approx_size(&self) -> usize {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
        self.method.as_str().len()
            + self.url.len()
            + headers
            + self.body.as_ref().map_or(0, Vec::len)
    }

    fn host(&self) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// 0 when the request failed before a response was received.
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn failed(err: &HttpError, elapsed: Duration) -> Self {
        Self {
            status: 0,
            elapsed,
            error: Some(err.to_string()),
            ..Self::default()
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Default expected-status policy: 2xx and 3xx.
    pub fn is_expected(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn approx_size(&self) -> usize {
        let headers: usize = self.headers.iter().map(|(k, v)| k.len() + v.len() + 4).sum();
        headers + self.body.len()
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(options: &HttpOptions) -> Result<Self, EngineError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .timeout(options.timeout);
        if options.no_connection_reuse {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let start = Instant::now();
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.bytes().await?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
            elapsed: start.elapsed(),
            error: None,
        })
    }
}

pub async fn execute(client: &dyn HttpClient, request: &HttpRequest) -> HttpResponse {
    let start = Instant::now();
    match client.send(request).await {
        Ok(response) => response,
        Err(err) => HttpResponse::failed(&err, start.elapsed()),
    }
}

/// Sends all `requests` with at most `batch` in flight overall and
/// `per_host` in flight per host. Responses come back in request order.
pub async fn execute_batch(
    client: &dyn HttpClient,
    requests: &[HttpRequest],
    batch: usize,
    per_host: usize,
) -> Vec<HttpResponse> {
    let mut hosts: HashMap<String, Arc<Semaphore>> = HashMap::new();
    let permits: Vec<Arc<Semaphore>> = requests
        .iter()
        .map(|r| {
            hosts
                .entry(r.host())
                .or_insert_with(|| Arc::new(Semaphore::new(per_host.max(1))))
                .clone()
        })
        .collect();

    stream::iter(requests.iter().zip(permits))
        .map(|(request, host)| async move {
            // The semaphore is never closed, so acquiring only fails if it were.
            let _permit = host.acquire_owned().await.ok();
            execute(client, request).await
        })
        .buffered(batch.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowClient {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for SlowClient {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if request.url.contains("broken") {
                return Err(HttpError::Connect("refused".to_string()));
            }
            Ok(HttpResponse::new(200).with_body(request.url.clone()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_preserves_order_and_limits_per_host() {
        let client = SlowClient {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let requests: Vec<_> = (0..6)
            .map(|i| HttpRequest::get(format!("http://one.test/{}", i)))
            .collect();
        let responses = execute_batch(&client, &requests, 10, 2).await;
        let bodies: Vec<String> = responses.iter().map(HttpResponse::text).collect();
        let urls: Vec<String> = requests.iter().map(|r| r.url.clone()).collect();
        assert_eq!(bodies, urls);
        assert_eq!(client.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_become_status_zero() {
        let client = SlowClient {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };
        let response = execute(&client, &HttpRequest::get("http://broken.test/")).await;
        assert_eq!(response.status, 0);
        assert!(!response.is_expected());
        assert!(response.error.unwrap().contains("refused"));
    }

    #[test]
    fn request_builder() {
        let req = HttpRequest::post("https://test-api.k6.io/auth/token/login/")
            .json(&serde_json::json!({ "username": "user1@example.com" }))
            .unwrap()
            .bearer("abc")
            .name("Login");
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.tags.get("name"), Some("Login"));
        assert!(req
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer abc"));
        assert_eq!(req.host(), "test-api.k6.io");
        assert!(req.approx_size() > req.url.len());
    }

    #[test]
    fn response_helpers() {
        let mut response = HttpResponse::new(201).with_body(r#"{"id": 7}"#);
        response
            .headers
            .insert("content-type".to_string(), "application/json".to_string());
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert!(response.is_expected());
        assert!(!HttpResponse::new(404).is_expected());
    }
}
