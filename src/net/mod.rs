//! HTTP(S) fetching for worker threads.
//!
//! Each worker owns its client (crawlers own two: one for live sites, one
//! for archives). The client keeps a cookie session, enforces a minimum
//! interval between consecutive requests, records response metadata for the
//! caller, and classifies transport errors into skip vs. reset-and-retry.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level fetch outcome used by the tick's retry discipline.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Permanent for this URL; release it and move on.
    #[error("skipping URL: {0}")]
    Skip(String),
    /// Transient; reset the connection and let the supervisor re-enter the
    /// same URL.
    #[error("retrying after: {0}")]
    Retry(String),
}

#[derive(Debug, Error)]
#[error("could not build HTTP client: {0}")]
pub struct ClientError(#[from] reqwest::Error);

/// Per-worker network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Minimum interval between consecutive HTTP requests, in milliseconds.
    pub sleep_http_ms: u64,
    /// Sleep after a connection reset, in milliseconds.
    pub sleep_error_ms: u64,
    pub max_redirects: usize,
    /// Talk plain HTTP to the website instead of HTTPS.
    pub plain_http: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("siteharvest/", env!("CARGO_PKG_VERSION")).to_owned(),
            timeout_secs: 30,
            sleep_http_ms: 0,
            sleep_error_ms: 5_000,
            max_redirects: 10,
            plain_http: false,
        }
    }
}

impl NetworkConfig {
    /// URL scheme for fetches against the configured website.
    pub fn scheme(&self) -> &'static str {
        if self.plain_http { "http" } else { "https" }
    }
}

/// Cookie-preserving HTTP fetcher with per-worker configuration.
pub struct HttpClient {
    config: NetworkConfig,
    client: reqwest::Client,
    last_request: Option<Instant>,
    last_sleep: Duration,
    last_status: u16,
    last_content_type: String,
}

impl HttpClient {
    pub fn new(config: NetworkConfig) -> Result<Self, ClientError> {
        let client = build_client(&config)?;

        Ok(Self {
            config,
            client,
            last_request: None,
            last_sleep: Duration::ZERO,
            last_status: 0,
            last_content_type: String::new(),
        })
    }

    /// Fetch a URL. Any HTTP status is a successful fetch at this level; the
    /// caller inspects [`Self::response_code`] and
    /// [`Self::content_type`]. With `use_post`, the query string is sent as
    /// an URL-encoded form body instead.
    pub async fn fetch(&mut self, url: &str, use_post: bool) -> Result<String, FetchError> {
        self.fetch_with_cookies(url, use_post, None).await
    }

    /// Like [`Self::fetch`], with an additional `Cookie` header for this
    /// request.
    pub async fn fetch_with_cookies(
        &mut self,
        url: &str,
        use_post: bool,
        cookies: Option<&str>,
    ) -> Result<String, FetchError> {
        self.rate_sleep().await;

        let request = if use_post {
            let (base, query) = url.split_once('?').unwrap_or((url, ""));

            self.client
                .post(base)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(query.to_owned())
        } else {
            self.client.get(url)
        };

        let request = match cookies {
            Some(cookies) if !cookies.is_empty() => request.header("Cookie", cookies.to_owned()),
            _ => request,
        };

        self.last_request = Some(Instant::now());

        let response = request.send().await.map_err(classify)?;

        self.last_status = response.status().as_u16();
        self.last_content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_owned())
            .unwrap_or_default();

        let bytes = response.bytes().await.map_err(classify)?;

        // an invalid encoding skips the URL rather than storing garbage
        String::from_utf8(bytes.to_vec())
            .map_err(|e| FetchError::Skip(format!("invalid UTF-8 in response body: {e}")))
    }

    /// Status code of the last response (0 before any request).
    pub fn response_code(&self) -> u16 {
        self.last_status
    }

    /// Media type of the last response, without parameters.
    pub fn content_type(&self) -> &str {
        &self.last_content_type
    }

    /// Time spent sleeping for the rate limit before the last request.
    /// Accounted as idle, not working, time.
    pub fn last_rate_sleep(&self) -> Duration {
        self.last_sleep
    }

    /// Tear down and re-create the underlying connection pool, then sleep
    /// for the configured error delay.
    pub async fn reset_connection(&mut self) {
        if let Ok(client) = build_client(&self.config) {
            self.client = client;
        }

        tokio::time::sleep(Duration::from_millis(self.config.sleep_error_ms)).await;
    }

    /// Enforce the minimum interval between consecutive requests.
    async fn rate_sleep(&mut self) {
        self.last_sleep = Duration::ZERO;

        if self.config.sleep_http_ms == 0 {
            return;
        }

        if let Some(last) = self.last_request {
            let min_interval = Duration::from_millis(self.config.sleep_http_ms);
            let elapsed = last.elapsed();

            if elapsed < min_interval {
                let wait = min_interval - elapsed;

                tokio::time::sleep(wait).await;

                self.last_sleep = wait;
            }
        }
    }
}

fn build_client(config: &NetworkConfig) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
        .cookie_store(true)
        .build()?)
}

/// Classify a transport error: redirect loops are permanent for the URL,
/// everything else is worth a reset and retry.
fn classify(error: reqwest::Error) -> FetchError {
    if error.is_redirect() {
        FetchError::Skip(format!("too many redirects: {error}"))
    } else {
        FetchError::Retry(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_records_status_and_content_type() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_header("content-type", "text/html; charset=utf-8")
            .with_body("<html>ok</html>")
            .create_async()
            .await;

        let mut client = HttpClient::new(NetworkConfig::default()).unwrap();
        let body = client
            .fetch(&format!("{}/page", server.url()), false)
            .await
            .unwrap();

        assert_eq!(body, "<html>ok</html>");
        assert_eq!(client.response_code(), 200);
        assert_eq!(client.content_type(), "text/html");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_sends_query_as_form_body() {
        let mut server = mockito::Server::new_async().await;

        let mock = server
            .mock("POST", "/submit")
            .match_body("a=1&b=2")
            .with_status(200)
            .with_body("posted")
            .create_async()
            .await;

        let mut client = HttpClient::new(NetworkConfig::default()).unwrap();
        let body = client
            .fetch(&format!("{}/submit?a=1&b=2", server.url()), true)
            .await
            .unwrap();

        assert_eq!(body, "posted");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_errors_are_not_transport_errors() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("gone")
            .create_async()
            .await;

        let mut client = HttpClient::new(NetworkConfig::default()).unwrap();
        let body = client
            .fetch(&format!("{}/missing", server.url()), false)
            .await
            .unwrap();

        assert_eq!(body, "gone");
        assert_eq!(client.response_code(), 404);
    }

    #[tokio::test]
    async fn min_interval_is_enforced_between_requests() {
        let mut server = mockito::Server::new_async().await;

        server
            .mock("GET", "/a")
            .with_status(200)
            .with_body("x")
            .expect_at_least(2)
            .create_async()
            .await;

        let mut client = HttpClient::new(NetworkConfig {
            sleep_http_ms: 50,
            ..NetworkConfig::default()
        })
        .unwrap();

        let url = format!("{}/a", server.url());

        client.fetch(&url, false).await.unwrap();

        let started = Instant::now();

        client.fetch(&url, false).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert!(client.last_rate_sleep() > Duration::ZERO);
    }

    #[tokio::test]
    async fn connection_refused_is_a_retry() {
        let mut client = HttpClient::new(NetworkConfig {
            timeout_secs: 2,
            ..NetworkConfig::default()
        })
        .unwrap();

        let result = client.fetch("http://127.0.0.1:1/none", false).await;

        assert!(matches!(result, Err(FetchError::Retry(_))));
    }
}
