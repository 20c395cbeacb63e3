// HTTP Session: one cookie jar shared by a pool of reqwest clients.
//
// Requests pick the client whose transport override prefix matches the URL,
// retry transport errors and 5xx responses with a fixed backoff, and raise
// an error for any 4xx/5xx unless the caller opts out.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Response};
use reqwest_cookie_store::{CookieStore, CookieStoreMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::config::{HttpSessionConfig, TransportOverride};
use crate::error::HttpError;

/// A cookie to pin into the session jar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    /// Lifetime in seconds from now; `None` makes it a session cookie.
    #[serde(default)]
    pub max_age: Option<u64>,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl CookieRecord {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_cookie_path(),
            secure: false,
            max_age: None,
        }
    }

    fn set_cookie_header(&self) -> String {
        let mut header = format!(
            "{}={}; Domain={}; Path={}",
            self.name, self.value, self.domain, self.path
        );
        if self.secure {
            header.push_str("; Secure");
        }
        if let Some(max_age) = self.max_age {
            header.push_str(&format!("; Max-Age={max_age}"));
        }
        header
    }

    fn request_url(&self) -> Result<Url, HttpError> {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self.domain.trim_start_matches('.');
        let raw = format!("{scheme}://{host}{}", self.path);
        Url::parse(&raw).map_err(|e| HttpError::invalid_url(raw, e))
    }
}

/// Body attached to a request. Kept owned so retries can rebuild it.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Bytes(bytes::Bytes),
}

/// Per-request options layered on top of the session configuration.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    pub timeout: Option<Duration>,
    /// Overrides the session's retry count; `Some(0)` disables retries.
    pub retries: Option<u32>,
    /// Return 4xx/5xx responses instead of raising [`HttpError::Status`].
    pub allow_error_status: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_retry(mut self) -> Self {
        self.retries = Some(0);
        self
    }

    pub fn allow_error_status(mut self) -> Self {
        self.allow_error_status = true;
        self
    }
}

/// Process-wide HTTP session: default headers, cookie jar and a client pool
/// keyed by URL prefix.
pub struct HttpSession {
    config: HttpSessionConfig,
    cookies: Arc<CookieStoreMutex>,
    default_client: Client,
    /// Sorted by prefix length, longest first.
    overrides: Vec<(String, Client)>,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("user_agent", &self.config.user_agent)
            .field("retries", &self.config.retries)
            .field(
                "overrides",
                &self.overrides.iter().map(|(p, _)| p).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl HttpSession {
    pub fn new(config: HttpSessionConfig) -> Result<Self, HttpError> {
        let cookies = Arc::new(CookieStoreMutex::new(CookieStore::default()));
        let default_client = build_client(&config, &cookies, None)?;

        let mut overrides = config
            .transport_overrides
            .iter()
            .map(|transport| {
                build_client(&config, &cookies, Some(transport))
                    .map(|client| (transport.prefix.clone(), client))
            })
            .collect::<Result<Vec<_>, _>>()?;
        overrides.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Self {
            config,
            cookies,
            default_client,
            overrides,
        })
    }

    pub fn config(&self) -> &HttpSessionConfig {
        &self.config
    }

    pub fn cookie_jar(&self) -> &Arc<CookieStoreMutex> {
        &self.cookies
    }

    /// Returns the client responsible for `url`.
    pub fn client_for(&self, url: &str) -> &Client {
        self.overrides
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, client)| client)
            .unwrap_or(&self.default_client)
    }

    /// Pins a cookie into the shared jar.
    pub fn set_cookie(&self, record: &CookieRecord) -> Result<(), HttpError> {
        let url = record.request_url()?;
        let mut store = self.cookies.lock().map_err(|_| HttpError::Cookie {
            reason: "cookie jar lock poisoned".to_string(),
        })?;
        store
            .parse(&record.set_cookie_header(), &url)
            .map_err(|e| HttpError::Cookie {
                reason: e.to_string(),
            })?;
        debug!(name = %record.name, domain = %record.domain, "Pinned cookie");
        Ok(())
    }

    /// Renders the cookies the jar would send to `url` as a `Cookie` header value.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let store = self.cookies.lock().ok()?;
        let header = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        (!header.is_empty()).then_some(header)
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::GET, url, options).await
    }

    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::POST, url, options).await
    }

    pub async fn head(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::HEAD, url, options).await
    }

    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<Response, HttpError> {
        self.request(Method::DELETE, url, options).await
    }

    /// Sends a request, retrying transport errors and server errors with the
    /// configured fixed backoff.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response, HttpError> {
        let parsed = Url::parse(url).map_err(|e| HttpError::invalid_url(url, e))?;
        let max_attempts = options.retries.unwrap_or(self.config.retries) + 1;
        let mut attempt = 1;

        loop {
            match self.send_once(method.clone(), &parsed, &options).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        %url,
                        attempt,
                        max = max_attempts,
                        error = %e,
                        "Request failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: &Url,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        let client = self.client_for(url.as_str());
        let mut builder = client.request(method, url.clone());

        if !options.params.is_empty() {
            builder = builder.query(&options.params);
        }
        if !options.headers.is_empty() {
            builder = builder.headers(options.headers.clone());
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match &options.body {
            Some(RequestBody::Json(value)) => builder.json(value),
            Some(RequestBody::Form(fields)) => builder.form(fields),
            Some(RequestBody::Bytes(bytes)) => builder.body(bytes.clone()),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        if !options.allow_error_status && (status.is_client_error() || status.is_server_error()) {
            return Err(HttpError::status(status, url.as_str()));
        }
        Ok(response)
    }
}

fn build_client(
    config: &HttpSessionConfig,
    cookies: &Arc<CookieStoreMutex>,
    transport: Option<&TransportOverride>,
) -> Result<Client, HttpError> {
    let mut headers = config.headers.clone();
    let user_agent = HeaderValue::from_str(&config.user_agent)
        .map_err(|e| HttpError::configuration(format!("invalid user agent: {e}")))?;
    headers.insert(USER_AGENT, user_agent);

    let mut builder = Client::builder()
        .default_headers(headers)
        .cookie_provider(cookies.clone())
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout);

    if let Some(proxy) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| HttpError::configuration(format!("invalid proxy URL: {e}")))?;
        builder = builder.proxy(proxy);
    }

    if let Some(transport) = transport {
        if transport.danger_accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if transport.http1_only {
            builder = builder.http1_only();
        }
        if let Some(version) = transport.min_tls_version {
            builder = builder.min_tls_version(version);
        }
    }

    builder.build().map_err(|e| {
        HttpError::configuration(format!("failed to build HTTP client: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(retries: u32) -> HttpSession {
        HttpSession::new(
            HttpSessionConfig::default().with_retries(retries, Duration::from_millis(10)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let response = session(3)
            .get(&format!("{}/flaky", server.uri()), RequestOptions::new())
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = session(3)
            .get(&format!("{}/missing", server.uri()), RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(reqwest::StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn no_retry_option_gives_up_after_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let result = session(3)
            .get(&server.uri(), RequestOptions::new().no_retry())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn error_status_can_be_returned() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let response = session(0)
            .get(&server.uri(), RequestOptions::new().allow_error_status())
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[test]
    fn pinned_cookies_are_sent_to_matching_urls() {
        let session = session(0);
        session
            .set_cookie(&CookieRecord::new("user_session", "abc", ".example.com"))
            .unwrap();

        let url = Url::parse("http://live.example.com/watch").unwrap();
        assert_eq!(session.cookie_header(&url).as_deref(), Some("user_session=abc"));

        let other = Url::parse("http://other.org/").unwrap();
        assert_eq!(session.cookie_header(&other), None);
    }

    #[test]
    fn longest_prefix_override_wins() {
        let config = HttpSessionConfig::default()
            .with_transport_override(TransportOverride::new("https://a.example/"))
            .with_transport_override(TransportOverride::new("https://a.example/legacy/").http1_only());
        let session = HttpSession::new(config).unwrap();
        assert_eq!(session.overrides[0].0, "https://a.example/legacy/");
    }
}
