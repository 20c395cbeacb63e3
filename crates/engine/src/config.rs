use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Transport settings applied to every request whose URL starts with `prefix`.
#[derive(Debug, Clone, Default)]
pub struct TransportOverride {
    /// URL prefix, e.g. `https://legacy.example.com/`
    pub prefix: String,
    /// Accept invalid or self-signed certificates
    pub danger_accept_invalid_certs: bool,
    /// Force HTTP/1.1 only
    pub http1_only: bool,
    /// Lowest TLS version the client will negotiate
    pub min_tls_version: Option<reqwest::tls::Version>,
}

impl TransportOverride {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn accept_invalid_certs(mut self) -> Self {
        self.danger_accept_invalid_certs = true;
        self
    }

    pub fn http1_only(mut self) -> Self {
        self.http1_only = true;
        self
    }
}

/// Configurable options for the HTTP session
#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Overall timeout for a single request
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Additional attempts made on transport errors and 5xx responses
    pub retries: u32,

    /// Fixed delay between attempts
    pub retry_backoff: Duration,

    /// Proxy URL applied to all clients (optional)
    pub proxy: Option<String>,

    /// Per-prefix transport overrides, checked longest prefix first
    pub transport_overrides: Vec<TransportOverride>,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpSessionConfig::default_headers(),
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
            retries: 3,
            retry_backoff: Duration::from_millis(500),
            proxy: None,
            transport_overrides: Vec::new(),
        }
    }
}

impl HttpSessionConfig {
    pub fn default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("*/*"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );

        default_headers
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Adds or replaces a default header. Invalid names or values are ignored
    /// with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => tracing::warn!(header = name, "Ignoring invalid HTTP header"),
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_transport_override(mut self, transport: TransportOverride) -> Self {
        self.transport_overrides.push(transport);
        self
    }
}
