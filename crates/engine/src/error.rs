use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("cookie error: {reason}")]
    Cookie { reason: String },

    #[error("client configuration error: {reason}")]
    Configuration { reason: String },
}

impl HttpError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::Status {
            status,
            url: url.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns the HTTP status code if the server answered with an error status.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Network { source } => source.status(),
            _ => None,
        }
    }

    /// Transport failures and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => status.is_server_error(),
            Self::Network { source } => is_retryable_reqwest_error(source),
            Self::InvalidUrl { .. } | Self::Cookie { .. } | Self::Configuration { .. } => false,
        }
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

/// Errors surfaced by the [`RingBuffer`](crate::RingBuffer) to readers and writers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// The buffer was closed; writers stop, readers have drained everything.
    #[error("ring buffer closed")]
    Closed,

    /// The producing side failed. Delivered to readers after all buffered
    /// bytes were consumed.
    #[error("{reason}")]
    Stream { reason: String },
}
