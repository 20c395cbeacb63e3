use reqwest::StatusCode;

use crate::error::HttpError;

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("failed to reload playlist {attempts} times in a row: {last}")]
    ReloadExhausted { attempts: u32, last: String },

    #[error("playlist URL refreshed {attempts} times without success")]
    RefreshExhausted { attempts: u32 },

    #[error("playlist URL must be refreshed")]
    RefreshRequired,

    #[error("playlist source ended the stream")]
    SourceEnded,

    #[error("segment {sequence} failed: {source}")]
    Segment {
        sequence: u64,
        #[source]
        source: HttpError,
    },

    #[error("too many unavailable segments in a row ({count})")]
    TooManySkipped { count: u32 },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },
}

impl HlsError {
    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Http(e) | Self::Segment { source: e, .. } => e.status_code(),
            _ => None,
        }
    }

    /// Playlist responses that mean the URL was revoked and must be re-minted.
    pub fn needs_refresh(&self) -> bool {
        matches!(self, Self::RefreshRequired)
            || matches!(
                self.status_code(),
                Some(StatusCode::FORBIDDEN) | Some(StatusCode::BAD_GATEWAY)
            )
    }

    /// Segment responses that are skipped rather than failing the stream.
    pub fn is_segment_gone(&self) -> bool {
        matches!(
            self.status_code(),
            Some(StatusCode::FORBIDDEN) | Some(StatusCode::GONE)
        )
    }
}
