use std::time::Duration;

use slink_engine::HttpError;
use slink_engine::hls::HlsError;
use thiserror::Error;

use crate::validate::ValidationError;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Hls(#[from] HlsError),

    #[error("Unable to validate response: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Keeper(#[from] KeeperError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing required plugin argument `{name}`")]
    MissingArgument { name: String },

    #[error("invalid value for plugin argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("failed to load plugin `{name}`: {reason}")]
    Load { name: String, reason: String },

    #[error("{0}")]
    Other(String),
}

impl PluginError {
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other(reason.into())
    }

    pub fn load(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No plugin can handle URL: {url}")]
    NoPlugin { url: String },

    #[error("No playable streams found on this URL: {url}")]
    NoStreams { url: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("session was not ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("session closed: {reason}")]
    Closed { reason: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },
}

impl From<tokio_tungstenite::tungstenite::Error> for KeeperError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}
