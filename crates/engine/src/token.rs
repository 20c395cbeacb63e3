use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

use crate::hls::HlsError;

/// A playlist URL together with the moment it stops being valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchToken {
    pub url: Url,
    /// `None` means the expiry is unknown.
    pub expires_at: Option<Instant>,
}

impl WatchToken {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            expires_at: None,
        }
    }

    pub fn with_ttl(url: Url, ttl: Duration) -> Self {
        Self {
            url,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }

    /// A token with a known expiry that has not passed yet.
    pub fn has_future_expiry(&self) -> bool {
        self.expires_at.is_some_and(|at| at > Instant::now())
    }

    pub fn expire(&mut self) {
        self.expires_at = Some(Instant::now());
    }
}

/// Supplies the media playlist URL to the reloader.
///
/// Sites that mint short-lived URLs implement this on top of their session
/// keeper; plain URLs use [`StaticPlaylistSource`].
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    /// Returns a URL valid for the next request, waiting for a fresh one if
    /// the current URL has been invalidated.
    ///
    /// Fails with [`HlsError::RefreshRequired`] when a new URL must be minted
    /// first, and with [`HlsError::SourceEnded`] when the upstream session
    /// ended the stream.
    async fn playlist_url(&self) -> Result<Url, HlsError>;

    /// Marks the current URL as expired, e.g. after an HTTP 403.
    fn invalidate(&self);

    /// The last known URL, without waiting.
    fn current_url(&self) -> Option<Url>;

    /// Called once when the stream reader closes.
    fn close(&self) {}
}

/// A playlist URL that never changes.
#[derive(Debug, Clone)]
pub struct StaticPlaylistSource {
    url: Url,
}

impl StaticPlaylistSource {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

#[async_trait]
impl PlaylistSource for StaticPlaylistSource {
    async fn playlist_url(&self) -> Result<Url, HlsError> {
        Ok(self.url.clone())
    }

    fn invalidate(&self) {}

    fn current_url(&self) -> Option<Url> {
        Some(self.url.clone())
    }
}
