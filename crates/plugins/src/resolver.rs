// Resolver: turns an input URL into a constructed plugin and its streams.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use slink_engine::hls::HlsConfig;
use slink_engine::{HttpSession, RequestOptions};
use tracing::{debug, info};

use crate::cache::PluginCache;
use crate::error::ResolveError;
use crate::matcher::MatchedUrl;
use crate::plugin::{Plugin, PluginContext, PluginMetadata};
use crate::registry::{PluginRegistry, normalize_option_key};
use crate::stream::StreamSet;

/// Adds `https://` when the URL has no scheme.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let has_scheme = url.split_once("://").is_some_and(|(scheme, _)| {
        !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "+.-".contains(c))
    });
    if has_scheme {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// A constructed plugin bound to the URL it matched.
pub struct ResolvedPlugin {
    pub name: String,
    pub url: String,
    pub matched: MatchedUrl,
    pub plugin: Box<dyn Plugin>,
}

impl fmt::Debug for ResolvedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPlugin")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

impl ResolvedPlugin {
    /// The plugin's streams; an empty set is a [`ResolveError::NoStreams`].
    pub async fn streams(&self) -> Result<StreamSet, ResolveError> {
        let streams = self.plugin.streams().await?;
        if streams.is_empty() {
            return Err(ResolveError::NoStreams {
                url: self.url.clone(),
            });
        }
        debug!(plugin = %self.name, streams = %streams.describe(), "Found streams");
        Ok(streams)
    }

    pub fn metadata(&self) -> PluginMetadata {
        self.plugin.metadata()
    }
}

#[derive(Clone)]
pub struct Resolver {
    registry: Arc<PluginRegistry>,
    session: Arc<HttpSession>,
    hls: HlsConfig,
    options: HashMap<String, String>,
    cache: PluginCache,
}

impl Resolver {
    pub fn new(registry: Arc<PluginRegistry>, session: Arc<HttpSession>) -> Self {
        Self {
            registry,
            session,
            hls: HlsConfig::default(),
            options: HashMap::new(),
            cache: PluginCache::in_memory(),
        }
    }

    pub fn with_hls_config(mut self, hls: HlsConfig) -> Self {
        self.hls = hls;
        self
    }

    /// Raw `{plugin}-{argument}` values; deprecated plugin prefixes are
    /// rewritten to the current name.
    pub fn with_options(mut self, options: HashMap<String, String>) -> Self {
        self.options = options
            .into_iter()
            .map(|(key, value)| (normalize_option_key(&key), value))
            .collect();
        self
    }

    pub fn with_cache(mut self, cache: PluginCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn session(&self) -> &Arc<HttpSession> {
        &self.session
    }

    /// Matches `url` against the registry and constructs the winning plugin.
    pub fn resolve_url(&self, url: &str) -> Result<ResolvedPlugin, ResolveError> {
        let url = normalize_url(url);
        let Some((matched, spec)) = self.registry.match_url(&url) else {
            return Err(ResolveError::NoPlugin { url });
        };

        let options = spec.arguments.parse(&spec.name, &self.options)?;
        let context = PluginContext {
            url: url.clone(),
            matched: matched.clone(),
            session: self.session.clone(),
            options,
            cache: self.cache.clone(),
            hls: self.hls.clone(),
        };
        let plugin = spec.build(context)?;
        info!("Found matching plugin {} for URL {url}", spec.name);

        Ok(ResolvedPlugin {
            name: spec.name.clone(),
            url,
            matched,
            plugin,
        })
    }

    /// Like [`Self::resolve_url`], but when nothing matches an HTTP URL the
    /// redirect target is tried as well.
    pub async fn resolve(&self, url: &str) -> Result<ResolvedPlugin, ResolveError> {
        let err = match self.resolve_url(url) {
            Ok(resolved) => return Ok(resolved),
            Err(e @ ResolveError::NoPlugin { .. }) => e,
            Err(e) => return Err(e),
        };

        let normalized = normalize_url(url);
        if !normalized.starts_with("http://") && !normalized.starts_with("https://") {
            return Err(err);
        }
        let target = match self
            .session
            .head(&normalized, RequestOptions::new().no_retry())
            .await
        {
            Ok(response) => response.url().to_string(),
            Err(e) => {
                debug!(url = %normalized, error = %e, "Could not follow redirects");
                return Err(err);
            }
        };
        if target == normalized {
            return Err(err);
        }

        debug!(from = %normalized, to = %target, "Following redirect");
        self.resolve_url(&target)
    }

    /// Resolves and extracts streams in one step.
    pub async fn streams(&self, url: &str) -> Result<(ResolvedPlugin, StreamSet), ResolveError> {
        let resolved = self.resolve(url).await?;
        let streams = resolved.streams().await?;
        Ok((resolved, streams))
    }
}
