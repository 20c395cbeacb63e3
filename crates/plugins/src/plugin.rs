use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use slink_engine::HttpSession;
use slink_engine::hls::HlsConfig;

use crate::arguments::{PluginArguments, PluginOptions};
use crate::cache::PluginCache;
use crate::error::PluginError;
use crate::matcher::{MatchedUrl, Matcher};
use crate::stream::StreamSet;

/// Everything a plugin instance is built from.
#[derive(Clone)]
pub struct PluginContext {
    pub url: String,
    pub matched: MatchedUrl,
    pub session: Arc<HttpSession>,
    pub options: PluginOptions,
    pub cache: PluginCache,
    /// Engine settings for the HLS streams the plugin creates.
    pub hls: HlsConfig,
}

/// Optional metadata shown by `--json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PluginMetadata {
    pub id: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub title: Option<String>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Extracts the streams available at the matched URL.
    async fn streams(&self) -> Result<StreamSet, PluginError>;

    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::default()
    }
}

pub type PluginConstructor =
    Arc<dyn Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

/// A loadable plugin: its matchers, arguments and constructor.
#[derive(Clone)]
pub struct PluginSpec {
    pub name: String,
    pub matchers: Vec<Matcher>,
    pub arguments: PluginArguments,
    pub constructor: PluginConstructor,
}

impl PluginSpec {
    pub fn new<F>(name: impl Into<String>, matchers: Vec<Matcher>, constructor: F) -> Self
    where
        F: Fn(PluginContext) -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matchers,
            arguments: PluginArguments::default(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn with_arguments(mut self, arguments: PluginArguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn build(&self, context: PluginContext) -> Result<Box<dyn Plugin>, PluginError> {
        (self.constructor)(context)
    }
}

impl fmt::Debug for PluginSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSpec")
            .field("name", &self.name)
            .field(
                "matchers",
                &self
                    .matchers
                    .iter()
                    .map(|m| m.pattern.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("arguments", &self.arguments)
            .finish()
    }
}
