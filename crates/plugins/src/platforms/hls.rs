// Generic HLS plugin: `hls://` URLs and anything ending in `.m3u8`.

use std::sync::Arc;

use async_trait::async_trait;
use slink_engine::hls::{HlsStream, parse_variant_playlist};
use tracing::debug;
use url::Url;

use crate::error::PluginError;
use crate::matcher::{LOW_PRIORITY, Matcher};
use crate::plugin::{Plugin, PluginContext, PluginSpec};
use crate::stream::StreamSet;

pub const NAME: &str = "hls";

pub const PREFIXED_PATTERN: &str = r"^hls(?:variant)?://(?P<url>\S+)$";
pub const SUFFIX_PATTERN: &str = r"(?P<url>^\S+\.m3u8(?:\?\S*)?$)";

pub fn spec() -> Result<PluginSpec, PluginError> {
    let compile = |pattern: &str| {
        Matcher::new(pattern).map_err(|e| PluginError::load(NAME, e.to_string()))
    };
    let matchers = vec![
        compile(PREFIXED_PATTERN)?,
        compile(SUFFIX_PATTERN)?.with_priority(LOW_PRIORITY),
    ];

    Ok(PluginSpec::new(NAME, matchers, |context| {
        Ok(Box::new(HlsPlugin { context }) as Box<dyn Plugin>)
    }))
}

/// Adds `https://` to a URL given without a scheme.
pub(crate) fn with_scheme(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Streams for every variant of the playlist at `url`, keyed by quality name.
pub(crate) async fn variant_streams(
    context: &PluginContext,
    url: &str,
) -> Result<StreamSet, PluginError> {
    let url = Url::parse(url)
        .map_err(|e| PluginError::other(format!("invalid playlist URL {url}: {e}")))?;
    let variants = parse_variant_playlist(&context.session, &url).await?;
    debug!(%url, count = variants.len(), "Parsed variant playlist");

    let mut streams = StreamSet::new();
    for variant in variants {
        let stream = HlsStream::new(context.session.clone(), variant.url, context.hls.clone());
        streams.push(variant.name, Arc::new(stream));
    }
    Ok(streams)
}

struct HlsPlugin {
    context: PluginContext,
}

#[async_trait]
impl Plugin for HlsPlugin {
    fn name(&self) -> &str {
        NAME
    }

    async fn streams(&self) -> Result<StreamSet, PluginError> {
        let url = self
            .context
            .matched
            .group("url")
            .unwrap_or(self.context.url.as_str());
        variant_streams(&self.context, &with_scheme(url)).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use slink_engine::hls::HlsConfig;
    use slink_engine::{HttpSession, HttpSessionConfig};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::cache::PluginCache;
    use crate::matcher::match_url;

    fn context(spec: &PluginSpec, url: &str) -> PluginContext {
        PluginContext {
            url: url.to_string(),
            matched: match_url(&spec.matchers, url).unwrap(),
            session: Arc::new(HttpSession::new(HttpSessionConfig::default()).unwrap()),
            options: spec.arguments.parse(NAME, &HashMap::new()).unwrap(),
            cache: PluginCache::in_memory(),
            hls: HlsConfig::default(),
        }
    }

    #[test]
    fn matches_prefix_and_suffix() {
        let spec = spec().unwrap();
        let prefixed = match_url(&spec.matchers, "hls://example.com/live.m3u8").unwrap();
        assert_eq!(prefixed.group("url"), Some("example.com/live.m3u8"));
        assert_eq!(prefixed.index, 0);

        let bare = match_url(&spec.matchers, "https://cdn.example/a/index.m3u8?token=1").unwrap();
        assert_eq!(bare.priority, LOW_PRIORITY);
        assert_eq!(bare.group("url"), Some("https://cdn.example/a/index.m3u8?token=1"));

        assert!(match_url(&spec.matchers, "https://cdn.example/a/index.mpd").is_none());
        assert_eq!(with_scheme("example.com/x.m3u8"), "https://example.com/x.m3u8");
    }

    #[tokio::test]
    async fn lists_variants_by_quality() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/master.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
360.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,RESOLUTION=1280x720,FRAME-RATE=60.000
720.m3u8
",
            ))
            .mount(&server)
            .await;

        let spec = spec().unwrap();
        let url = format!("hls://{}/master.m3u8", server.uri());
        let plugin = spec.build(context(&spec, &url)).unwrap();
        let streams = plugin.streams().await.unwrap();

        assert_eq!(streams.names(), vec!["360p", "720p60"]);
        let (name, best) = streams.get("best").unwrap();
        assert_eq!(name, "720p60");
        assert_eq!(best.url().unwrap().path(), "/720.m3u8");
    }
}
