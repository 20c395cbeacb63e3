// Niconico Live: the watch page embeds a WebSocket endpoint that mints
// short-lived HLS URLs, so every stream is backed by a `SessionKeeper`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use slink_engine::hls::{HlsStream, parse_variant_playlist};
use slink_engine::{CookieRecord, PlaylistSource};
use tracing::{debug, error, info};
use url::Url;

use crate::arguments::{PluginArgument, PluginArguments};
use crate::error::PluginError;
use crate::keeper::{KeeperConfig, SessionKeeper};
use crate::matcher::Matcher;
use crate::plugin::{Plugin, PluginContext, PluginMetadata, PluginSpec};
use crate::request::SessionExt;
use crate::stream::StreamSet;
use crate::validate::{DictKey, Schema, UrlPart};

pub const NAME: &str = "nicolive";

pub const WATCH_PATTERN: &str = r"^https?://live\d*\.nicovideo\.jp/watch/(?P<id>lv\d+|co\d+)";

const ORIGIN: &str = "https://live.nicovideo.jp";
const COOKIE_DOMAIN: &str = ".nicovideo.jp";
const SESSION_COOKIE: &str = "user_session";
const SESSION_ARGUMENT: &str = "user-session";

pub fn spec() -> Result<PluginSpec, PluginError> {
    let matcher = Matcher::new(WATCH_PATTERN).map_err(|e| PluginError::load(NAME, e.to_string()))?;
    let arguments = PluginArguments::new(vec![
        PluginArgument::new(SESSION_ARGUMENT)
            .help("Value of the user_session cookie, for member-only programs")
            .sensitive(),
    ]);

    Ok(
        PluginSpec::new(NAME, vec![matcher], |context| {
            Ok(Box::new(Nicolive {
                context,
                keeper: Mutex::new(None),
                metadata: Mutex::new(PluginMetadata::default()),
            }) as Box<dyn Plugin>)
        })
        .with_arguments(arguments),
    )
}

fn start_message() -> Value {
    json!({
        "type": "startWatching",
        "data": {
            "stream": {
                "quality": "abr",
                "protocol": "hls",
                "latency": "high",
                "chasePlay": false
            },
            "room": {
                "protocol": "webSocket",
                "commentable": true
            },
            "reconnect": false
        }
    })
}

/// `[webSocketUrl, title]` from the watch page, or null without embedded data.
fn watch_page_schema() -> Result<Schema, PluginError> {
    let embedded = Schema::xpath_first("//script[@id='embedded-data']/@data-props")
        .map_err(|e| PluginError::load(NAME, e.to_string()))?;
    let ws_url = Schema::url()
        .part(
            UrlPart::Scheme,
            Schema::any_of([Schema::equals("wss"), Schema::equals("ws")]),
        )
        .build();

    Ok(Schema::all_of([
        embedded,
        Schema::none_or(Schema::all_of([
            Schema::Json,
            Schema::dict([
                (
                    DictKey::from("site"),
                    Schema::dict([(
                        "relive",
                        Schema::dict([("webSocketUrl", ws_url)]),
                    )]),
                ),
                (
                    DictKey::optional("program"),
                    Schema::dict([(DictKey::optional("title"), Schema::Any)]),
                ),
            ]),
            Schema::union_get(&[&["site", "relive", "webSocketUrl"], &["program", "title"]]),
        ])),
    ]))
}

struct Nicolive {
    context: PluginContext,
    keeper: Mutex<Option<SessionKeeper>>,
    metadata: Mutex<PluginMetadata>,
}

impl Nicolive {
    /// Installs the login cookie from the command line, or from the cache of
    /// an earlier run.
    fn install_session_cookie(&self) -> Result<(), PluginError> {
        let cache = self.context.cache.for_plugin(NAME);
        let value = match self.context.options.get_str(SESSION_ARGUMENT) {
            Some(value) => {
                cache.set(SESSION_ARGUMENT, Value::String(value.to_string()), None)?;
                Some(value.to_string())
            }
            None => cache
                .get(SESSION_ARGUMENT)
                .and_then(|v| v.as_str().map(str::to_string)),
        };

        if let Some(value) = value {
            debug!("Using stored user session");
            self.context
                .session
                .set_cookie(&CookieRecord::new(SESSION_COOKIE, value, COOKIE_DOMAIN))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for Nicolive {
    fn name(&self) -> &str {
        NAME
    }

    async fn streams(&self) -> Result<StreamSet, PluginError> {
        self.install_session_cookie()?;

        let page = self
            .context
            .session
            .get_text(&self.context.url, &watch_page_schema()?)
            .await?;
        let Value::Array(fields) = page else {
            error!("Unable to find the embedded watch data on the page");
            return Ok(StreamSet::new());
        };
        let ws_url = fields
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| PluginError::other("watch data has no WebSocket URL"))?;
        let ws_url = Url::parse(ws_url)
            .map_err(|e| PluginError::other(format!("invalid WebSocket URL: {e}")))?;
        let title = fields.get(1).and_then(Value::as_str).map(str::to_string);

        {
            let mut metadata = self.metadata.lock();
            metadata.id = self.context.matched.group("id").map(str::to_string);
            metadata.title = title;
        }

        let config = KeeperConfig::new(ws_url, start_message())
            .with_header("User-Agent", self.context.session.config().user_agent.clone())
            .with_header("Origin", ORIGIN);
        let keeper = SessionKeeper::new(self.context.session.clone(), config);
        keeper.start();
        let master = keeper.wait_ready().await?;
        info!("Session is ready");

        let variants = parse_variant_playlist(&self.context.session, &master).await?;
        let mut streams = StreamSet::new();
        for variant in variants {
            let source: Arc<dyn PlaylistSource> = keeper.playlist_source(Some(variant.name.clone()));
            let stream = HlsStream::with_source(
                self.context.session.clone(),
                source,
                self.context.hls.clone(),
            );
            streams.push(variant.name, Arc::new(stream));
        }

        if let Some(previous) = self.keeper.lock().replace(keeper) {
            previous.close();
        }
        Ok(streams)
    }

    fn metadata(&self) -> PluginMetadata {
        let mut metadata = self.metadata.lock().clone();
        metadata.category = Some("live".to_string());
        metadata
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use futures::{SinkExt, StreamExt};
    use slink_engine::hls::HlsConfig;
    use slink_engine::{HttpSession, HttpSessionConfig};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::cache::PluginCache;
    use crate::matcher::match_url;

    const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=400000,RESOLUTION=640x360
360.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1280x720
720.m3u8
";

    fn watch_page(ws_url: &str) -> String {
        let props = json!({
            "site": {"relive": {"webSocketUrl": ws_url}},
            "program": {"title": "Night show"}
        })
        .to_string()
        .replace('"', "&quot;");
        format!(
            r#"<!DOCTYPE html><html><head><script id="embedded-data" data-props="{props}"></script></head><body></body></html>"#
        )
    }

    fn context(page_url: String, options: &[(&str, &str)], cache: PluginCache) -> PluginContext {
        let spec = spec().unwrap();
        let raw: HashMap<String, String> = options
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PluginContext {
            url: page_url,
            matched: match_url(&spec.matchers, "https://live.nicovideo.jp/watch/lv123456").unwrap(),
            session: Arc::new(HttpSession::new(HttpSessionConfig::default()).unwrap()),
            options: spec.arguments.parse(NAME, &raw).unwrap(),
            cache,
            hls: HlsConfig::default(),
        }
    }

    /// Accepts one session and answers `startWatching` with `master`.
    async fn session_server(master: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/wsapi/v2/watch/lv123456", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(raw) = message else { continue };
                let value: Value = serde_json::from_str(raw.as_str()).unwrap();
                if value["type"] == "startWatching" {
                    let reply = json!({
                        "type": "stream",
                        "data": {"uri": master, "protocol": "hls", "cookies": []}
                    });
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });
        url
    }

    #[test]
    fn matches_watch_urls() {
        let spec = spec().unwrap();
        let matched = match_url(&spec.matchers, "https://live2.nicovideo.jp/watch/lv987").unwrap();
        assert_eq!(matched.group("id"), Some("lv987"));
        assert!(match_url(&spec.matchers, "https://www.nicovideo.jp/watch/sm9").is_none());
    }

    #[tokio::test]
    async fn lists_variants_through_the_session() {
        let server = MockServer::start().await;
        let ws_url = session_server(format!("{}/master.m3u8", server.uri())).await;
        Mock::given(method("GET"))
            .and(path("/watch/lv123456"))
            .respond_with(ResponseTemplate::new(200).set_body_string(watch_page(&ws_url)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/master.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MASTER))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = PluginCache::open(dir.path().join("plugins.json"));
        let ctx = context(
            format!("{}/watch/lv123456", server.uri()),
            &[("nicolive-user-session", "secret")],
            cache.clone(),
        );
        let session = ctx.session.clone();
        let plugin = spec().unwrap().build(ctx).unwrap();

        let streams = plugin.streams().await.unwrap();
        assert_eq!(streams.names(), vec!["360p", "720p"]);

        let metadata = plugin.metadata();
        assert_eq!(metadata.title.as_deref(), Some("Night show"));
        assert_eq!(metadata.id.as_deref(), Some("lv123456"));

        let cookie = session
            .cookie_header(&Url::parse("https://live.nicovideo.jp/").unwrap())
            .unwrap();
        assert!(cookie.contains("user_session=secret"));
        assert_eq!(cache.for_plugin(NAME).get(SESSION_ARGUMENT), Some(json!("secret")));
    }

    #[tokio::test]
    async fn page_without_embedded_data_has_no_streams() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/watch/lv1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>gone</body></html>"))
            .mount(&server)
            .await;

        let ctx = context(format!("{}/watch/lv1", server.uri()), &[], PluginCache::in_memory());
        let plugin = spec().unwrap().build(ctx).unwrap();
        assert!(plugin.streams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_websocket_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/watch/lv2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(watch_page("https://example.com/socket")),
            )
            .mount(&server)
            .await;

        let ctx = context(format!("{}/watch/lv2", server.uri()), &[], PluginCache::in_memory());
        let plugin = spec().unwrap().build(ctx).unwrap();
        let err = plugin.streams().await.unwrap_err();
        let PluginError::Validation(validation) = err else {
            panic!("expected a validation error, got {err}");
        };
        assert!(validation.render().contains("Unable to validate URL attribute 'scheme'"));
    }
}
