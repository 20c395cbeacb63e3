use std::fs;
use std::sync::Arc;
use std::time::Duration;

use slink_engine::{HttpSession, HttpSessionConfig};
use slink_plugins::registry::{PluginRegistry, PluginSource};
use slink_plugins::{ResolveError, Resolver};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MASTER: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=600000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720
high/index.m3u8
";

const MEDIA: &str = "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:2.0,
a.ts
#EXTINF:2.0,
b.ts
#EXT-X-ENDLIST
";

async fn mount(server: &MockServer, at: &str, body: &'static str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

fn resolver(registry: PluginRegistry) -> Resolver {
    let session = HttpSession::new(HttpSessionConfig::default().with_retries(0, Duration::from_millis(1)))
        .unwrap();
    Resolver::new(Arc::new(registry), Arc::new(session))
}

#[tokio::test]
async fn sideloaded_plugin_streams_the_best_variant() {
    let server = MockServer::start().await;
    mount(&server, "/tv/news/master.m3u8", MASTER).await;
    mount(&server, "/tv/news/high/index.m3u8", MEDIA).await;
    mount(&server, "/tv/news/high/a.ts", "HHHHHHHHHH").await;
    mount(&server, "/tv/news/high/b.ts", "IIIIIIIIII").await;

    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("exampletv.json"),
        format!(
            r#"{{
                "name": "exampletv",
                "matchers": [{{"pattern": "^https://tv\\.example/(?P<channel>[a-z]+)$"}}],
                "url_template": "{}/tv/{{channel}}/master.m3u8"
            }}"#,
            server.uri()
        ),
    )
    .unwrap();

    let registry = PluginRegistry::with_builtins();
    assert_eq!(registry.sideload(dir.path()), 1);
    assert!(matches!(
        registry.source("exampletv"),
        Some(PluginSource::Sideloaded { .. })
    ));

    let (resolved, streams) = resolver(registry).streams("tv.example/news").await.unwrap();
    assert_eq!(resolved.name, "exampletv");
    assert_eq!(streams.describe(), "360p (worst), 720p (best)");

    let (name, stream) = streams.select("1080p,best").unwrap();
    assert_eq!(name, "720p");
    let reader = stream.open().await.unwrap();
    let mut out = Vec::new();
    loop {
        let chunk = reader.read(4096).await.unwrap();
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out, b"HHHHHHHHHHIIIIIIIIII");
}

#[tokio::test]
async fn unknown_urls_have_no_plugin() {
    let resolver = resolver(PluginRegistry::with_builtins());
    let err = resolver.streams("ftp://files.example/video").await.unwrap_err();
    assert!(matches!(err, ResolveError::NoPlugin { ref url } if url == "ftp://files.example/video"));
    assert_eq!(err.to_string(), "No plugin can handle URL: ftp://files.example/video");
}
