use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use slink_engine::hls::{HlsReader, HlsStream};
use url::Url;

use crate::error::PluginError;
use crate::weight::{self, BEST, WORST};

/// Something a plugin can hand to the runner.
#[async_trait]
pub trait Stream: Send + Sync {
    fn kind(&self) -> &'static str;

    /// The URL printed by `--stream-url`, if the stream has a stable one.
    fn url(&self) -> Option<Url>;

    async fn open(&self) -> Result<HlsReader, PluginError>;

    fn to_json(&self) -> Value {
        json!({
            "type": self.kind(),
            "url": self.url().map(|u| u.to_string()),
        })
    }
}

#[async_trait]
impl Stream for HlsStream {
    fn kind(&self) -> &'static str {
        "hls"
    }

    fn url(&self) -> Option<Url> {
        HlsStream::url(self)
    }

    async fn open(&self) -> Result<HlsReader, PluginError> {
        Ok(HlsStream::open(self).await?)
    }
}

/// Named streams in weight order, with `best`/`worst` resolved on lookup.
#[derive(Clone, Default)]
pub struct StreamSet {
    streams: Vec<(String, Arc<dyn Stream>)>,
}

impl std::fmt::Debug for StreamSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.streams.iter().map(|(name, _)| name))
            .finish()
    }
}

impl StreamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stream. A clashing name is stored as `{name}_alt`, `{name}_alt2`, ...
    pub fn push(&mut self, name: impl Into<String>, stream: Arc<dyn Stream>) -> &str {
        let name = name.into();
        let mut candidate = name.clone();
        let mut n = 1;
        while self.contains(&candidate) {
            candidate = if n == 1 {
                format!("{name}_alt")
            } else {
                format!("{name}_alt{n}")
            };
            n += 1;
        }

        self.streams.push((candidate.clone(), stream));
        self.streams.sort_by(|(a, _), (b, _)| {
            weight::stream_weight(a)
                .value
                .total_cmp(&weight::stream_weight(b).value)
        });

        let index = self
            .streams
            .iter()
            .position(|(n, _)| *n == candidate)
            .unwrap_or(self.streams.len() - 1);
        &self.streams[index].0
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.streams.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.streams.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Stream>)> {
        self.streams.iter().map(|(n, s)| (n.as_str(), s))
    }

    /// Looks up a concrete name or a `best`/`worst` synonym.
    pub fn get(&self, name: &str) -> Option<(&str, &Arc<dyn Stream>)> {
        let names = self.names();
        let target = match name {
            BEST => weight::best(&names)?,
            WORST => weight::worst(&names)?,
            other => other,
        };
        self.streams
            .iter()
            .find(|(n, _)| n == target)
            .map(|(n, s)| (n.as_str(), s))
    }

    /// First available entry of a comma-separated preference list.
    pub fn select(&self, preference: &str) -> Option<(&str, &Arc<dyn Stream>)> {
        let names = self.names();
        let chosen = weight::select(&names, preference)?;
        self.get(chosen)
    }

    /// `360p (worst), 720p, 1080p (best)`
    pub fn describe(&self) -> String {
        let names = self.names();
        let best = weight::best(&names);
        let worst = weight::worst(&names);
        names
            .iter()
            .map(|name| {
                let mut tags = Vec::new();
                if Some(*name) == worst {
                    tags.push(WORST);
                }
                if Some(*name) == best {
                    tags.push(BEST);
                }
                if tags.is_empty() {
                    name.to_string()
                } else {
                    format!("{name} ({})", tags.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn to_json(&self) -> Value {
        let streams: serde_json::Map<String, Value> = self
            .streams
            .iter()
            .map(|(name, stream)| (name.clone(), stream.to_json()))
            .collect();
        Value::Object(streams)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slink_engine::hls::HlsConfig;
    use slink_engine::{HttpSession, HttpSessionConfig};

    use super::*;

    fn hls(path: &str) -> Arc<dyn Stream> {
        let session = Arc::new(HttpSession::new(HttpSessionConfig::default()).unwrap());
        let url = Url::parse(&format!("https://cdn.example/{path}")).unwrap();
        Arc::new(HlsStream::new(session, url, HlsConfig::default()))
    }

    #[test]
    fn keeps_weight_order_and_renames_clashes() {
        let mut set = StreamSet::new();
        set.push("1080p", hls("a.m3u8"));
        set.push("360p", hls("b.m3u8"));
        assert_eq!(set.push("1080p", hls("c.m3u8")), "1080p_alt");
        set.push("audio_only", hls("d.m3u8"));

        assert_eq!(set.names(), vec!["audio_only", "360p", "1080p_alt", "1080p"]);
        assert_eq!(set.describe(), "audio_only, 360p (worst), 1080p_alt, 1080p (best)");
    }

    #[test]
    fn resolves_synonyms_and_preferences() {
        let mut set = StreamSet::new();
        set.push("720p", hls("720.m3u8"));
        set.push("360p", hls("360.m3u8"));

        let (name, stream) = set.get("best").unwrap();
        assert_eq!(name, "720p");
        assert_eq!(stream.url().unwrap().path(), "/720.m3u8");
        assert_eq!(set.select("480p,worst").unwrap().0, "360p");
        assert!(set.get("1080p").is_none());

        let json = set.to_json();
        assert_eq!(json["360p"]["type"], "hls");
        assert_eq!(json["720p"]["url"], "https://cdn.example/720.m3u8");
    }
}
