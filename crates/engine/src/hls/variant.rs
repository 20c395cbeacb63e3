use std::collections::HashSet;

use m3u8_rs::{MasterPlaylist, Playlist, VariantStream};
use tracing::debug;
use url::Url;

use crate::hls::HlsError;
use crate::http::{HttpSession, RequestOptions};

/// A named rendition from a master playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Quality name such as `720p`, `1080p60` or `2500k`
    pub name: String,
    pub url: Url,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    pub frame_rate: Option<f64>,
    pub codecs: Option<String>,
}

/// Fetches `url` and returns its variants. A media playlist yields a single
/// variant named `live`.
pub async fn parse_variant_playlist(
    session: &HttpSession,
    url: &Url,
) -> Result<Vec<Variant>, HlsError> {
    let response = session.get(url.as_str(), RequestOptions::new()).await?;
    let body = response.bytes().await.map_err(crate::error::HttpError::from)?;
    let playlist = m3u8_rs::parse_playlist_res(&body)
        .map_err(|e| HlsError::playlist(format!("failed to parse {url}: {e}")))?;

    match playlist {
        Playlist::MasterPlaylist(master) => Ok(name_variants(&master, url)),
        Playlist::MediaPlaylist(_) => Ok(vec![Variant {
            name: "live".to_string(),
            url: url.clone(),
            bandwidth: 0,
            resolution: None,
            frame_rate: None,
            codecs: None,
        }]),
    }
}

/// Names every non-I-frame variant of `master`.
///
/// Names come from the resolution height (`720p`, plus the frame rate when it
/// is above 30: `720p60`), or the bandwidth in kbit/s (`2500k`). Clashing
/// names get `_alt`, `_alt2`, ... suffixes.
pub fn name_variants(master: &MasterPlaylist, base_url: &Url) -> Vec<Variant> {
    let mut taken = HashSet::new();
    let mut variants = Vec::new();

    for stream in master.variants.iter().filter(|v| !v.is_i_frame) {
        let Some(base_name) = variant_name(stream) else {
            debug!(uri = %stream.uri, "Skipping variant without resolution or bandwidth");
            continue;
        };
        let url = match base_url.join(&stream.uri) {
            Ok(url) => url,
            Err(e) => {
                debug!(uri = %stream.uri, error = %e, "Skipping variant with invalid URI");
                continue;
            }
        };

        let mut name = base_name.clone();
        let mut n = 1;
        while taken.contains(&name) {
            name = if n == 1 {
                format!("{base_name}_alt")
            } else {
                format!("{base_name}_alt{n}")
            };
            n += 1;
        }
        taken.insert(name.clone());

        variants.push(Variant {
            name,
            url,
            bandwidth: stream.bandwidth,
            resolution: stream.resolution.as_ref().map(|r| (r.width, r.height)),
            frame_rate: stream.frame_rate,
            codecs: stream.codecs.clone(),
        });
    }

    variants
}

fn variant_name(stream: &VariantStream) -> Option<String> {
    if let Some(resolution) = stream.resolution.as_ref().filter(|r| r.height > 0) {
        let mut name = format!("{}p", resolution.height);
        if let Some(fps) = stream.frame_rate.filter(|fps| *fps > 30.0) {
            name.push_str(&format!("{}", fps.round() as u64));
        }
        return Some(name);
    }
    if stream.bandwidth > 0 {
        return Some(format!("{}k", (stream.bandwidth as f64 / 1000.0).round() as u64));
    }
    None
}

/// The variant with the highest bandwidth.
pub fn select_best_variant<'a>(master: &'a MasterPlaylist) -> Option<&'a VariantStream> {
    master
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .max_by_key(|v| v.bandwidth)
}
