// HLS Playlist Reloader: fetches the media playlist on a timer, works out
// which segments are new and queues them for the fetcher.
//
// Only segments with a sequence number above the last queued one are
// scheduled. A media sequence that goes backwards is treated as a playlist
// reset: queued-but-unfetched segments become stale and the next segment
// starts with a discontinuity.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use m3u8_rs::{MediaPlaylist, Playlist};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::HttpError;
use crate::hls::config::{HlsConfig, HlsPlaylistConfig, ReloadTime};
use crate::hls::segment::{ByteRange, Segment, SegmentClass, SegmentFilter};
use crate::hls::variant::select_best_variant;
use crate::hls::HlsError;
use crate::http::{HttpSession, RequestOptions};
use crate::token::PlaylistSource;

/// A segment on its way to the fetcher, tagged with the playlist generation
/// it was scheduled in.
#[derive(Debug, Clone)]
pub(crate) struct QueuedSegment {
    pub segment: Segment,
    pub generation: u64,
}

/// New segments found by one playlist reload.
#[derive(Debug, Default)]
pub struct QueueUpdate {
    pub segments: Vec<Segment>,
    /// The media sequence went backwards since the previous reload.
    pub reset: bool,
}

/// Tracks what has been queued across reloads.
#[derive(Debug, Default)]
pub struct QueueState {
    last_sequence: Option<u64>,
    last_media_sequence: Option<u64>,
}

impl QueueState {
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Computes the segments of `playlist` that have not been queued yet.
    pub fn update(
        &mut self,
        playlist: &MediaPlaylist,
        base_url: &Url,
        config: &HlsPlaylistConfig,
        filter: Option<&SegmentFilter>,
    ) -> Result<QueueUpdate, HlsError> {
        let first_load = self.last_media_sequence.is_none();
        let reset = self
            .last_media_sequence
            .is_some_and(|previous| playlist.media_sequence < previous);
        if reset {
            self.last_sequence = None;
        }
        self.last_media_sequence = Some(playlist.media_sequence);

        let start_index = if (first_load || reset) && !playlist.end_list {
            playlist.segments.len().saturating_sub(config.live_edge)
        } else {
            0
        };

        let mut segments: Vec<Segment> = Vec::new();
        let mut last_range: Option<(Url, u64)> = None;

        for (idx, media) in playlist.segments.iter().enumerate() {
            let sequence = playlist
                .media_sequence
                .checked_add(idx as u64)
                .ok_or_else(|| HlsError::playlist(format!("media sequence overflows at segment {idx}")))?;
            let uri = match base_url.join(&media.uri) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(sequence, uri = %media.uri, error = %e, "Skipping segment with invalid URI");
                    last_range = None;
                    continue;
                }
            };

            let byte_range = media.byte_range.as_ref().and_then(|range| {
                let offset = range.offset.or_else(|| {
                    last_range
                        .as_ref()
                        .filter(|(previous, _)| *previous == uri)
                        .map(|(_, end)| *end)
                })?;
                Some(ByteRange {
                    offset,
                    length: range.length,
                })
            });
            last_range = byte_range.map(|range| (uri.clone(), range.end()));

            if idx < start_index || self.last_sequence.is_some_and(|last| sequence <= last) {
                continue;
            }
            if media.byte_range.is_some() && byte_range.is_none() {
                warn!(sequence, %uri, "Skipping segment with BYTERANGE missing offset and no prior range");
                continue;
            }

            let mut discontinuity = media.discontinuity;
            if segments.is_empty() {
                if reset {
                    discontinuity = true;
                } else if let Some(last) = self.last_sequence
                    && sequence - last > 1
                {
                    warn!(from = last + 1, to = sequence - 1, "Segments fell off the playlist before being queued");
                    discontinuity = true;
                }
            }

            let mut segment = Segment {
                sequence,
                uri,
                duration: media.duration as f64,
                title: media.title.clone().filter(|t| !t.is_empty()),
                byte_range,
                discontinuity,
                class: SegmentClass::Playable,
            };
            if filter.is_some_and(|f| f.matches(&segment)) {
                segment.class = SegmentClass::Filtered;
            }
            segments.push(segment);
        }

        if let Some(last) = segments.last() {
            self.last_sequence = Some(last.sequence);
        }

        Ok(QueueUpdate { segments, reset })
    }
}

/// Upper bound for a single reload wait.
pub const MAX_RELOAD_DELAY: Duration = Duration::from_secs(600);

/// Time to wait before the next reload.
///
/// An unchanged playlist halves the wait; the result never drops below
/// `min_reload_delay`.
pub fn reload_delay(playlist: &MediaPlaylist, config: &HlsPlaylistConfig, changed: bool) -> Duration {
    let target = playlist.target_duration as f64;
    let secs = match config.reload_time {
        ReloadTime::Default => target,
        ReloadTime::Segment => playlist
            .segments
            .last()
            .map(|s| s.duration as f64)
            .unwrap_or(target),
        ReloadTime::LiveEdge => {
            let edge: f64 = playlist
                .segments
                .iter()
                .rev()
                .take(config.live_edge)
                .map(|s| s.duration as f64)
                .sum();
            if edge > 0.0 { edge } else { target }
        }
        ReloadTime::Seconds(secs) => secs,
    };

    let mut delay = Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(MAX_RELOAD_DELAY)
        .min(MAX_RELOAD_DELAY);
    if !changed {
        delay /= 2;
    }
    delay.max(config.min_reload_delay)
}

pub(crate) fn parse_media_or_master(body: &[u8], url: &Url) -> Result<Playlist, HlsError> {
    m3u8_rs::parse_playlist_res(body)
        .map_err(|e| HlsError::playlist(format!("failed to parse playlist {url}: {e}")))
}

pub(crate) struct PlaylistReloader {
    session: Arc<HttpSession>,
    source: Arc<dyn PlaylistSource>,
    config: Arc<HlsConfig>,
    generation: Arc<AtomicU64>,
    state: QueueState,
    /// Source URL and the media playlist URL chosen from it.
    resolved: Option<(Url, Url)>,
}

impl PlaylistReloader {
    pub(crate) fn new(
        session: Arc<HttpSession>,
        source: Arc<dyn PlaylistSource>,
        config: Arc<HlsConfig>,
        generation: Arc<AtomicU64>,
    ) -> Self {
        Self {
            session,
            source,
            config,
            generation,
            state: QueueState::default(),
            resolved: None,
        }
    }

    async fn fetch(&self, url: &Url) -> Result<Playlist, HlsError> {
        let options = RequestOptions::new()
            .timeout(self.config.playlist.playlist_timeout)
            .no_retry();
        let response = self.session.get(url.as_str(), options).await?;
        let body = response.bytes().await.map_err(HttpError::from)?;
        parse_media_or_master(&body, url)
    }

    /// Loads the media playlist behind `url`, resolving a master playlist to
    /// its highest-bandwidth variant.
    async fn load_media(&mut self, url: &Url) -> Result<(Url, MediaPlaylist), HlsError> {
        if let Some((source_url, media_url)) = &self.resolved
            && source_url == url
        {
            let media_url = media_url.clone();
            return match self.fetch(&media_url).await? {
                Playlist::MediaPlaylist(media) => Ok((media_url, media)),
                Playlist::MasterPlaylist(_) => Err(HlsError::playlist(format!(
                    "expected a media playlist at {media_url}"
                ))),
            };
        }

        match self.fetch(url).await? {
            Playlist::MediaPlaylist(media) => {
                self.resolved = Some((url.clone(), url.clone()));
                Ok((url.clone(), media))
            }
            Playlist::MasterPlaylist(master) => {
                let variant = select_best_variant(&master).ok_or_else(|| {
                    HlsError::playlist(format!("master playlist {url} has no variants"))
                })?;
                let media_url = url
                    .join(&variant.uri)
                    .map_err(|e| HlsError::playlist(format!("invalid variant URI: {e}")))?;
                debug!(%media_url, bandwidth = variant.bandwidth, "Selected media playlist");

                match self.fetch(&media_url).await? {
                    Playlist::MediaPlaylist(media) => {
                        self.resolved = Some((url.clone(), media_url.clone()));
                        Ok((media_url, media))
                    }
                    Playlist::MasterPlaylist(_) => Err(HlsError::playlist(format!(
                        "variant {media_url} is another master playlist"
                    ))),
                }
            }
        }
    }

    /// Reload loop. Returns `Ok` when the playlist ends, the source ends the
    /// stream, or the pipeline is cancelled.
    pub(crate) async fn run(
        mut self,
        segment_tx: mpsc::Sender<QueuedSegment>,
        token: CancellationToken,
    ) -> Result<(), HlsError> {
        let config = self.config.clone();
        let mut failures = 0u32;
        let mut refreshes = 0u32;

        loop {
            let url = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                url = self.source.playlist_url() => url,
            };

            let loaded = match url {
                Ok(url) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(()),
                    loaded = self.load_media(&url) => loaded,
                },
                Err(e) => Err(e),
            };

            let (media_url, playlist) = match loaded {
                Ok(loaded) => loaded,
                Err(HlsError::SourceEnded) => {
                    info!("Playlist source ended, finishing stream");
                    return Ok(());
                }
                Err(HlsError::Cancelled) => return Ok(()),
                Err(e) if e.needs_refresh() => {
                    refreshes += 1;
                    if refreshes > config.playlist.refresh_attempts {
                        return Err(HlsError::RefreshExhausted {
                            attempts: config.playlist.refresh_attempts,
                        });
                    }
                    warn!(error = %e, attempt = refreshes, "Playlist URL rejected, refreshing");
                    self.source.invalidate();
                    self.resolved = None;
                    continue;
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %e,
                        attempt = failures,
                        max = config.playlist.reload_attempts,
                        "Failed to reload playlist"
                    );
                    if failures >= config.playlist.reload_attempts {
                        return Err(HlsError::ReloadExhausted {
                            attempts: failures,
                            last: e.to_string(),
                        });
                    }
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(config.playlist.min_reload_delay) => {}
                    }
                    continue;
                }
            };

            failures = 0;
            refreshes = 0;

            let update = self.state.update(
                &playlist,
                &media_url,
                &config.playlist,
                config.filter.as_ref(),
            )?;
            if update.reset {
                warn!(
                    media_sequence = playlist.media_sequence,
                    "Playlist media sequence went backwards, dropping stale segments"
                );
                self.generation.fetch_add(1, Ordering::SeqCst);
            }
            let generation = self.generation.load(Ordering::SeqCst);
            let changed = !update.segments.is_empty();

            for segment in update.segments {
                debug!(sequence = segment.sequence, uri = %segment.uri, "Queueing segment");
                let queued = QueuedSegment {
                    segment,
                    generation,
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(()),
                    sent = segment_tx.send(queued) => {
                        if sent.is_err() {
                            debug!("Segment queue closed, stopping reloader");
                            return Ok(());
                        }
                    }
                }
            }

            if playlist.end_list {
                info!(url = %media_url, "Playlist ended");
                return Ok(());
            }

            let delay = reload_delay(&playlist, &config.playlist, changed);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for next reload");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_media_playlist(input: &str) -> MediaPlaylist {
        match m3u8_rs::parse_playlist_res(input.as_bytes()) {
            Ok(Playlist::MediaPlaylist(playlist)) => playlist,
            other => panic!("expected media playlist, got {other:?}"),
        }
    }

    fn live_playlist(media_sequence: u64, count: usize) -> MediaPlaylist {
        let mut text = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"
        );
        for i in 0..count {
            text.push_str(&format!("#EXTINF:4.000,\nseg{}.ts\n", media_sequence + i as u64));
        }
        parse_media_playlist(&text)
    }

    fn base() -> Url {
        Url::parse("https://cdn.example/live/index.m3u8").unwrap()
    }

    fn sequences(update: &QueueUpdate) -> Vec<u64> {
        update.segments.iter().map(|s| s.sequence).collect()
    }

    #[test]
    fn first_live_load_starts_at_live_edge() {
        let mut state = QueueState::default();
        let update = state.update(&live_playlist(10, 6), &base(), &HlsPlaylistConfig::default(), None).unwrap();
        assert_eq!(sequences(&update), vec![13, 14, 15]);
        assert_eq!(update.segments[0].uri.as_str(), "https://cdn.example/live/seg13.ts");
    }

    #[test]
    fn reloads_only_queue_newer_segments() {
        let config = HlsPlaylistConfig::default();
        let mut state = QueueState::default();
        state.update(&live_playlist(10, 6), &base(), &config, None).unwrap();

        let update = state.update(&live_playlist(12, 6), &base(), &config, None).unwrap();
        assert_eq!(sequences(&update), vec![16, 17]);
        assert!(!update.segments[0].discontinuity);

        let unchanged = state.update(&live_playlist(12, 6), &base(), &config, None).unwrap();
        assert!(unchanged.segments.is_empty());
    }

    #[test]
    fn sequence_gap_marks_discontinuity() {
        let config = HlsPlaylistConfig::default();
        let mut state = QueueState::default();
        state.update(&live_playlist(10, 3), &base(), &config, None).unwrap();

        let update = state.update(&live_playlist(20, 3), &base(), &config, None).unwrap();
        assert_eq!(sequences(&update), vec![20, 21, 22]);
        assert!(update.segments[0].discontinuity);
        assert!(!update.segments[1].discontinuity);
    }

    #[test]
    fn media_sequence_going_backwards_is_a_reset() {
        let config = HlsPlaylistConfig::default();
        let mut state = QueueState::default();
        state.update(&live_playlist(100, 3), &base(), &config, None).unwrap();

        let update = state.update(&live_playlist(0, 5), &base(), &config, None).unwrap();
        assert!(update.reset);
        assert_eq!(sequences(&update), vec![2, 3, 4]);
        assert!(update.segments[0].discontinuity);
        assert_eq!(state.last_sequence(), Some(4));
    }

    #[test]
    fn vod_playlist_queues_everything_and_classifies() {
        let playlist = parse_media_playlist(
            "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXT-X-MEDIA-SEQUENCE:5
#EXTINF:2.0,
seg5.ts
#EXTINF:2.0,
/blank/ad.ts
#EXTINF:2.0,
seg6.ts
#EXT-X-ENDLIST
",
        );
        let filter = SegmentFilter::uri_contains("/blank/");
        let mut state = QueueState::default();
        let update = state.update(&playlist, &base(), &HlsPlaylistConfig::default(), Some(&filter)).unwrap();

        let classes: Vec<_> = update.segments.iter().map(|s| s.class).collect();
        assert_eq!(
            classes,
            vec![SegmentClass::Playable, SegmentClass::Filtered, SegmentClass::Playable]
        );
        assert_eq!(update.segments[1].uri.as_str(), "https://cdn.example/blank/ad.ts");
    }

    #[test]
    fn byterange_offsets_are_inferred() {
        let playlist = parse_media_playlist(
            "#EXTM3U
#EXT-X-TARGETDURATION:2
#EXTINF:2.0,
#EXT-X-BYTERANGE:100@0
media.mp4
#EXTINF:2.0,
#EXT-X-BYTERANGE:50
media.mp4
#EXT-X-ENDLIST
",
        );
        let mut state = QueueState::default();
        let update = state.update(&playlist, &base(), &HlsPlaylistConfig::default(), None).unwrap();
        let ranges: Vec<_> = update.segments.iter().map(|s| s.byte_range).collect();
        assert_eq!(
            ranges,
            vec![
                Some(ByteRange { offset: 0, length: 100 }),
                Some(ByteRange { offset: 100, length: 50 }),
            ]
        );
    }

    #[test]
    fn reload_delay_modes() {
        let playlist = parse_media_playlist(
            "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXTINF:6.0,
a.ts
#EXTINF:5.0,
b.ts
#EXTINF:2.0,
c.ts
",
        );
        let mut config = HlsPlaylistConfig::default();
        assert_eq!(reload_delay(&playlist, &config, true), Duration::from_secs(6));
        assert_eq!(reload_delay(&playlist, &config, false), Duration::from_secs(3));

        config.reload_time = ReloadTime::Segment;
        assert_eq!(reload_delay(&playlist, &config, true), Duration::from_secs(2));
        assert_eq!(reload_delay(&playlist, &config, false), Duration::from_secs(1));

        config.reload_time = ReloadTime::LiveEdge;
        assert_eq!(reload_delay(&playlist, &config, true), Duration::from_secs(13));

        config.reload_time = ReloadTime::Seconds(0.2);
        assert_eq!(reload_delay(&playlist, &config, true), Duration::from_secs(1));
    }

    #[test]
    fn huge_target_duration_is_clamped() {
        let playlist = parse_media_playlist(
            "#EXTM3U
#EXT-X-TARGETDURATION:18446744073709551615
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:4.0,
a.ts
",
        );
        let config = HlsPlaylistConfig::default();
        assert_eq!(reload_delay(&playlist, &config, true), MAX_RELOAD_DELAY);
        assert_eq!(reload_delay(&playlist, &config, false), MAX_RELOAD_DELAY / 2);
    }

    #[test]
    fn media_sequence_overflow_is_a_playlist_error() {
        let playlist = parse_media_playlist(
            "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:18446744073709551615
#EXTINF:4.0,
a.ts
#EXTINF:4.0,
b.ts
#EXT-X-ENDLIST
",
        );
        let mut state = QueueState::default();
        let err = state
            .update(&playlist, &base(), &HlsPlaylistConfig::default(), None)
            .unwrap_err();
        assert!(matches!(err, HlsError::Playlist { .. }));
    }
}
