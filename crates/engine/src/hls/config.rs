use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::buffer::DEFAULT_BUFFER_SIZE;
use crate::hls::segment::SegmentFilter;

/// Upper bound for parallel segment downloads.
pub const MAX_SEGMENT_THREADS: usize = 10;

/// How long the reloader waits between playlist fetches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ReloadTime {
    /// The playlist's target duration
    #[default]
    Default,
    /// Duration of the last segment in the playlist
    Segment,
    /// Sum of the durations of the segments inside the live edge
    LiveEdge,
    /// A fixed number of seconds
    Seconds(f64),
}

impl FromStr for ReloadTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "segment" => Ok(Self::Segment),
            "live-edge" | "liveedge" => Ok(Self::LiveEdge),
            other => match other.parse::<f64>() {
                Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Self::Seconds(secs)),
                _ => Err(format!(
                    "invalid reload time `{s}`: expected default, segment, live-edge or a positive number"
                )),
            },
        }
    }
}

impl fmt::Display for ReloadTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Segment => f.write_str("segment"),
            Self::LiveEdge => f.write_str("live-edge"),
            Self::Seconds(secs) => write!(f, "{secs}"),
        }
    }
}

/// Playlist reloader settings
#[derive(Debug, Clone)]
pub struct HlsPlaylistConfig {
    /// Number of segments from the end of a live playlist to start at
    pub live_edge: usize,
    /// Reload interval mode
    pub reload_time: ReloadTime,
    /// Lower bound for the reload interval
    pub min_reload_delay: Duration,
    /// Consecutive failed reloads before the stream is aborted
    pub reload_attempts: u32,
    /// Consecutive URL refreshes (HTTP 403/502) before the stream is aborted
    pub refresh_attempts: u32,
    /// Timeout for a single playlist request
    pub playlist_timeout: Duration,
}

impl Default for HlsPlaylistConfig {
    fn default() -> Self {
        Self {
            live_edge: 3,
            reload_time: ReloadTime::Default,
            min_reload_delay: Duration::from_secs(1),
            reload_attempts: 3,
            refresh_attempts: 5,
            playlist_timeout: Duration::from_secs(10),
        }
    }
}

/// Segment fetcher settings
#[derive(Debug, Clone)]
pub struct HlsFetcherConfig {
    /// Parallel downloads, 1..=10
    pub segment_threads: usize,
    /// Attempts per segment, including the first
    pub segment_attempts: u32,
    /// Base delay for the exponential backoff between attempts
    pub retry_base_delay: Duration,
    /// Cap on the backoff delay
    pub retry_max_delay: Duration,
    /// Randomise backoff delays so parallel downloads do not retry in step
    pub retry_jitter: bool,
    /// Timeout for a single segment request
    pub segment_timeout: Duration,
}

impl Default for HlsFetcherConfig {
    fn default() -> Self {
        Self {
            segment_threads: 1,
            segment_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(5),
            retry_jitter: true,
            segment_timeout: Duration::from_secs(10),
        }
    }
}

/// Writer and ring buffer settings
#[derive(Debug, Clone)]
pub struct HlsOutputConfig {
    /// Ring buffer capacity in bytes
    pub buffer_size: usize,
    /// Consecutive HTTP 403/410 segments skipped before the stream fails
    pub max_gone_skips: u32,
}

impl Default for HlsOutputConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_gone_skips: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HlsConfig {
    pub playlist: HlsPlaylistConfig,
    pub fetcher: HlsFetcherConfig,
    pub output: HlsOutputConfig,
    /// Marks segments that are not downloaded (ads, placeholders)
    pub filter: Option<SegmentFilter>,
}

impl HlsConfig {
    pub fn with_segment_threads(mut self, threads: usize) -> Self {
        self.fetcher.segment_threads = threads.clamp(1, MAX_SEGMENT_THREADS);
        self
    }

    pub fn with_live_edge(mut self, live_edge: usize) -> Self {
        self.playlist.live_edge = live_edge.max(1);
        self
    }

    pub fn with_reload_time(mut self, reload_time: ReloadTime) -> Self {
        self.playlist.reload_time = reload_time;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.output.buffer_size = size.max(1);
        self
    }

    pub fn with_filter(mut self, filter: SegmentFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}
