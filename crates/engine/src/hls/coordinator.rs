// HLS Stream Coordinator: wires the reloader, dispatcher and writer to a
// ring buffer and spawns them.
//
// The ring buffer's close token is the pipeline's cancellation token, so
// closing the reader tears every task down, and a failing task closes the
// buffer with its error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use url::Url;

use crate::buffer::{ReadItem, RingBuffer};
use crate::error::BufferError;
use crate::hls::HlsError;
use crate::hls::config::HlsConfig;
use crate::hls::fetcher::{FetchStats, SegmentDownloader, SegmentFetcher, run_dispatcher};
use crate::hls::playlist::PlaylistReloader;
use crate::hls::writer::{SegmentWriter, WriterStats};
use crate::http::HttpSession;
use crate::token::{PlaylistSource, StaticPlaylistSource};

/// An openable HLS stream.
#[derive(Clone)]
pub struct HlsStream {
    session: Arc<HttpSession>,
    source: Arc<dyn PlaylistSource>,
    config: Arc<HlsConfig>,
}

impl std::fmt::Debug for HlsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HlsStream")
            .field("url", &self.source.current_url().map(|u| u.to_string()))
            .finish()
    }
}

impl HlsStream {
    pub fn new(session: Arc<HttpSession>, url: Url, config: HlsConfig) -> Self {
        Self::with_source(session, Arc::new(StaticPlaylistSource::new(url)), config)
    }

    pub fn with_source(
        session: Arc<HttpSession>,
        source: Arc<dyn PlaylistSource>,
        config: HlsConfig,
    ) -> Self {
        Self {
            session,
            source,
            config: Arc::new(config),
        }
    }

    /// The current playlist URL, if known.
    pub fn url(&self) -> Option<Url> {
        self.source.current_url()
    }

    pub fn config(&self) -> &HlsConfig {
        &self.config
    }

    /// Starts the pipeline and returns the reading end.
    ///
    /// Fails if the playlist source cannot produce a URL, e.g. when a site
    /// session never becomes ready.
    pub async fn open(&self) -> Result<HlsReader, HlsError> {
        let url = self.source.playlist_url().await?;
        debug!(%url, "Opening HLS stream");

        let config = self.config.clone();
        let buffer = RingBuffer::new(config.output.buffer_size);
        let token = buffer.close_token();
        let threads = config.fetcher.segment_threads.max(1);
        let generation = Arc::new(AtomicU64::new(0));
        let writer_stats = Arc::new(WriterStats::default());
        let fetch_stats = Arc::new(FetchStats::default());

        let (queue_tx, queue_rx) = mpsc::channel(config.playlist.live_edge.max(1) + threads * 2);
        let (slot_tx, slot_rx) = mpsc::channel(threads);

        let reloader = PlaylistReloader::new(
            self.session.clone(),
            self.source.clone(),
            config.clone(),
            generation.clone(),
        );
        let reloader_buffer = buffer.clone();
        let reloader_token = token.clone();
        let reloader = tokio::spawn(async move {
            if let Err(e) = reloader.run(queue_tx, reloader_token).await {
                error!(error = %e, "Playlist reloader failed");
                reloader_buffer.close_with_error(e.to_string());
            }
            debug!("Playlist reloader finished");
        });

        let downloader: Arc<dyn SegmentDownloader> = Arc::new(SegmentFetcher::new(
            self.session.clone(),
            config.fetcher.clone(),
        ));
        let dispatcher_stats = fetch_stats.clone();
        let dispatcher = tokio::spawn(run_dispatcher(
            downloader,
            queue_rx,
            slot_tx,
            generation,
            threads,
            dispatcher_stats,
            token.clone(),
        ));

        let writer = SegmentWriter::new(
            buffer.clone(),
            writer_stats.clone(),
            config.output.max_gone_skips,
        );
        let writer_buffer = buffer.clone();
        let writer_token = token.clone();
        let writer = tokio::spawn(async move {
            if let Err(e) = writer.run(slot_rx, writer_token).await {
                error!(error = %e, "Segment writer failed");
                writer_buffer.close_with_error(e.to_string());
            }
            debug!(
                downloads = fetch_stats.started.load(Ordering::Relaxed),
                stale = fetch_stats.stale_dropped.load(Ordering::Relaxed),
                "Segment writer finished"
            );
        });

        tokio::spawn(supervise(
            [
                ("playlist reloader", reloader),
                ("segment dispatcher", dispatcher),
                ("segment writer", writer),
            ],
            buffer.clone(),
        ));

        let source = self.source.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            source.close();
        });

        Ok(HlsReader {
            buffer,
            stats: writer_stats,
        })
    }
}

/// Fails the stream as soon as `handle` panics.
fn watch(name: &'static str, handle: JoinHandle<()>, buffer: RingBuffer) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handle.await
            && e.is_panic()
        {
            error!(task = name, "HLS task panicked");
            buffer.close_with_error(format!("{name} panicked"));
        }
    })
}

/// Ends the stream once every pipeline task is done. A task that failed or
/// panicked has already closed the buffer with its error.
async fn supervise<const N: usize>(tasks: [(&'static str, JoinHandle<()>); N], buffer: RingBuffer) {
    let watchers: Vec<_> = tasks
        .into_iter()
        .map(|(name, handle)| watch(name, handle, buffer.clone()))
        .collect();
    for watcher in watchers {
        let _ = watcher.await;
    }
    buffer.close();
}

/// Reading end of an opened HLS stream. Dropping it closes the stream.
#[derive(Debug)]
pub struct HlsReader {
    buffer: RingBuffer,
    stats: Arc<WriterStats>,
}

impl HlsReader {
    /// Reads up to `max` bytes; an empty result means the stream ended.
    pub async fn read(&self, max: usize) -> Result<Bytes, BufferError> {
        self.buffer.read(max).await
    }

    /// Reads bytes or discontinuity markers.
    pub async fn read_item(&self, max: usize) -> Result<Option<ReadItem>, BufferError> {
        self.buffer.read_item(max).await
    }

    pub fn buffer(&self) -> &RingBuffer {
        &self.buffer
    }

    pub fn stats(&self) -> &Arc<WriterStats> {
        &self.stats
    }

    pub fn close(&self) {
        self.buffer.close();
    }
}

impl Drop for HlsReader {
    fn drop(&mut self) {
        self.buffer.close();
    }
}
