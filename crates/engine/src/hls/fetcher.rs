// HLS Segment Fetcher: downloads segments with bounded parallelism while
// handing them to the writer strictly in playlist order.
//
// For every queued segment the dispatcher pushes one slot into an ordered
// channel; the slot resolves once its download finishes. A download holds a
// semaphore permit until the writer has consumed its bytes, so at most
// `segment_threads` segments are in memory outside the ring buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderValue, RANGE};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::HttpError;
use crate::hls::config::HlsFetcherConfig;
use crate::hls::playlist::QueuedSegment;
use crate::hls::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use crate::hls::segment::Segment;
use crate::hls::HlsError;
use crate::http::{HttpSession, RequestOptions};

#[async_trait]
pub(crate) trait SegmentDownloader: Send + Sync {
    /// Downloads one segment, retrying transient failures.
    async fn download(&self, segment: &Segment, token: &CancellationToken)
    -> Result<Bytes, HlsError>;
}

pub(crate) struct SegmentFetcher {
    session: Arc<HttpSession>,
    config: HlsFetcherConfig,
    policy: RetryPolicy,
}

impl SegmentFetcher {
    pub(crate) fn new(session: Arc<HttpSession>, config: HlsFetcherConfig) -> Self {
        let policy = RetryPolicy::with_attempts(
            config.segment_attempts.max(1),
            config.retry_base_delay,
            config.retry_max_delay,
        )
        .with_jitter(config.retry_jitter);
        Self {
            session,
            config,
            policy,
        }
    }

    async fn fetch_once(&self, segment: &Segment) -> Result<Bytes, HttpError> {
        let mut options = RequestOptions::new()
            .timeout(self.config.segment_timeout)
            .no_retry();
        if let Some(range) = segment.byte_range {
            let value = HeaderValue::from_str(&range.header_value())
                .map_err(|e| HttpError::configuration(format!("invalid range header: {e}")))?;
            options = options.header(RANGE, value);
        }

        let response = self.session.get(segment.uri.as_str(), options).await?;
        Ok(response.bytes().await?)
    }
}

#[async_trait]
impl SegmentDownloader for SegmentFetcher {
    async fn download(
        &self,
        segment: &Segment,
        token: &CancellationToken,
    ) -> Result<Bytes, HlsError> {
        retry_with_backoff(&self.policy, token, |attempt| async move {
            trace!(sequence = segment.sequence, attempt, "Fetching segment");
            match self.fetch_once(segment).await {
                Ok(bytes) => RetryAction::Success(bytes),
                Err(e) => {
                    let retryable = e.is_retryable();
                    let err = HlsError::Segment {
                        sequence: segment.sequence,
                        source: e,
                    };
                    if retryable {
                        RetryAction::Retry(err)
                    } else {
                        RetryAction::Fail(err)
                    }
                }
            }
        })
        .await
    }
}

/// Outcome of one queued segment, consumed by the writer.
pub(crate) enum FetchOutcome {
    /// Downloaded bytes; the permit is released once the writer drops it.
    Data(Bytes, OwnedSemaphorePermit),
    /// Never downloaded.
    Filtered,
    Failed(HlsError),
}

/// Placeholder for a segment in playlist order.
pub(crate) struct FetchSlot {
    pub segment: Segment,
    pub outcome: oneshot::Receiver<FetchOutcome>,
}

/// Counters shared by the dispatcher and its download tasks.
#[derive(Debug, Default)]
pub(crate) struct FetchStats {
    pub started: AtomicU64,
    pub stale_dropped: AtomicU64,
}

/// Turns queued segments into ordered slots, starting at most
/// `threads` downloads at a time.
pub(crate) async fn run_dispatcher(
    downloader: Arc<dyn SegmentDownloader>,
    mut queue_rx: mpsc::Receiver<QueuedSegment>,
    slot_tx: mpsc::Sender<FetchSlot>,
    generation: Arc<AtomicU64>,
    threads: usize,
    stats: Arc<FetchStats>,
    token: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(threads.max(1)));

    loop {
        let queued = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            queued = queue_rx.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        if queued.generation < generation.load(Ordering::SeqCst) {
            debug!(sequence = queued.segment.sequence, "Dropping stale segment");
            stats.stale_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        let segment = queued.segment;
        let (outcome_tx, outcome_rx) = oneshot::channel();

        if segment.is_filtered() {
            let _ = outcome_tx.send(FetchOutcome::Filtered);
        } else {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            stats.started.fetch_add(1, Ordering::Relaxed);
            let downloader = downloader.clone();
            let task_segment = segment.clone();
            let task_token = token.clone();
            tokio::spawn(async move {
                let outcome = match downloader.download(&task_segment, &task_token).await {
                    Ok(bytes) => FetchOutcome::Data(bytes, permit),
                    Err(e) => FetchOutcome::Failed(e),
                };
                let _ = outcome_tx.send(outcome);
            });
        }

        let slot = FetchSlot {
            segment,
            outcome: outcome_rx,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            sent = slot_tx.send(slot) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Segment dispatcher finished");
}
