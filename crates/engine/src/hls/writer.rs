// HLS Segment Writer: consumes fetch slots in playlist order and appends
// segment bytes to the ring buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::buffer::RingBuffer;
use crate::error::BufferError;
use crate::hls::fetcher::{FetchOutcome, FetchSlot};
use crate::hls::HlsError;

/// Progress counters of the writer.
#[derive(Debug, Default)]
pub struct WriterStats {
    /// Segments taken off the queue, filtered ones included
    pub segments_seen: AtomicU64,
    pub segments_written: AtomicU64,
    pub segments_filtered: AtomicU64,
    pub segments_skipped: AtomicU64,
    pub discontinuities: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl WriterStats {
    pub fn segments_seen(&self) -> u64 {
        self.segments_seen.load(Ordering::Relaxed)
    }

    pub fn segments_written(&self) -> u64 {
        self.segments_written.load(Ordering::Relaxed)
    }

    pub fn segments_filtered(&self) -> u64 {
        self.segments_filtered.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

pub(crate) struct SegmentWriter {
    buffer: RingBuffer,
    stats: Arc<WriterStats>,
    max_gone_skips: u32,
}

impl SegmentWriter {
    pub(crate) fn new(buffer: RingBuffer, stats: Arc<WriterStats>, max_gone_skips: u32) -> Self {
        Self {
            buffer,
            stats,
            max_gone_skips,
        }
    }

    /// Writes slots until the queue drains (`Ok`), the buffer closes (`Ok`),
    /// or a segment fails for good (`Err`).
    pub(crate) async fn run(
        self,
        mut slot_rx: mpsc::Receiver<FetchSlot>,
        token: CancellationToken,
    ) -> Result<(), HlsError> {
        let mut last_sequence: Option<u64> = None;
        let mut pending_discontinuity = false;
        let mut consecutive_gone = 0u32;

        loop {
            let slot = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                slot = slot_rx.recv() => match slot {
                    Some(slot) => slot,
                    None => return Ok(()),
                },
            };

            let segment = slot.segment;
            self.stats.segments_seen.fetch_add(1, Ordering::Relaxed);
            if segment.discontinuity
                || last_sequence.is_some_and(|last| last.checked_add(1) != Some(segment.sequence))
            {
                pending_discontinuity = true;
            }
            last_sequence = Some(segment.sequence);

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                outcome = slot.outcome => outcome.unwrap_or(FetchOutcome::Failed(HlsError::Cancelled)),
            };

            match outcome {
                FetchOutcome::Filtered => {
                    debug!(sequence = segment.sequence, "Filtering out segment");
                    self.stats.segments_filtered.fetch_add(1, Ordering::Relaxed);
                    pending_discontinuity = true;
                }
                FetchOutcome::Data(bytes, _permit) => {
                    consecutive_gone = 0;
                    if pending_discontinuity && self.stats.segments_written() > 0 {
                        if self.buffer.mark_discontinuity().is_err() {
                            return Ok(());
                        }
                        self.stats.discontinuities.fetch_add(1, Ordering::Relaxed);
                    }
                    pending_discontinuity = false;

                    let len = bytes.len() as u64;
                    match self.buffer.write(bytes).await {
                        Ok(()) => {}
                        Err(BufferError::Closed) | Err(BufferError::Stream { .. }) => {
                            debug!("Ring buffer closed, stopping writer");
                            return Ok(());
                        }
                    }
                    self.stats.segments_written.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_written.fetch_add(len, Ordering::Relaxed);
                    debug!(sequence = segment.sequence, bytes = len, "Segment written");
                }
                FetchOutcome::Failed(HlsError::Cancelled) => return Ok(()),
                FetchOutcome::Failed(e) if e.is_segment_gone() => {
                    consecutive_gone += 1;
                    if consecutive_gone > self.max_gone_skips {
                        return Err(HlsError::TooManySkipped {
                            count: consecutive_gone,
                        });
                    }
                    warn!(sequence = segment.sequence, error = %e, "Skipping unavailable segment");
                    self.stats.segments_skipped.fetch_add(1, Ordering::Relaxed);
                    pending_discontinuity = true;
                }
                FetchOutcome::Failed(e) => return Err(e),
            }
        }
    }
}
