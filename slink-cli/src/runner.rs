// Runner: copies the ring buffer into the chosen output until the stream ends
// or the reading side goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use slink_engine::RingBuffer;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{CliError, Result};
use crate::output::{Output, OutputKind, PlayerMonitor, is_downstream_closed};
use crate::progress::Progress;

/// Bytes moved per read.
pub const CHUNK_SIZE: usize = 8192;

/// How a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ended,
    PlayerClosed,
    HttpClosed,
}

/// Logs "Player closed" once, whether the exit was seen by the poll task or
/// by a failed write.
#[derive(Debug, Clone, Default)]
pub struct PlayerClosedGuard {
    reported: Arc<AtomicBool>,
}

impl PlayerClosedGuard {
    /// Returns true for the call that logged.
    pub fn report(&self) -> bool {
        let first = !self.reported.swap(true, Ordering::AcqRel);
        if first {
            info!("Player closed");
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.reported.load(Ordering::Acquire)
    }
}

pub struct StreamRunner {
    buffer: RingBuffer,
    output: Output,
    progress: Option<Progress>,
    guard: PlayerClosedGuard,
}

impl StreamRunner {
    pub fn new(buffer: RingBuffer, output: Output, progress: Option<Progress>) -> Self {
        Self {
            buffer,
            output,
            progress,
            guard: PlayerClosedGuard::default(),
        }
    }

    pub fn guard(&self) -> PlayerClosedGuard {
        self.guard.clone()
    }

    /// Writes `prebuffer` and then everything the buffer yields. The output
    /// is closed and the progress line finished on every path.
    pub async fn run(mut self, prebuffer: Bytes) -> Result<RunOutcome> {
        let poll = self
            .output
            .player_monitor()
            .map(|monitor| spawn_player_poll(monitor, self.buffer.clone(), self.guard.clone()));

        let result = self.copy(prebuffer).await;

        if let Some(poll) = poll {
            poll.abort();
        }
        if let Err(e) = self.output.close().await {
            debug!(error = %e, "Failed to close output");
        }
        if let Some(progress) = self.progress.as_mut() {
            progress.finish().await;
        }
        self.buffer.close();
        result
    }

    async fn copy(&mut self, prebuffer: Bytes) -> Result<RunOutcome> {
        if !prebuffer.is_empty()
            && let Some(outcome) = self.write(&prebuffer).await?
        {
            return Ok(outcome);
        }

        loop {
            if self.guard.is_closed() {
                return Ok(RunOutcome::PlayerClosed);
            }

            let data = match self.buffer.read(CHUNK_SIZE).await {
                Ok(data) => data,
                Err(e) => {
                    error!("Error when reading from stream: {e}, exiting");
                    return Err(CliError::Read(e));
                }
            };

            if data.is_empty() {
                if self.guard.is_closed() {
                    return Ok(RunOutcome::PlayerClosed);
                }
                info!("Stream ended");
                return Ok(RunOutcome::Ended);
            }

            if let Some(outcome) = self.write(&data).await? {
                return Ok(outcome);
            }
        }
    }

    /// `Ok(Some(_))` when the output went away cleanly.
    async fn write(&mut self, data: &[u8]) -> Result<Option<RunOutcome>> {
        match self.output.write(data).await {
            Ok(()) => {
                if let Some(progress) = &self.progress {
                    progress.add(data.len());
                }
                Ok(None)
            }
            Err(e) if is_downstream_closed(&e) => match self.output.kind() {
                OutputKind::Player => {
                    self.guard.report();
                    Ok(Some(RunOutcome::PlayerClosed))
                }
                OutputKind::Http => {
                    info!("HTTP connection closed");
                    Ok(Some(RunOutcome::HttpClosed))
                }
                OutputKind::File => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// Closes the buffer as soon as the player exits so a blocked read returns.
fn spawn_player_poll(monitor: PlayerMonitor, buffer: RingBuffer, guard: PlayerClosedGuard) -> JoinHandle<()> {
    let closed = buffer.close_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = monitor.exited() => {
                guard.report();
                buffer.close();
            }
            _ = closed.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::FileOutput;

    #[test]
    fn player_closed_is_reported_once() {
        let guard = PlayerClosedGuard::default();
        let other = guard.clone();
        assert!(guard.report());
        assert!(!other.report());
        assert!(other.is_closed());
    }

    #[tokio::test]
    async fn copies_prebuffer_then_buffer_into_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let output = Output::File(FileOutput::create(&path, false).await.unwrap());

        let buffer = RingBuffer::new(64);
        buffer.write(Bytes::from_static(b"world")).await.unwrap();
        buffer.close();

        let outcome = StreamRunner::new(buffer, output, None)
            .run(Bytes::from_static(b"hello "))
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Ended);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn read_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let output = Output::File(FileOutput::create(&dir.path().join("out.bin"), false).await.unwrap());

        let buffer = RingBuffer::new(64);
        buffer.write(Bytes::from_static(b"partial")).await.unwrap();
        buffer.close_with_error("segment fetch failed");

        let err = StreamRunner::new(buffer, output, None)
            .run(Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Read(_)));
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().starts_with("Error when reading from stream"));
    }

    #[tokio::test]
    async fn counts_written_bytes_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let output = Output::File(FileOutput::create(&path, false).await.unwrap());

        let buffer = RingBuffer::new(64);
        buffer.write(Bytes::from_static(b"0123456789")).await.unwrap();
        buffer.close();

        let progress = Progress::start(Some(&path));
        let written = {
            let mut runner = StreamRunner::new(buffer, output, Some(progress));
            let outcome = runner.copy(Bytes::from_static(b"ab")).await.unwrap();
            assert_eq!(outcome, RunOutcome::Ended);
            runner.progress.as_ref().map(Progress::written)
        };
        assert_eq!(written, Some(12));
    }
}
