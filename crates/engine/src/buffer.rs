// Ring Buffer: bounded byte queue between the segment writer and the output.
//
// Writers block while the buffer is full, readers block while it is empty.
// Closing is idempotent, wakes every waiter and cancels the close token so
// the tasks feeding the buffer shut down with it.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::BufferError;

/// Default capacity: 16 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// One unit handed to the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadItem {
    Data(Bytes),
    /// Zero-byte marker at a discontinuity between segments.
    Discontinuity,
}

#[derive(Debug)]
enum Entry {
    Data(Bytes),
    Discontinuity,
}

#[derive(Debug)]
struct State {
    entries: VecDeque<Entry>,
    /// Buffered payload bytes; markers do not count.
    len: usize,
    closed: bool,
    error: Option<String>,
}

#[derive(Debug)]
struct Shared {
    capacity: usize,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
    closed: CancellationToken,
}

/// A cloneable handle to a bounded FIFO of bytes.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    inner: Arc<Shared>,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Shared {
                capacity: capacity.max(1),
                state: Mutex::new(State {
                    entries: VecDeque::new(),
                    len: 0,
                    closed: false,
                    error: None,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.state.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Token cancelled when the buffer closes.
    pub fn close_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Appends `data`, waiting for free space as needed. Large writes are
    /// accepted piecewise as the reader frees space.
    ///
    /// Fails with [`BufferError::Closed`] once the buffer is closed; bytes
    /// accepted before that stay readable.
    pub async fn write(&self, mut data: Bytes) -> Result<(), BufferError> {
        while !data.is_empty() {
            let notified = self.inner.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(BufferError::Closed);
                }
                let free = self.inner.capacity - state.len;
                if free > 0 {
                    let chunk = data.split_to(free.min(data.len()));
                    state.len += chunk.len();
                    state.entries.push_back(Entry::Data(chunk));
                    drop(state);
                    self.inner.readable.notify_waiters();
                    continue;
                }
            }

            notified.await;
        }
        Ok(())
    }

    /// Queues a discontinuity marker after the bytes written so far.
    pub fn mark_discontinuity(&self) -> Result<(), BufferError> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(BufferError::Closed);
        }
        state.entries.push_back(Entry::Discontinuity);
        drop(state);
        self.inner.readable.notify_waiters();
        Ok(())
    }

    /// Reads up to `max` bytes, skipping discontinuity markers.
    ///
    /// An empty result means end of stream.
    pub async fn read(&self, max: usize) -> Result<Bytes, BufferError> {
        loop {
            match self.read_item(max).await? {
                Some(ReadItem::Data(data)) => return Ok(data),
                Some(ReadItem::Discontinuity) => continue,
                None => return Ok(Bytes::new()),
            }
        }
    }

    /// Reads the next item: up to `max` bytes, or a discontinuity marker.
    ///
    /// Returns `Ok(None)` once the buffer is closed and drained, or the
    /// producer's error if it closed with one.
    pub async fn read_item(&self, max: usize) -> Result<Option<ReadItem>, BufferError> {
        let max = max.max(1);
        loop {
            let notified = self.inner.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(entry) = state.entries.front_mut() {
                    let item = match entry {
                        Entry::Discontinuity => {
                            state.entries.pop_front();
                            return Ok(Some(ReadItem::Discontinuity));
                        }
                        Entry::Data(data) if data.len() <= max => {
                            let data = std::mem::take(data);
                            state.entries.pop_front();
                            data
                        }
                        Entry::Data(data) => data.split_to(max),
                    };
                    state.len -= item.len();
                    drop(state);
                    self.inner.writable.notify_waiters();
                    return Ok(Some(ReadItem::Data(item)));
                }

                if state.closed {
                    return match &state.error {
                        Some(reason) => Err(BufferError::Stream {
                            reason: reason.clone(),
                        }),
                        None => Ok(None),
                    };
                }
            }

            notified.await;
        }
    }

    /// Closes the buffer. Buffered bytes remain readable.
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Closes the buffer; readers get `reason` after draining buffered bytes.
    pub fn close_with_error(&self, reason: impl Into<String>) {
        self.close_inner(Some(reason.into()));
    }

    fn close_inner(&self, error: Option<String>) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.error = error;
        }
        self.inner.readable.notify_waiters();
        self.inner.writable.notify_waiters();
        self.inner.closed.cancel();
    }

    /// Waits until the buffer is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    const MIB: usize = 1024 * 1024;

    #[tokio::test]
    async fn reads_return_bytes_in_write_order() {
        let buffer = RingBuffer::new(64);
        buffer.write(Bytes::from_static(b"hello ")).await.unwrap();
        buffer.write(Bytes::from_static(b"world")).await.unwrap();
        buffer.close();

        let mut out = Vec::new();
        loop {
            let chunk = buffer.read(4).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn writer_blocks_at_capacity() {
        let buffer = RingBuffer::new(2 * MIB);
        let writer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for byte in [b'a', b'b', b'c'] {
                    buffer.write(Bytes::from(vec![byte; MIB])).await?;
                }
                Ok::<_, BufferError>(())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(buffer.len(), 2 * MIB);
        assert!(!writer.is_finished());

        let mut total = Vec::with_capacity(3 * MIB);
        while total.len() < 3 * MIB {
            total.extend_from_slice(&buffer.read(64 * 1024).await.unwrap());
        }
        writer.await.unwrap().unwrap();

        assert!(total[..MIB].iter().all(|b| *b == b'a'));
        assert!(total[MIB..2 * MIB].iter().all(|b| *b == b'b'));
        assert!(total[2 * MIB..].iter().all(|b| *b == b'c'));
    }

    #[tokio::test]
    async fn close_wakes_blocked_writer() {
        let buffer = RingBuffer::new(4);
        buffer.write(Bytes::from_static(b"full")).await.unwrap();

        let writer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.write(Bytes::from_static(b"more")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();

        assert_eq!(writer.await.unwrap(), Err(BufferError::Closed));
    }

    #[tokio::test]
    async fn close_wakes_blocked_reader() {
        let buffer = RingBuffer::new(4);
        let reader = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.read(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        buffer.close();
        assert!(reader.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn error_is_delivered_after_drain() {
        let buffer = RingBuffer::new(16);
        buffer.write(Bytes::from_static(b"tail")).await.unwrap();
        buffer.close_with_error("playlist reload failed");
        buffer.close();

        assert_eq!(buffer.read(16).await.unwrap(), Bytes::from_static(b"tail"));
        assert_eq!(
            buffer.read(16).await,
            Err(BufferError::Stream {
                reason: "playlist reload failed".into()
            })
        );
    }

    #[tokio::test]
    async fn markers_keep_their_position() {
        let buffer = RingBuffer::new(16);
        buffer.write(Bytes::from_static(b"one")).await.unwrap();
        buffer.mark_discontinuity().unwrap();
        buffer.write(Bytes::from_static(b"two")).await.unwrap();
        buffer.close();

        assert_eq!(
            buffer.read_item(16).await.unwrap(),
            Some(ReadItem::Data(Bytes::from_static(b"one")))
        );
        assert_eq!(buffer.read_item(16).await.unwrap(), Some(ReadItem::Discontinuity));
        assert_eq!(
            buffer.read_item(16).await.unwrap(),
            Some(ReadItem::Data(Bytes::from_static(b"two")))
        );
        assert_eq!(buffer.read_item(16).await.unwrap(), None);
        assert!(buffer.close_token().is_cancelled());
    }

    proptest! {
        #[test]
        fn arbitrary_chunking_preserves_bytes(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..200), 0..20),
            capacity in 1usize..64,
            read_size in 1usize..100,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let expected: Vec<u8> = chunks.iter().flatten().copied().collect();

            let received = runtime.block_on(async move {
                let buffer = RingBuffer::new(capacity);
                let writer = {
                    let buffer = buffer.clone();
                    tokio::spawn(async move {
                        for chunk in chunks {
                            buffer.write(Bytes::from(chunk)).await.unwrap();
                        }
                        buffer.close();
                    })
                };

                let mut received = Vec::new();
                loop {
                    let chunk = buffer.read(read_size).await.unwrap();
                    if chunk.is_empty() {
                        break;
                    }
                    prop_assert!(chunk.len() <= read_size);
                    received.extend_from_slice(&chunk);
                }
                writer.await.unwrap();
                Ok(received)
            })?;

            prop_assert_eq!(received, expected);
        }
    }
}
