//! Client fan-out queues
//!
//! One producer (the channel broadcaster) feeds N bounded per-client
//! queues. Enqueueing never blocks: a full queue drops its oldest chunk so
//! a stalled client loses freshness, not the whole channel. Each queue
//! backs one HTTP streaming body via the [`futures_util::Stream`] impl.

use bytes::Bytes;
use futures_util::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::time::Instant;
use uuid::Uuid;

/// Default queue bound: about six seconds of data at typical bitrates when
/// chunks run 64 KiB, and never fewer than 100 chunks
pub const DEFAULT_QUEUE_CHUNKS: usize = 100;

struct QueueState {
    chunks: VecDeque<Bytes>,
    closed: bool,
    dropped_chunks: u64,
    bytes_sent: u64,
    last_read: Instant,
    waker: Option<Waker>,
}

/// A bounded single-client queue with drop-oldest overflow
pub struct ClientQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    session_id: String,
    opened_at: Instant,
}

impl ClientQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                chunks: VecDeque::with_capacity(capacity.min(256)),
                closed: false,
                dropped_chunks: 0,
                bytes_sent: 0,
                last_read: Instant::now(),
                waker: None,
            }),
            capacity: capacity.max(DEFAULT_QUEUE_CHUNKS),
            session_id: Uuid::new_v4().to_string(),
            opened_at: Instant::now(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Offer a chunk without blocking. A full queue drops its oldest chunk
    /// first; a closed queue reports `false` so the caller detaches it.
    pub fn offer(&self, chunk: Bytes) -> bool {
        let mut state = self.state.lock().expect("client queue poisoned");
        if state.closed {
            return false;
        }
        if state.chunks.len() >= self.capacity {
            state.chunks.pop_front();
            state.dropped_chunks += 1;
        }
        state.chunks.push_back(chunk);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    /// Close the queue; the consumer's stream ends after draining
    pub fn close(&self) {
        let mut state = self.state.lock().expect("client queue poisoned");
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("client queue poisoned").closed
    }

    /// Seconds since the consumer last read a chunk
    pub fn idle_for(&self) -> std::time::Duration {
        self.state
            .lock()
            .expect("client queue poisoned")
            .last_read
            .elapsed()
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.state.lock().expect("client queue poisoned").dropped_chunks
    }

    pub fn bytes_sent(&self) -> u64 {
        self.state.lock().expect("client queue poisoned").bytes_sent
    }

    pub fn depth(&self) -> usize {
        self.state.lock().expect("client queue poisoned").chunks.len()
    }
}

/// The consumer half handed to the HTTP layer
pub struct ClientStream {
    queue: Arc<ClientQueue>,
}

impl ClientStream {
    pub fn new(queue: Arc<ClientQueue>) -> Self {
        Self { queue }
    }
}

impl Stream for ClientStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut state = self.queue.state.lock().expect("client queue poisoned");

        if let Some(chunk) = state.chunks.pop_front() {
            state.last_read = Instant::now();
            state.bytes_sent += chunk.len() as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        // Client disconnect closes only this queue, never the broadcaster
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_offer_and_depth() {
        let queue = ClientQueue::new(100);
        assert!(queue.offer(Bytes::from_static(b"a")));
        assert!(queue.offer(Bytes::from_static(b"b")));
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.dropped_chunks(), 0);
    }

    #[test]
    fn test_overflow_drops_oldest_keeps_recency() {
        let queue = ClientQueue::new(100);
        for i in 0..105u32 {
            queue.offer(Bytes::from(i.to_be_bytes().to_vec()));
        }
        assert_eq!(queue.depth(), 100);
        assert_eq!(queue.dropped_chunks(), 5);

        // The head is now chunk 5: oldest five were dropped
        let mut state = queue.state.lock().unwrap();
        let head = state.chunks.pop_front().unwrap();
        assert_eq!(head.as_ref(), 5u32.to_be_bytes());
        // And the tail is the newest chunk
        let tail = state.chunks.pop_back().unwrap();
        assert_eq!(tail.as_ref(), 104u32.to_be_bytes());
    }

    #[test]
    fn test_offer_to_closed_queue_reports_detached() {
        let queue = ClientQueue::new(100);
        queue.close();
        assert!(!queue.offer(Bytes::from_static(b"x")));
    }

    #[tokio::test]
    async fn test_stream_yields_in_fifo_order() {
        let queue = ClientQueue::new(100);
        queue.offer(Bytes::from_static(b"one"));
        queue.offer(Bytes::from_static(b"two"));
        queue.close();

        let mut stream = ClientStream::new(queue);
        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"one");
        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"two");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_wakes_on_late_offer() {
        let queue = ClientQueue::new(100);
        let mut stream = ClientStream::new(queue.clone());

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                queue.offer(Bytes::from_static(b"late"));
            })
        };

        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk.as_ref(), b"late");
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_stream_closes_queue() {
        let queue = ClientQueue::new(100);
        {
            let _stream = ClientStream::new(queue.clone());
        }
        assert!(queue.is_closed());
        assert!(!queue.offer(Bytes::from_static(b"x")));
    }

    #[test]
    fn test_minimum_capacity_is_enforced() {
        let queue = ClientQueue::new(3);
        for i in 0..120u8 {
            queue.offer(Bytes::from(vec![i]));
        }
        // Requested capacity below the floor is raised to 100 chunks
        assert_eq!(queue.depth(), 100);
    }
}
