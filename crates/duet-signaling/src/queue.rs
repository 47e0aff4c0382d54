//! Outbound signaling queue.
//!
//! Frames produced before the channel is ready are held here and handed to the
//! channel in insertion order once it is. Readiness and contents live under a
//! single lock, so a drain can never interleave with another drain or observe
//! a half-updated readiness flag.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use duet_common::Result;
use tracing::{debug, warn};

use crate::transport::TransportChannel;

#[derive(Default)]
struct QueueState {
    sink: Option<Arc<dyn TransportChannel>>,
    ready: bool,
    pending: VecDeque<String>,
}

/// FIFO of serialized frames waiting for the transport.
#[derive(Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel the queue drains into. Not ready until [`mark_ready`](Self::mark_ready).
    pub fn attach(&self, sink: Arc<dyn TransportChannel>) {
        let mut state = self.lock();
        state.sink = Some(sink);
        state.ready = false;
    }

    /// The attached channel may now accept frames.
    pub fn mark_ready(&self) {
        self.lock().ready = true;
    }

    /// Forget the channel. Frames still queued stay queued.
    pub fn detach(&self) {
        let mut state = self.lock();
        state.ready = false;
        state.sink = None;
    }

    pub fn is_ready(&self) -> bool {
        let state = self.lock();
        state.ready && state.sink.is_some()
    }

    /// Append a frame. Never blocks on the network and never fails.
    pub fn enqueue(&self, text: String) {
        let mut state = self.lock();
        state.pending.push_back(text);
        debug!(queued = state.pending.len(), "signaling frame queued");
    }

    /// Send every queued frame if the channel is ready, oldest first.
    ///
    /// Returns how many frames were handed over. A failed send stops the drain;
    /// the failed frame and everything behind it stay queued for the next
    /// attempt.
    pub fn drain_if_ready(&self) -> Result<usize> {
        let mut state = self.lock();
        if !state.ready {
            return Ok(0);
        }
        let Some(sink) = state.sink.clone() else {
            return Ok(0);
        };

        let mut sent = 0;
        while let Some(text) = state.pending.front() {
            if let Err(err) = sink.send(text) {
                warn!(
                    "signaling send failed after {} frame(s), {} left queued: {}",
                    sent,
                    state.pending.len(),
                    err
                );
                return Err(err);
            }
            state.pending.pop_front();
            sent += 1;
        }

        if sent > 0 {
            debug!(sent, "drained outbound signaling queue");
        }
        Ok(sent)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_common::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        fail_at: Option<usize>,
        attempts: AtomicUsize,
    }

    impl RecordingChannel {
        fn failing_at(n: usize) -> Self {
            Self {
                fail_at: Some(n),
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl TransportChannel for RecordingChannel {
        fn send(&self, text: &str) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if Some(attempt) == self.fail_at {
                return Err(Error::transport("socket write failed"));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn test_not_ready_is_noop() {
        let queue = OutboundQueue::new();
        let channel = Arc::new(RecordingChannel::default());
        queue.enqueue("m1".into());
        assert_eq!(queue.drain_if_ready().unwrap(), 0);

        queue.attach(channel.clone());
        assert_eq!(queue.drain_if_ready().unwrap(), 0);
        assert_eq!(queue.len(), 1);
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn test_drains_in_enqueue_order_exactly_once() {
        let queue = OutboundQueue::new();
        let channel = Arc::new(RecordingChannel::default());
        queue.attach(channel.clone());
        for i in 1..=5 {
            queue.enqueue(format!("m{i}"));
        }

        queue.mark_ready();
        assert_eq!(queue.drain_if_ready().unwrap(), 5);
        assert_eq!(queue.drain_if_ready().unwrap(), 0);
        assert!(queue.is_empty());
        assert_eq!(channel.sent(), vec!["m1", "m2", "m3", "m4", "m5"]);
    }

    #[test]
    fn test_failed_send_keeps_remainder_in_order() {
        let queue = OutboundQueue::new();
        let flaky = Arc::new(RecordingChannel::failing_at(2));
        queue.attach(flaky.clone());
        queue.mark_ready();
        for i in 1..=4 {
            queue.enqueue(format!("m{i}"));
        }

        let err = queue.drain_if_ready().unwrap_err();
        assert!(err.is_transport());
        assert_eq!(flaky.sent(), vec!["m1", "m2"]);
        assert_eq!(queue.len(), 2);

        let healthy = Arc::new(RecordingChannel::default());
        queue.attach(healthy.clone());
        queue.mark_ready();
        assert_eq!(queue.drain_if_ready().unwrap(), 2);
        assert_eq!(healthy.sent(), vec!["m3", "m4"]);
    }

    #[test]
    fn test_detach_stops_draining() {
        let queue = OutboundQueue::new();
        let channel = Arc::new(RecordingChannel::default());
        queue.attach(channel.clone());
        queue.mark_ready();
        assert!(queue.is_ready());

        queue.detach();
        assert!(!queue.is_ready());
        queue.enqueue("late".into());
        assert_eq!(queue.drain_if_ready().unwrap(), 0);
        assert!(channel.sent().is_empty());
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(OutboundQueue::new());
        let channel = Arc::new(RecordingChannel::default());
        queue.attach(channel.clone());

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue.enqueue(format!("p{p}-{i}"));
                        if i == 25 && p == 0 {
                            queue.mark_ready();
                        }
                        queue.drain_if_ready().unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        queue.mark_ready();
        queue.drain_if_ready().unwrap();

        let sent = channel.sent();
        assert_eq!(sent.len(), 200);
        // Each producer's frames keep their relative order.
        for p in 0..4 {
            let prefix = format!("p{p}-");
            let own: Vec<usize> = sent
                .iter()
                .filter_map(|s| s.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(own, (0..50).collect::<Vec<_>>());
        }
    }
}
