//! Backpressure-aware event queue.
//!
//! Decouples stream arrival rate from the rate the consumer can absorb.
//! Latency-sensitive kinds (start/complete/status/permission) jump ahead of
//! buffered deltas; FIFO order is preserved within each priority class.
//! Draining happens in fixed-size batches on a timed schedule so a burst of
//! events never reaches the consumer as one synchronous flood.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use oqto_stream_protocol::EventEnvelope;
use parking_lot::Mutex;

use crate::config::StreamConfig;

/// Receives drained envelopes. A failure is logged and never aborts the
/// batch or future processing.
pub trait EventConsumer: Send + Sync {
    fn consume(&self, envelope: EventEnvelope) -> anyhow::Result<()>;
}

impl<F> EventConsumer for F
where
    F: Fn(EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn consume(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        self(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Priority {
    High,
    Normal,
}

#[derive(Debug)]
struct QueuedEvent {
    envelope: EventEnvelope,
    priority: Priority,
    queued_at: Instant,
}

/// Priority-aware, backpressure-bounded event buffer.
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    buf: Mutex<VecDeque<QueuedEvent>>,
    /// Whether a drain task is live. Cleared when the queue runs dry.
    scheduled: AtomicBool,
    closed: AtomicBool,
    dropped: AtomicU64,
    max_queue_size: usize,
    batch_size: usize,
    batch_delay: Duration,
    consumer: Arc<dyn EventConsumer>,
}

impl EventQueue {
    /// Create a queue feeding `consumer`.
    pub fn new(config: &StreamConfig, consumer: Arc<dyn EventConsumer>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                buf: Mutex::new(VecDeque::new()),
                scheduled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                max_queue_size: config.max_queue_size,
                batch_size: config.batch_size,
                batch_delay: config.batch_delay,
                consumer,
            }),
        }
    }

    /// Buffer an envelope and make sure a drain is scheduled.
    pub fn enqueue(&self, envelope: EventEnvelope) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let priority = if envelope.kind().is_high_priority() {
            Priority::High
        } else {
            Priority::Normal
        };

        {
            let mut buf = self.inner.buf.lock();

            if buf.len() >= self.inner.max_queue_size {
                // Shed ~20% of the oldest normal-priority entries. High
                // priority is never dropped.
                let to_drop = (self.inner.max_queue_size / 5).max(1);
                let mut remaining = to_drop;
                buf.retain(|queued| {
                    if remaining > 0 && queued.priority == Priority::Normal {
                        remaining -= 1;
                        false
                    } else {
                        true
                    }
                });
                let dropped_now = (to_drop - remaining) as u64;
                if dropped_now > 0 {
                    self.inner.dropped.fetch_add(dropped_now, Ordering::SeqCst);
                    warn!(
                        "Event queue overflow: dropped {} buffered events",
                        dropped_now
                    );
                }
            }

            let queued = QueuedEvent {
                envelope,
                priority,
                queued_at: Instant::now(),
            };
            match priority {
                Priority::High => {
                    // Behind existing high entries, ahead of every normal one.
                    let pos = buf
                        .iter()
                        .position(|q| q.priority == Priority::Normal)
                        .unwrap_or(buf.len());
                    buf.insert(pos, queued);
                }
                Priority::Normal => buf.push_back(queued),
            }
        }

        if !self.inner.scheduled.swap(true, Ordering::SeqCst) {
            tokio::spawn(drain(self.inner.clone()));
        }
    }

    /// Buffered event count.
    pub fn len(&self) -> usize {
        self.inner.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buf.lock().is_empty()
    }

    /// Events shed under backpressure since creation.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Stop draining and drop everything buffered. Enqueues after this are
    /// ignored.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.buf.lock().clear();
    }

    /// Drop buffered events without closing (session reset).
    pub fn clear(&self) {
        self.inner.buf.lock().clear();
    }
}

/// Drain until the queue runs dry: one bounded batch per tick, yielding
/// between batches so the consumer's thread never starves.
async fn drain(inner: Arc<QueueInner>) {
    loop {
        tokio::time::sleep(inner.batch_delay).await;
        if inner.closed.load(Ordering::SeqCst) {
            inner.scheduled.store(false, Ordering::SeqCst);
            return;
        }

        let batch: Vec<QueuedEvent> = {
            let mut buf = inner.buf.lock();
            let take = inner.batch_size.min(buf.len());
            buf.drain(..take).collect()
        };

        if !batch.is_empty() {
            debug!("Draining {} events", batch.len());
        }
        for queued in batch {
            if let Err(e) = inner.consumer.consume(queued.envelope) {
                warn!(
                    "Event consumer failed after {:?} in queue: {:#}",
                    queued.queued_at.elapsed(),
                    e
                );
            }
        }

        if inner.buf.lock().is_empty() {
            inner.scheduled.store(false, Ordering::SeqCst);
            // An enqueue may have slipped in between the emptiness check and
            // the flag store; reclaim the schedule if so.
            if !inner.buf.lock().is_empty()
                && !inner.scheduled.swap(true, Ordering::SeqCst)
            {
                continue;
            }
            return;
        }
    }
}
