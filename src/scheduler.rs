//! Delayed re-injection of messages into the primary buffer.
//!
//! One background task owns a min-heap of parked messages keyed by their
//! `delay_until`. It sleeps until the earliest deadline, a new arrival, or
//! shutdown, whichever comes first. A single task serves every delayed
//! message, so the number of outstanding timers stays at one.

use std::{
    cmp::{Ordering as CmpOrdering, Reverse},
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Longest a single sleep may last. Parked messages with later deadlines are
/// delivered early and re-parked by the worker that receives them.
const MAX_PARK: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Cloneable handle used by workers to park messages.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Message>,
    pending: Arc<AtomicUsize>,
}

impl SchedulerHandle {
    /// Parks `message` until its `delay_until` passes. Messages scheduled
    /// after shutdown are dropped.
    pub fn schedule(&self, message: Message) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(message_id = %message.id, "Scheduler stopped, dropping message");
        }
    }

    /// Number of messages currently parked.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

pub struct Scheduler<D> {
    rx: mpsc::UnboundedReceiver<Message>,
    pending: Arc<AtomicUsize>,
    deliver: D,
    retry_interval: Duration,
    heap: BinaryHeap<Reverse<Parked>>,
    seq: u64,
}

struct Parked {
    deadline: Instant,
    seq: u64,
    message: Message,
}

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Parked {}

impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Parked {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Creates a scheduler and the handle that feeds it.
///
/// `deliver` performs a non-blocking enqueue into the primary buffer and hands
/// the message back when the buffer is full; rejected messages are retried
/// every `retry_interval`.
pub fn scheduler<D>(deliver: D, retry_interval: Duration) -> (SchedulerHandle, Scheduler<D>)
where
    D: Fn(Message) -> Result<(), Message> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    (
        SchedulerHandle {
            tx,
            pending: pending.clone(),
        },
        Scheduler {
            rx,
            pending,
            deliver,
            retry_interval,
            heap: BinaryHeap::new(),
            seq: 0,
        },
    )
}

impl<D> Scheduler<D>
where
    D: Fn(Message) -> Result<(), Message> + Send + 'static,
{
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::debug!("Retry scheduler starting");

        loop {
            let next = self.heap.peek().map(|Reverse(parked)| parked.deadline);

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.rx.recv() => match received {
                    Some(message) => self.park(message),
                    None => break,
                },
                _ = tokio::time::sleep_until(next.unwrap_or_else(|| Instant::now() + MAX_PARK)), if next.is_some() => {
                    self.release_due();
                }
            }
        }

        let dropped = self.heap.len();
        self.pending.fetch_sub(dropped, Ordering::AcqRel);
        tracing::debug!(dropped, "Retry scheduler shutting down");
    }

    fn park(&mut self, message: Message) {
        let wait = message
            .delay_until
            .and_then(|until| (until - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO)
            .min(MAX_PARK);
        self.push(Instant::now() + wait, message);
    }

    fn push(&mut self, deadline: Instant, message: Message) {
        self.seq += 1;
        self.heap.push(Reverse(Parked {
            deadline,
            seq: self.seq,
            message,
        }));
    }

    fn release_due(&mut self) {
        let now = Instant::now();
        let mut rejected = Vec::new();

        while self
            .heap
            .peek()
            .is_some_and(|Reverse(parked)| parked.deadline <= now)
        {
            let Some(Reverse(parked)) = self.heap.pop() else {
                break;
            };

            match (self.deliver)(parked.message) {
                Ok(()) => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                }
                Err(message) => rejected.push(message),
            }
        }

        if !rejected.is_empty() {
            tracing::warn!(
                count = rejected.len(),
                "Primary buffer full, deferring re-injection"
            );
            let deadline = now + self.retry_interval;
            for message in rejected {
                self.push(deadline, message);
            }
        }
    }
}
