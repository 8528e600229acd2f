//! Per-queue counters.
//!
//! Counters are plain atomics updated on the hot path. [`QueueMetrics::snapshot`]
//! reads each one independently, so a snapshot is good for monitoring but is
//! not a consistent cut across fields.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct QueueMetrics {
    total_messages: AtomicU64,
    processed_messages: AtomicU64,
    failed_messages: AtomicU64,
    retry_messages: AtomicU64,
    dead_messages: AtomicI64,
    current_size: AtomicI64,
    workers: AtomicUsize,
    active_workers: AtomicUsize,
}

/// Point-in-time copy of [`QueueMetrics`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub total_messages: u64,
    pub processed_messages: u64,
    pub failed_messages: u64,
    pub retry_messages: u64,
    pub dead_messages: i64,
    pub current_size: i64,
    pub workers: usize,
    pub active_workers: usize,
}

impl QueueMetrics {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: AtomicUsize::new(workers),
            ..Default::default()
        }
    }

    pub fn record_published(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead(&self) {
        self.dead_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// A dead message was requeued and is live again.
    pub fn record_resurrected(&self) {
        self.dead_messages.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increment_size(&self) {
        self.current_size.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_size(&self) {
        self.current_size.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current_size(&self) -> i64 {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn worker_busy(&self) -> ActiveWorkerGuard<'_> {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        ActiveWorkerGuard { metrics: self }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            processed_messages: self.processed_messages.load(Ordering::Relaxed),
            failed_messages: self.failed_messages.load(Ordering::Relaxed),
            retry_messages: self.retry_messages.load(Ordering::Relaxed),
            dead_messages: self.dead_messages.load(Ordering::Relaxed),
            current_size: self.current_size.load(Ordering::Acquire),
            workers: self.workers.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
        }
    }
}

/// Marks a worker as active until dropped.
pub struct ActiveWorkerGuard<'a> {
    metrics: &'a QueueMetrics,
}

impl Drop for ActiveWorkerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.active_workers.fetch_sub(1, Ordering::Relaxed);
    }
}
