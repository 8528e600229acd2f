//! Lifecycle observers.
//!
//! Observers are notified synchronously, on the task that caused the
//! transition, so implementations should return quickly. Any number of
//! observers can be registered; each receives every event.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::{
    error::{Error, HandlerError},
    message::Message,
};

/// Receives message lifecycle events. All methods default to no-ops.
pub trait QueueObserver: Send + Sync + 'static {
    /// A message was accepted into the buffer by `publish`.
    fn on_published(&self, _message: &Message) {}

    /// A message finished processing. `error` is `None` on success,
    /// [`Error::NoHandler`] when no handler was registered for the topic, and
    /// [`Error::RetryExceeded`] once the message has been dead-lettered.
    fn on_processed(&self, _message: &Message, _error: Option<&Error>) {}

    /// A handler failed and the message was scheduled for another attempt.
    fn on_retry(&self, _message: &Message, _error: &HandlerError) {}

    /// A message exhausted its retries and was marked dead.
    fn on_dead(&self, _message: &Message) {}
}

/// Handle returned by [`Observers::add`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ObserverId, Arc<dyn QueueObserver>)>>,
}

impl Observers {
    pub fn add(&self, observer: Arc<dyn QueueObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, observer));
        id
    }

    /// Returns false if no observer with this id was registered.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn published(&self, message: &Message) {
        self.each(|observer| observer.on_published(message));
    }

    pub fn processed(&self, message: &Message, error: Option<&Error>) {
        self.each(|observer| observer.on_processed(message, error));
    }

    pub fn retry(&self, message: &Message, error: &HandlerError) {
        self.each(|observer| observer.on_retry(message, error));
    }

    pub fn dead(&self, message: &Message) {
        self.each(|observer| observer.on_dead(message));
    }

    fn each(&self, f: impl Fn(&dyn QueueObserver)) {
        // Snapshot so observers can (un)register without deadlocking.
        let observers: Vec<_> = self.read().iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            f(observer.as_ref());
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<(ObserverId, Arc<dyn QueueObserver>)>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<(ObserverId, Arc<dyn QueueObserver>)>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Observer built from a single closure for one kind of event.
pub(crate) enum FnObserver {
    Published(Box<dyn Fn(&Message) + Send + Sync>),
    Processed(Box<dyn Fn(&Message, Option<&Error>) + Send + Sync>),
    Retry(Box<dyn Fn(&Message, &HandlerError) + Send + Sync>),
    Dead(Box<dyn Fn(&Message) + Send + Sync>),
}

impl QueueObserver for FnObserver {
    fn on_published(&self, message: &Message) {
        if let Self::Published(f) = self {
            f(message)
        }
    }

    fn on_processed(&self, message: &Message, error: Option<&Error>) {
        if let Self::Processed(f) = self {
            f(message, error)
        }
    }

    fn on_retry(&self, message: &Message, error: &HandlerError) {
        if let Self::Retry(f) = self {
            f(message, error)
        }
    }

    fn on_dead(&self, message: &Message) {
        if let Self::Dead(f) = self {
            f(message)
        }
    }
}
