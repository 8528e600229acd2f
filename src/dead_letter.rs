//! Bounded dead-letter buffer.
//!
//! Holds messages that exhausted their retries. Writes are best-effort: a
//! full buffer rejects new entries instead of blocking the worker. Expired
//! entries are pruned by the queue's background loop.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;

use crate::{error::Error, message::Message};

pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<Message>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Appends `message` unless the buffer is full, in which case the
    /// message is handed back.
    pub fn try_push(&self, message: Message) -> Result<(), Message> {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            return Err(message);
        }
        entries.push_back(message);
        Ok(())
    }

    /// Removes and returns every buffered message, oldest first.
    pub fn drain(&self) -> Vec<Message> {
        self.lock().drain(..).collect()
    }

    /// Drops entries older than `ttl`. Returns how many were dropped.
    pub fn prune_expired(&self, ttl: Duration) -> usize {
        let now = Utc::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|message| !message.is_expired_at(ttl, now));
        before - entries.len()
    }

    /// Extracts the entry with `id`, resets it and passes it to `send`.
    ///
    /// The whole operation runs under the buffer lock, so if `send` fails the
    /// original entry goes back into its old slot and no concurrent writer
    /// can have taken it.
    pub fn requeue(
        &self,
        id: &str,
        send: impl FnOnce(Message) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut entries = self.lock();
        let position = entries
            .iter()
            .position(|message| message.id == id)
            .ok_or_else(|| Error::invalid_message(id))?;
        let original = entries
            .remove(position)
            .ok_or_else(|| Error::invalid_message(id))?;

        let mut message = original.clone();
        message.reset_for_requeue();

        send(message).inspect_err(|_| entries.insert(position, original))
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
