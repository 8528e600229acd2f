//! Topic handlers and the topic -> handler registry.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{error::HandlerError, message::Message};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Performs the actual work for messages published to a topic.
///
/// The cancellation token fires when the queue shuts down; long-running
/// handlers should watch it and bail out early. The handler receives its own
/// copy of the message.
///
/// Any `Fn(CancellationToken, Message) -> impl Future<Output = Result<(), HandlerError>>`
/// closure is a handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, cancel: CancellationToken, message: Message) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, cancel: CancellationToken, message: Message) -> HandlerFuture {
        Box::pin(self(cancel, message))
    }
}

/// Concurrent topic -> handler map. Lookups on the dispatch path never block
/// behind registrations.
pub struct HandlerRegistry {
    handlers: papaya::HashMap<String, Arc<dyn Handler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self {
            handlers: papaya::HashMap::new(),
        }
    }
}

impl HandlerRegistry {
    /// Registers `handler` for `topic`, replacing any previous one.
    pub fn insert(&self, topic: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.pin().insert(topic.into(), handler);
    }

    pub fn remove(&self, topic: &str) -> bool {
        self.handlers.pin().remove(topic).is_some()
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.pin().get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.pin().keys().cloned().collect();
        topics.sort();
        topics
    }
}
