//! Message types and status management for the in-process queue.
//!
//! A [`Message`] is the unit of work flowing through the queue. It carries an
//! opaque JSON payload, string headers, arbitrary metadata, and the bookkeeping
//! the worker pool needs to drive it through its lifecycle.
//!
//! # Message Lifecycle
//!
//! 1. Messages are created in `Pending` status by `publish`
//! 2. A worker marks them `Processing` while the topic handler runs
//! 3. On success they move to `Completed`
//! 4. On a retryable failure they move to `Retrying` and are parked until
//!    their backoff delay elapses, then picked up again
//! 5. Once retries are exhausted they move to `Dead` and are routed to the
//!    dead-letter queue, from which they can be requeued manually
//!
//! Messages published to a topic with no handler become `Failed` and are
//! dropped without touching the dead-letter queue.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Default retry budget for a message when neither the publisher nor the
/// queue configuration overrides it.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Represents the current status of a message.
///
/// The status transitions follow:
/// `Pending` -> `Processing` -> `Completed`
/// `Pending` -> `Processing` -> `Retrying` -> (delay) -> `Processing` ...
/// `Pending` -> `Processing` -> `Dead` -> (manual requeue) -> `Pending`
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting in the buffer for a worker
    Pending,
    /// Currently held by a worker running the topic handler
    Processing,
    /// Handler returned successfully
    Completed,
    /// No handler was registered for the topic
    Failed,
    /// Handler failed and the message is waiting for its next attempt
    Retrying,
    /// Retries are exhausted; the message lives in the dead-letter queue
    Dead,
}

/// Priority tag attached to a message.
///
/// The tag is stored and exposed but does not influence which buffered
/// message a worker picks up next; delivery into the buffer is FIFO.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A unit of work in the queue.
///
/// Only the worker currently holding a message mutates it; everywhere else
/// it is moved by value through the buffers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    /// Unique identifier for the message
    pub id: String,
    /// Routing key used to select the handler
    pub topic: String,
    /// The message content
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent handler invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    /// Number of retries already scheduled
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time at which the message may be handed to a handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Message {
    /// Creates a new pending message with a fresh id.
    pub fn new(topic: impl Into<String>, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            id: generate_id(),
            topic: topic.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            priority: MessagePriority::default(),
            status: MessageStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            delay_until: None,
            metadata: HashMap::new(),
        }
    }

    /// Returns true once the message is older than `ttl`.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.is_expired_at(ttl, Utc::now())
    }

    pub fn is_expired_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.created_at) > ttl
    }

    /// Whether the message still has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether a worker may hand this message to its handler right now.
    pub fn should_process(&self) -> bool {
        self.should_process_at(Utc::now())
    }

    pub fn should_process_at(&self, now: DateTime<Utc>) -> bool {
        if self.delay_until.is_some_and(|until| now < until) {
            return false;
        }
        matches!(self.status, MessageStatus::Pending | MessageStatus::Retrying)
    }

    /// Clears retry state so a dead message can run again from scratch.
    pub fn reset_for_requeue(&mut self) {
        self.status = MessageStatus::Pending;
        self.retry_count = 0;
        self.delay_until = None;
    }
}

/// Optional overrides applied to a message before it is enqueued.
///
/// ```
/// use std::time::Duration;
/// use nudgeq::message::{MessagePriority, PublishOptions};
///
/// let options = PublishOptions::builder()
///     .priority(MessagePriority::High)
///     .max_retries(5)
///     .delay(Duration::from_secs(30))
///     .build();
/// ```
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct PublishOptions {
    pub priority: Option<MessagePriority>,
    /// Merged into the message headers
    #[builder(default)]
    pub headers: HashMap<String, String>,
    pub max_retries: Option<u32>,
    /// Delays the first attempt by this much
    pub delay: Option<Duration>,
    /// Merged into the message metadata
    #[builder(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PublishOptions {
    pub fn apply(self, message: &mut Message) {
        if let Some(priority) = self.priority {
            message.priority = priority;
        }
        message.headers.extend(self.headers);
        if let Some(max_retries) = self.max_retries {
            message.max_retries = max_retries;
        }
        if let Some(delay) = self.delay {
            message.delay_until = Some(deadline_after(Utc::now(), delay));
        }
        message.metadata.extend(self.metadata);
    }
}

/// Adds a std duration to a wall-clock instant, saturating instead of
/// overflowing.
pub fn deadline_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Generates a random base58 message id.
pub fn generate_id() -> String {
    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    bs58::encode(buf).into_string()
}
