use snafu::Snafu;

/// Error type returned by topic handlers.
///
/// Handler errors never reach the publisher; they are consumed by the retry
/// pipeline and surface only through metrics and observers.
pub type HandlerError = eyre::Report;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Queue is full (capacity: {capacity})"))]
    QueueFull { capacity: usize },

    #[snafu(display("Consumer stopped"))]
    ConsumerStopped,

    #[snafu(display("Invalid message: {id}"))]
    InvalidMessage { id: String },

    #[snafu(display("Max retries exceeded for message {id} after {attempts} attempts"))]
    RetryExceeded { id: String, attempts: u32 },

    #[snafu(display("No handler for topic: {topic}"))]
    NoHandler { topic: String },

    #[snafu(display("Operation cancelled"))]
    Cancelled,

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Worker panicked: {reason}"))]
    WorkerPanicked { reason: String },
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::WorkerPanicked {
            reason: e.to_string(),
        }
    }
}

impl Error {
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn invalid_message(id: impl Into<String>) -> Self {
        Self::InvalidMessage { id: id.into() }
    }

    pub fn no_handler(topic: impl Into<String>) -> Self {
        Self::NoHandler {
            topic: topic.into(),
        }
    }

    /// Whether the caller may retry the operation later (e.g. after applying
    /// backpressure).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }
}
