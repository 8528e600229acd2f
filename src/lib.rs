use std::time::Duration;

use config::Config;
use error::HandlerError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod handler;
pub mod message;
pub mod metrics;
pub mod observer;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod telemetry;

pub use config::QueueConfig;
pub use error::Error;
pub use handler::Handler;
pub use message::{Message, MessagePriority, MessageStatus, PublishOptions};
pub use metrics::MetricsSnapshot;
pub use observer::{ObserverId, QueueObserver};
pub use queue::MessageQueue;
pub use retry::{ConstantBackoff, ExponentialBackoff, RetryStrategy};

/// Upper bound on how long `run` waits for in-flight work after input ends.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Runs the queue as a line-oriented publisher.
///
/// Each stdin line of the form `<topic> <json payload>` is published. Input
/// that is not valid JSON is published as a string. The queue is stopped on
/// end of input or Ctrl-C, and the final metrics are printed as JSON.
pub async fn run() -> eyre::Result<()> {
    telemetry::init()?;

    let config = Config::load()?;
    let queue = MessageQueue::new(config.queue_config());

    for topic in config.topics() {
        queue.subscribe(topic, log_message);
    }

    let cancel = CancellationToken::new();
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                cancel.cancel();
                break;
            }
            line = lines.next() => match line {
                Some(line) => {
                    let line = line?;
                    let Some((topic, payload)) = parse_line(&line) else {
                        continue;
                    };
                    match queue.publish(&cancel, topic, payload, PublishOptions::default()) {
                        Ok(id) => tracing::debug!(message_id = %id, %topic, "Queued"),
                        Err(e) => tracing::warn!(error = %e, %topic, "Failed to publish"),
                    }
                }
                None => break,
            }
        }
    }

    if !cancel.is_cancelled() {
        wait_idle(&queue, SHUTDOWN_GRACE).await;
    }
    queue.stop().await?;

    println!("{}", serde_json::to_string_pretty(&queue.get_metrics())?);

    Ok(())
}

async fn log_message(_cancel: CancellationToken, message: Message) -> Result<(), HandlerError> {
    tracing::info!(
        message_id = %message.id,
        topic = %message.topic,
        priority = %message.priority,
        attempt = message.retry_count,
        payload = %message.payload,
        "Received message"
    );
    Ok(())
}

/// Splits `<topic> <payload>` into its parts. Blank lines yield `None`.
fn parse_line(line: &str) -> Option<(&str, serde_json::Value)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (topic, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let payload = if rest.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(rest).unwrap_or_else(|_| serde_json::Value::String(rest.to_owned()))
    };

    Some((topic, payload))
}

/// Waits until nothing is buffered, parked, or being processed.
async fn wait_idle(queue: &MessageQueue, grace: Duration) {
    let poll = queue.config().poll_interval;
    let deadline = tokio::time::Instant::now() + grace;

    while tokio::time::Instant::now() < deadline {
        // Unflushed batches are invisible to the counters; give them a tick.
        tokio::time::sleep(poll).await;

        let metrics = queue.get_metrics();
        if queue.get_size() == 0 && queue.get_scheduled_count() == 0 && metrics.active_workers == 0
        {
            return;
        }
    }

    tracing::warn!(
        remaining = queue.get_size(),
        scheduled = queue.get_scheduled_count(),
        "Shutdown grace period elapsed with pending messages"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let test_cases = vec![
            (
                "reminder {\"text\":\"buy milk\"}",
                Some(("reminder", serde_json::json!({"text": "buy milk"}))),
            ),
            ("idea   42", Some(("idea", serde_json::json!(42)))),
            ("note hello world", Some(("note", serde_json::json!("hello world")))),
            ("ping", Some(("ping", serde_json::Value::Null))),
            ("   ", None),
            ("", None),
        ];

        for (input, expected) in test_cases {
            assert_eq!(parse_line(input), expected, "input: {input:?}");
        }
    }
}
