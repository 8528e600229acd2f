//! The in-process message queue.
//!
//! A [`MessageQueue`] owns a bounded primary buffer drained by a fixed pool
//! of workers. Workers group received messages into micro-batches, flushed
//! when a batch reaches `batch_size` or every `poll_interval`, and run the
//! handler registered for each message's topic.
//!
//! Failed messages go through the configured [`RetryStrategy`]: retryable
//! failures are parked with the retry scheduler until their backoff elapses,
//! the rest are marked dead and moved to a bounded dead-letter buffer.
//!
//! [`RetryStrategy`]: crate::retry::RetryStrategy

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Utc;
use futures_util::FutureExt as _;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;

use crate::{
    config::QueueConfig,
    dead_letter::DeadLetterQueue,
    error::{Error, HandlerError},
    handler::{Handler, HandlerRegistry},
    message::{deadline_after, Message, MessageStatus, PublishOptions},
    metrics::{MetricsSnapshot, QueueMetrics},
    observer::{FnObserver, ObserverId, Observers, QueueObserver},
    scheduler::{self, SchedulerHandle},
};

/// Bounded, multi-worker, in-process message queue.
///
/// Dropping the queue cancels its background tasks; call [`MessageQueue::stop`]
/// to wait for them to finish.
pub struct MessageQueue {
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

struct Shared {
    config: QueueConfig,
    tx: mpsc::Sender<Message>,
    rx: Mutex<mpsc::Receiver<Message>>,
    dlq: DeadLetterQueue,
    handlers: HandlerRegistry,
    observers: Observers,
    metrics: Arc<QueueMetrics>,
    scheduler: SchedulerHandle,
    shutdown: CancellationToken,
    stopped: AtomicBool,
}

/// Non-blocking enqueue into the primary buffer. The size counter is bumped
/// before the send so a fast worker can never drive it negative.
fn try_enqueue(
    tx: &mpsc::Sender<Message>,
    metrics: &QueueMetrics,
    message: Message,
) -> Result<(), Message> {
    metrics.increment_size();
    tx.try_send(message).map_err(|e| {
        metrics.decrement_size();
        e.into_inner()
    })
}

impl MessageQueue {
    /// Creates the queue and starts its workers, the retry scheduler, the
    /// dead-letter pruning loop and (if enabled) the metrics reporter.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: QueueConfig) -> Self {
        let config = config.normalized();

        let (tx, rx) = mpsc::channel(config.max_size);
        let metrics = Arc::new(QueueMetrics::new(config.workers));
        let shutdown = CancellationToken::new();

        let (scheduler_handle, scheduler) = scheduler::scheduler(
            {
                let tx = tx.clone();
                let metrics = metrics.clone();
                move |message: Message| try_enqueue(&tx, &metrics, message)
            },
            config.poll_interval,
        );

        let shared = Arc::new(Shared {
            dlq: DeadLetterQueue::new(config.dlq_capacity()),
            tx,
            rx: Mutex::new(rx),
            handlers: HandlerRegistry::default(),
            observers: Observers::default(),
            metrics,
            scheduler: scheduler_handle,
            shutdown: shutdown.clone(),
            stopped: AtomicBool::new(false),
            config,
        });

        let mut tasks = JoinSet::new();
        for worker_id in 0..shared.config.workers {
            tasks.spawn(
                run_worker(worker_id, shared.clone())
                    .instrument(tracing::debug_span!("worker", worker_id)),
            );
        }
        tasks.spawn(scheduler.run(shutdown));
        tasks.spawn(prune_dead_letters(shared.clone()));
        if shared.config.enable_metrics {
            tasks.spawn(report_metrics(shared.clone()));
        }

        tracing::info!(
            workers = shared.config.workers,
            max_size = shared.config.max_size,
            batch_size = shared.config.batch_size,
            "Message queue started"
        );

        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Publishes `payload` to `topic` and returns the new message id.
    ///
    /// Never waits for buffer space: a full buffer fails immediately with
    /// [`Error::QueueFull`]. Fails with [`Error::Cancelled`] if `cancel` has
    /// already fired.
    pub fn publish(
        &self,
        cancel: &CancellationToken,
        topic: impl Into<String>,
        payload: impl Into<serde_json::Value>,
        options: PublishOptions,
    ) -> Result<String, Error> {
        let shared = &self.shared;
        if shared.is_stopped() {
            return Err(Error::ConsumerStopped);
        }

        let topic = topic.into();
        if topic.trim().is_empty() {
            return Err(Error::invalid_parameter("topic must not be empty"));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut message = Message::new(topic, payload);
        message.max_retries = shared.config.default_max_retries;
        options.apply(&mut message);

        let id = message.id.clone();
        let notify = (!shared.observers.is_empty()).then(|| message.clone());

        if try_enqueue(&shared.tx, &shared.metrics, message).is_err() {
            tracing::debug!(message_id = %id, "Primary buffer full, rejecting publish");
            return Err(Error::QueueFull {
                capacity: shared.config.max_size,
            });
        }

        shared.metrics.record_published();
        tracing::trace!(message_id = %id, "Published message");
        if let Some(message) = notify {
            shared.observers.published(&message);
        }

        Ok(id)
    }

    /// Registers `handler` for `topic`. The last registration for a topic wins.
    pub fn subscribe(&self, topic: impl Into<String>, handler: impl Handler) {
        let topic = topic.into();
        tracing::debug!(%topic, "Subscribing handler");
        self.shared.handlers.insert(topic, Arc::new(handler));
    }

    pub fn unsubscribe(&self, topic: &str) {
        if self.shared.handlers.remove(topic) {
            tracing::debug!(%topic, "Unsubscribed handler");
        }
    }

    /// Topics with a registered handler, sorted.
    pub fn get_handlers(&self) -> Vec<String> {
        self.shared.handlers.topics()
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Number of messages currently sitting in the primary buffer.
    pub fn get_size(&self) -> usize {
        usize::try_from(self.shared.metrics.current_size()).unwrap_or(0)
    }

    pub fn get_dlq_size(&self) -> usize {
        self.shared.dlq.len()
    }

    /// Number of messages parked until their delay or backoff elapses.
    pub fn get_scheduled_count(&self) -> usize {
        self.shared.scheduler.pending()
    }

    /// Removes and returns every dead-lettered message.
    pub fn drain_dlq(&self) -> Vec<Message> {
        self.shared.dlq.drain()
    }

    /// Moves the dead-lettered message `id` back into the primary buffer with
    /// its retry state reset.
    ///
    /// Fails with [`Error::InvalidMessage`] if no such message is
    /// dead-lettered, or [`Error::QueueFull`] if the primary buffer has no
    /// room, in which case the message stays in the dead-letter buffer.
    pub fn requeue_from_dlq(&self, id: &str) -> Result<(), Error> {
        let shared = &self.shared;
        if shared.is_stopped() {
            return Err(Error::ConsumerStopped);
        }

        shared.dlq.requeue(id, |message| {
            try_enqueue(&shared.tx, &shared.metrics, message).map_err(|_| Error::QueueFull {
                capacity: shared.config.max_size,
            })
        })?;

        shared.metrics.record_resurrected();
        tracing::info!(message_id = %id, "Requeued message from dead-letter queue");
        Ok(())
    }

    /// Registers an observer for every lifecycle event.
    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) -> ObserverId {
        self.shared.observers.add(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.shared.observers.remove(id)
    }

    pub fn on_published(&self, f: impl Fn(&Message) + Send + Sync + 'static) -> ObserverId {
        self.add_observer(Arc::new(FnObserver::Published(Box::new(f))))
    }

    pub fn on_processed(
        &self,
        f: impl Fn(&Message, Option<&Error>) + Send + Sync + 'static,
    ) -> ObserverId {
        self.add_observer(Arc::new(FnObserver::Processed(Box::new(f))))
    }

    pub fn on_retry(
        &self,
        f: impl Fn(&Message, &HandlerError) + Send + Sync + 'static,
    ) -> ObserverId {
        self.add_observer(Arc::new(FnObserver::Retry(Box::new(f))))
    }

    pub fn on_dead(&self, f: impl Fn(&Message) + Send + Sync + 'static) -> ObserverId {
        self.add_observer(Arc::new(FnObserver::Dead(Box::new(f))))
    }

    /// Cancels all background work and waits for it to exit.
    ///
    /// In-flight handlers see their cancellation token fire. Messages still in
    /// the buffers or parked for retry are discarded. Calling `stop` again is
    /// a no-op.
    pub async fn stop(&self) -> Result<(), Error> {
        let first = !self.shared.stopped.swap(true, Ordering::AcqRel);
        self.shared.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Background task failed during shutdown");
                result = Err(e.into());
            }
        }

        if first {
            tracing::info!(metrics = ?self.shared.metrics.snapshot(), "Message queue stopped");
        }
        result
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl Shared {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.shutdown.is_cancelled()
    }

    async fn recv(&self) -> Option<Message> {
        self.rx.lock().await.recv().await
    }

    /// Puts a failed or not-yet-due message back into circulation.
    fn reinject(&self, message: Message) {
        let due = message.delay_until.map_or(true, |until| Utc::now() >= until);
        if !due {
            self.scheduler.schedule(message);
            return;
        }
        if let Err(message) = try_enqueue(&self.tx, &self.metrics, message) {
            self.scheduler.schedule(message);
        }
    }

    async fn process_batch(&self, batch: &mut Vec<Message>) {
        let _busy = self.metrics.worker_busy();
        tracing::trace!(size = batch.len(), "Flushing batch");
        for message in batch.drain(..) {
            self.process(message).await;
        }
    }

    async fn process(&self, mut message: Message) {
        let Some(handler) = self.handlers.get(&message.topic) else {
            message.status = MessageStatus::Failed;
            self.metrics.record_failed();

            let err = Error::no_handler(&message.topic);
            tracing::warn!(message_id = %message.id, topic = %message.topic, "No handler registered, dropping message");
            self.observers.processed(&message, Some(&err));
            return;
        };

        message.status = MessageStatus::Processing;
        message.processed_at = Some(Utc::now());

        let cancel = self.shutdown.child_token();
        let copy = message.clone();
        let outcome = AssertUnwindSafe(async move { handler.handle(cancel, copy).await })
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(message_id = %message.id, topic = %message.topic, %reason, "Handler panicked");
                Err(eyre::eyre!("handler panicked: {reason}"))
            }
        };

        match result {
            Ok(()) => {
                message.status = MessageStatus::Completed;
                self.metrics.record_processed();
                tracing::debug!(message_id = %message.id, topic = %message.topic, "Processed message");
                self.observers.processed(&message, None);
            }
            Err(err) => self.handle_failure(message, err),
        }
    }

    fn handle_failure(&self, mut message: Message, err: HandlerError) {
        let strategy = &self.config.retry_strategy;

        if strategy.should_retry(&err, message.retry_count) && message.can_retry() {
            message.retry_count += 1;
            message.status = MessageStatus::Retrying;

            let delay = strategy.next_delay(message.retry_count);
            message.delay_until = Some(deadline_after(Utc::now(), delay));
            self.metrics.record_retry();

            tracing::warn!(
                message_id = %message.id,
                topic = %message.topic,
                attempt = message.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, scheduling retry"
            );
            self.observers.retry(&message, &err);
            self.reinject(message);
            return;
        }

        message.status = MessageStatus::Dead;
        self.metrics.record_dead();
        self.metrics.record_failed();

        tracing::warn!(
            message_id = %message.id,
            topic = %message.topic,
            retries = message.retry_count,
            error = %err,
            "Message exhausted retries, moving to dead-letter queue"
        );
        self.observers.dead(&message);

        let exceeded = Error::RetryExceeded {
            id: message.id.clone(),
            attempts: message.retry_count + 1,
        };
        self.observers.processed(&message, Some(&exceeded));

        if let Err(message) = self.dlq.try_push(message) {
            tracing::warn!(
                message_id = %message.id,
                capacity = self.dlq.capacity(),
                "Dead-letter queue full, dropping message"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

async fn run_worker(worker_id: usize, shared: Arc<Shared>) {
    tracing::debug!(worker_id, "Worker starting");

    let batch_size = shared.config.batch_size;
    let mut batch = Vec::with_capacity(batch_size);

    let mut ticker = tokio::time::interval(shared.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            received = shared.recv() => {
                let Some(message) = received else { break };
                shared.metrics.decrement_size();

                if message.delay_until.is_some_and(|until| Utc::now() < until) {
                    shared.scheduler.schedule(message);
                    continue;
                }
                if !message.should_process() {
                    tracing::warn!(message_id = %message.id, status = %message.status, "Dropping message in unexpected state");
                    continue;
                }

                batch.push(message);
                if batch.len() >= batch_size {
                    shared.process_batch(&mut batch).await;
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    shared.process_batch(&mut batch).await;
                }
            }
        }
    }

    if !batch.is_empty() {
        tracing::debug!(worker_id, discarded = batch.len(), "Discarding unflushed batch");
    }
    tracing::debug!(worker_id, "Worker shutting down");
}

async fn prune_dead_letters(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.dlq_prune_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let pruned = shared.dlq.prune_expired(shared.config.dead_letter_ttl);
                if pruned > 0 {
                    tracing::info!(pruned, "Pruned expired dead letters");
                }
            }
        }
    }
}

async fn report_metrics(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.metrics_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let m = shared.metrics.snapshot();
                tracing::info!(
                    total = m.total_messages,
                    processed = m.processed_messages,
                    failed = m.failed_messages,
                    retried = m.retry_messages,
                    dead = m.dead_messages,
                    size = m.current_size,
                    active_workers = m.active_workers,
                    dlq_size = shared.dlq.len(),
                    scheduled = shared.scheduler.pending(),
                    "Queue metrics"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };

    use tokio::sync::Notify;

    use super::*;
    use crate::retry::ExponentialBackoff;

    fn fast_config() -> QueueConfig {
        QueueConfig::builder()
            .workers(2)
            .batch_size(4)
            .poll_interval(Duration::from_millis(10))
            .retry_strategy(Arc::new(
                ExponentialBackoff::builder()
                    .base_delay(Duration::from_millis(5))
                    .max_delay(Duration::from_millis(20))
                    .build(),
            ))
            .build()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cond()
    }

    fn publish(queue: &MessageQueue, topic: &str) -> String {
        queue
            .publish(
                &CancellationToken::new(),
                topic,
                serde_json::json!({"n": 1}),
                PublishOptions::default(),
            )
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_publish_rejects_when_full() {
        let queue = MessageQueue::new(
            QueueConfig::builder()
                .max_size(3)
                .workers(1)
                .batch_size(1)
                .poll_interval(Duration::from_millis(10))
                .build(),
        );

        let started = Arc::new(Notify::new());
        queue.subscribe("slow", {
            let started = started.clone();
            move |cancel: CancellationToken, _msg: Message| {
                let started = started.clone();
                async move {
                    started.notify_one();
                    cancel.cancelled().await;
                    Ok::<_, HandlerError>(())
                }
            }
        });

        // Occupy the only worker.
        publish(&queue, "slow");
        started.notified().await;

        for _ in 0..3 {
            publish(&queue, "slow");
        }
        assert_eq!(queue.get_size(), 3);

        let err = queue
            .publish(
                &CancellationToken::new(),
                "slow",
                1,
                PublishOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull { capacity: 3 }));
        assert_eq!(queue.get_metrics().total_messages, 4);

        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_validates_input() {
        let queue = MessageQueue::new(fast_config());

        let err = queue
            .publish(&CancellationToken::new(), "  ", 1, PublishOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = queue
            .publish(&cancelled, "x", 1, PublishOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        assert_eq!(queue.get_metrics().total_messages, 0);
        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_delayed_message_not_processed_early() {
        let queue = MessageQueue::new(fast_config());
        let early = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));

        queue.subscribe("later", {
            let early = early.clone();
            let handled = handled.clone();
            move |_cancel: CancellationToken, msg: Message| {
                if msg.delay_until.is_some_and(|until| Utc::now() < until) {
                    early.store(true, Ordering::SeqCst);
                }
                handled.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, HandlerError>(()) }
            }
        });

        queue
            .publish(
                &CancellationToken::new(),
                "later",
                1,
                PublishOptions::builder()
                    .delay(Duration::from_millis(150))
                    .build(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 0);
        assert_eq!(queue.get_scheduled_count(), 1);

        assert!(wait_for(|| handled.load(Ordering::SeqCst) == 1).await);
        assert!(!early.load(Ordering::SeqCst));
        assert_eq!(queue.get_scheduled_count(), 0);

        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_requeue_from_dlq() {
        let queue = MessageQueue::new(fast_config());
        let healthy = Arc::new(AtomicBool::new(false));
        let seen_retry_counts = Arc::new(std::sync::Mutex::new(Vec::new()));

        queue.subscribe("flaky", {
            let healthy = healthy.clone();
            let seen = seen_retry_counts.clone();
            move |_cancel: CancellationToken, msg: Message| {
                seen.lock().unwrap().push(msg.retry_count);
                let ok = healthy.load(Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(())
                    } else {
                        Err(eyre::eyre!("unavailable"))
                    }
                }
            }
        });

        let id = queue
            .publish(
                &CancellationToken::new(),
                "flaky",
                1,
                PublishOptions::builder().max_retries(1).build(),
            )
            .unwrap();

        assert!(wait_for(|| queue.get_dlq_size() == 1).await);
        assert_eq!(queue.get_metrics().dead_messages, 1);

        assert!(matches!(
            queue.requeue_from_dlq("nope"),
            Err(Error::InvalidMessage { .. })
        ));

        healthy.store(true, Ordering::SeqCst);
        queue.requeue_from_dlq(&id).unwrap();
        assert_eq!(queue.get_dlq_size(), 0);

        assert!(wait_for(|| queue.get_metrics().processed_messages == 1).await);
        let metrics = queue.get_metrics();
        assert_eq!(metrics.dead_messages, 0);
        assert_eq!(*seen_retry_counts.lock().unwrap(), vec![0, 1, 0]);

        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handler_panic_is_contained() {
        let queue = MessageQueue::new(fast_config());
        queue.subscribe("boom", |_cancel: CancellationToken, _msg: Message| async {
            if true {
                panic!("handler blew up");
            }
            Ok::<_, HandlerError>(())
        });
        queue.subscribe("fine", |_cancel: CancellationToken, _msg: Message| async {
            Ok::<_, HandlerError>(())
        });

        queue
            .publish(
                &CancellationToken::new(),
                "boom",
                1,
                PublishOptions::builder().max_retries(1).build(),
            )
            .unwrap();
        assert!(wait_for(|| queue.get_dlq_size() == 1).await);

        publish(&queue, "fine");
        assert!(wait_for(|| queue.get_metrics().processed_messages == 1).await);

        let metrics = queue.get_metrics();
        assert_eq!(metrics.retry_messages, 1);
        assert_eq!(metrics.dead_messages, 1);

        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_observers_see_lifecycle() {
        let queue = MessageQueue::new(fast_config());
        queue.subscribe("fail", |_cancel: CancellationToken, _msg: Message| async {
            Err::<(), _>(eyre::eyre!("nope"))
        });

        let published = Arc::new(AtomicUsize::new(0));
        let retries = Arc::new(AtomicUsize::new(0));
        let exceeded = Arc::new(AtomicUsize::new(0));
        let dead = Arc::new(AtomicUsize::new(0));

        queue.on_published({
            let published = published.clone();
            move |_| {
                published.fetch_add(1, Ordering::SeqCst);
            }
        });
        // A second observer for the same event must not replace the first.
        queue.on_published({
            let published = published.clone();
            move |_| {
                published.fetch_add(1, Ordering::SeqCst);
            }
        });
        queue.on_retry({
            let retries = retries.clone();
            move |_, err| {
                assert_eq!(err.to_string(), "nope");
                retries.fetch_add(1, Ordering::SeqCst);
            }
        });
        queue.on_processed({
            let exceeded = exceeded.clone();
            move |msg, err| {
                if let Some(Error::RetryExceeded { attempts, .. }) = err {
                    assert_eq!(*attempts, 3);
                    assert_eq!(msg.status, MessageStatus::Dead);
                    exceeded.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        let dead_id = queue.on_dead({
            let dead = dead.clone();
            move |_| {
                dead.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue
            .publish(
                &CancellationToken::new(),
                "fail",
                1,
                PublishOptions::builder().max_retries(2).build(),
            )
            .unwrap();

        assert!(wait_for(|| exceeded.load(Ordering::SeqCst) == 1).await);
        assert_eq!(published.load(Ordering::SeqCst), 2);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
        assert_eq!(dead.load(Ordering::SeqCst), 1);

        assert!(queue.remove_observer(dead_id));
        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unsubscribe_and_handlers() {
        let queue = MessageQueue::new(fast_config());
        queue.subscribe("b", |_cancel: CancellationToken, _msg: Message| async {
            Ok::<_, HandlerError>(())
        });
        queue.subscribe("a", |_cancel: CancellationToken, _msg: Message| async {
            Ok::<_, HandlerError>(())
        });
        assert_eq!(queue.get_handlers(), vec!["a", "b"]);

        queue.unsubscribe("a");
        assert_eq!(queue.get_handlers(), vec!["b"]);

        publish(&queue, "a");
        assert!(wait_for(|| queue.get_metrics().failed_messages == 1).await);
        assert_eq!(queue.get_dlq_size(), 0);

        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_cancels_handlers_and_rejects_work() {
        let queue = MessageQueue::new(fast_config());
        let started = Arc::new(Notify::new());
        let saw_cancel = Arc::new(AtomicBool::new(false));

        queue.subscribe("wait", {
            let started = started.clone();
            let saw_cancel = saw_cancel.clone();
            move |cancel: CancellationToken, _msg: Message| {
                let started = started.clone();
                let saw_cancel = saw_cancel.clone();
                async move {
                    started.notify_one();
                    cancel.cancelled().await;
                    saw_cancel.store(true, Ordering::SeqCst);
                    Ok::<_, HandlerError>(())
                }
            }
        });

        publish(&queue, "wait");
        started.notified().await;

        tokio::time::timeout(Duration::from_secs(5), queue.stop())
            .await
            .expect("stop should not hang")
            .unwrap();
        assert!(saw_cancel.load(Ordering::SeqCst));

        assert!(matches!(
            queue.publish(&CancellationToken::new(), "wait", 1, PublishOptions::default()),
            Err(Error::ConsumerStopped)
        ));
        assert!(matches!(
            queue.requeue_from_dlq("any"),
            Err(Error::ConsumerStopped)
        ));

        // Second stop is a no-op.
        queue.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_reporter_runs_when_enabled() {
        let queue = MessageQueue::new(
            QueueConfig::builder()
                .enable_metrics(true)
                .metrics_interval(Duration::from_millis(10))
                .poll_interval(Duration::from_millis(10))
                .build(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            queue.get_metrics().workers,
            crate::config::DEFAULT_WORKERS
        );
        queue.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_dlq_pruned_after_ttl() {
        let queue = MessageQueue::new(
            QueueConfig::builder()
                .poll_interval(Duration::from_millis(10))
                .dead_letter_ttl(Duration::from_millis(50))
                .dlq_prune_interval(Duration::from_millis(20))
                .build(),
        );
        queue.subscribe("fail", |_cancel: CancellationToken, _msg: Message| async {
            Err::<(), _>(eyre::eyre!("nope"))
        });

        queue
            .publish(
                &CancellationToken::new(),
                "fail",
                1,
                PublishOptions::builder().max_retries(0).build(),
            )
            .unwrap();

        assert!(wait_for(|| queue.get_metrics().dead_messages == 1).await);
        assert!(wait_for(|| queue.get_dlq_size() == 0).await);

        queue.stop().await.unwrap();
    }
}
