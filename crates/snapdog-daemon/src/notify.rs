//! Bounded, back-pressured status-event fan-out.
//!
//! Engines publish into a bounded channel (publishers suspend when it is
//! full; events are never dropped on the way in).  A single consumer keeps
//! per-adapter ordering intact and delivers each event to all registered
//! sinks in parallel.  A failing sink is retried with doubling backoff up to
//! the configured attempt count, then the event is dead-lettered to the log.
//! On shutdown the queue drains for the configured window; whatever remains
//! is dead-lettered too.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use snapdog_core::command::{Notification, StatusEvent};
use snapdog_core::config::NotificationConfig;
use snapdog_core::{Error, Result};

/// An adapter that receives every status event once, in emission order.
#[async_trait]
pub trait StatusSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, event: &StatusEvent) -> Result<()>;
}

/// Cloneable publish handle.  `publish` blocks while the queue is full.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Notification>,
}

impl Publisher {
    pub async fn publish(&self, event: StatusEvent) {
        if self.tx.send(Notification::new(event)).await.is_err() {
            debug!("notify: queue is gone, dropping event");
        }
    }

    /// Publish an error event derived from a failed command.
    pub async fn publish_error(
        &self,
        error: &Error,
        correlation_id: Option<snapdog_core::command::CorrelationId>,
    ) {
        self.publish(StatusEvent::Error {
            kind: error.kind().to_string(),
            detail: error.to_string(),
            correlation_id,
        })
        .await;
    }
}

#[cfg(test)]
impl Publisher {
    /// Test hook: a publisher feeding a bare channel instead of the queue.
    pub(crate) fn from_sender(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

/// Registered adapters.  Registration happens during wiring; the consumer
/// snapshots the list per event.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: Arc<std::sync::RwLock<Vec<Arc<dyn StatusSink>>>>,
}

impl SinkRegistry {
    pub fn register(&self, sink: Arc<dyn StatusSink>) {
        self.sinks.write().unwrap().push(sink);
    }

    fn snapshot(&self) -> Vec<Arc<dyn StatusSink>> {
        self.sinks.read().unwrap().clone()
    }
}

pub struct NotificationQueue {
    publisher: Publisher,
    registry: SinkRegistry,
    handle: tokio::task::JoinHandle<()>,
}

impl NotificationQueue {
    pub fn spawn(
        config: NotificationConfig,
        sinks: Vec<Arc<dyn StatusSink>>,
        cancel: CancellationToken,
    ) -> Self {
        let registry = SinkRegistry::default();
        for sink in sinks {
            registry.register(sink);
        }
        let (tx, rx) = mpsc::channel(config.max_queue_capacity);
        let handle = tokio::spawn(consumer(config, registry.clone(), rx, cancel));
        Self {
            publisher: Publisher { tx },
            registry,
            handle,
        }
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Add an adapter; it receives every event published afterwards.
    pub fn register(&self, sink: Arc<dyn StatusSink>) {
        self.registry.register(sink);
    }

    /// Wait for the consumer to finish its shutdown drain.
    pub async fn join(self) {
        drop(self.publisher);
        let _ = self.handle.await;
    }
}

async fn consumer(
    config: NotificationConfig,
    registry: SinkRegistry,
    mut rx: mpsc::Receiver<Notification>,
    cancel: CancellationToken,
) {
    // bounds concurrent per-sink deliveries of one event
    let slots = Arc::new(Semaphore::new(config.max_concurrency));

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            notification = rx.recv() => match notification {
                Some(n) => n,
                None => return,
            },
        };
        deliver_to_all(&config, &registry.snapshot(), &slots, notification, &cancel).await;
    }

    // drain what is already queued after cancellation; everything left when
    // the window closes is dead-lettered
    let window = Duration::from_secs(config.shutdown_timeout_seconds);
    let mut drained = 0usize;
    let drain = async {
        loop {
            match rx.try_recv() {
                Ok(notification) => {
                    deliver_to_all(&config, &registry.snapshot(), &slots, notification, &cancel)
                        .await;
                    drained += 1;
                }
                Err(mpsc::error::TryRecvError::Empty)
                | Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
    };
    let _ = tokio::time::timeout(window, drain).await;

    rx.close();
    let mut dead = 0usize;
    while let Ok(notification) = rx.try_recv() {
        dead_letter(&notification, "shutdown window elapsed");
        dead += 1;
    }
    info!("notify: shut down ({drained} drained, {dead} dead-lettered)");
}

async fn deliver_to_all(
    config: &NotificationConfig,
    sinks: &[Arc<dyn StatusSink>],
    slots: &Arc<Semaphore>,
    notification: Notification,
    cancel: &CancellationToken,
) {
    let deliveries = sinks.iter().map(|sink| {
        let sink = sink.clone();
        let slots = slots.clone();
        let mut notification = notification.clone();
        async move {
            let _slot = slots.acquire().await;
            deliver_with_retry(config, sink.as_ref(), &mut notification, cancel).await;
        }
    });
    futures_util::future::join_all(deliveries).await;
}

async fn deliver_with_retry(
    config: &NotificationConfig,
    sink: &dyn StatusSink,
    notification: &mut Notification,
    cancel: &CancellationToken,
) {
    loop {
        notification.attempt += 1;
        match sink.deliver(&notification.event).await {
            Ok(()) => return,
            Err(e) => {
                if notification.attempt > config.max_retry_attempts {
                    dead_letter(
                        notification,
                        &format!("{} failed after {} attempts: {e}", sink.name(), notification.attempt),
                    );
                    return;
                }
                let backoff = Duration::from_millis(
                    (config.retry_base_delay_ms << (notification.attempt - 1).min(16))
                        .min(config.retry_max_delay_ms),
                );
                debug!(
                    "notify: {} rejected {} (attempt {}), retrying in {:?}: {e}",
                    sink.name(),
                    notification.event.event_type(),
                    notification.attempt,
                    backoff
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        dead_letter(notification, "cancelled during retry backoff");
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
}

/// Structured last-resort record of an undeliverable event.
fn dead_letter(notification: &Notification, reason: &str) {
    warn!(
        event = notification.event.event_type(),
        attempts = notification.attempt,
        enqueued_at = %notification.enqueued_at,
        payload = %serde_json::to_string(&notification.event).unwrap_or_default(),
        "notify: dead-lettered: {reason}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_config() -> NotificationConfig {
        NotificationConfig {
            max_queue_capacity: 4,
            max_concurrency: 2,
            max_retry_attempts: 3,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 100,
            shutdown_timeout_seconds: 1,
        }
    }

    struct RecordingSink {
        name: &'static str,
        seen: Mutex<Vec<String>>,
        fail_first: AtomicUsize,
    }

    impl RecordingSink {
        fn new(name: &'static str, fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                fail_first: AtomicUsize::new(fail_first),
            })
        }
    }

    #[async_trait]
    impl StatusSink for RecordingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn deliver(&self, event: &StatusEvent) -> Result<()> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::transport("sink busy"));
            }
            self.seen.lock().unwrap().push(event.event_type().to_string());
            Ok(())
        }
    }

    fn volume_event(volume: u8) -> StatusEvent {
        StatusEvent::VolumeChanged { zone: 1, volume }
    }

    #[tokio::test]
    async fn delivers_to_every_sink_in_order() {
        let a = RecordingSink::new("a", 0);
        let b = RecordingSink::new("b", 0);
        let cancel = CancellationToken::new();
        let queue = NotificationQueue::spawn(
            test_config(),
            vec![a.clone(), b.clone()],
            cancel.clone(),
        );

        let publisher = queue.publisher();
        publisher.publish(volume_event(1)).await;
        publisher
            .publish(StatusEvent::MuteChanged { zone: 1, muted: true })
            .await;
        publisher.publish(volume_event(2)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let expected = vec![
            "volume_changed".to_string(),
            "mute_changed".to_string(),
            "volume_changed".to_string(),
        ];
        assert_eq!(*a.seen.lock().unwrap(), expected);
        assert_eq!(*b.seen.lock().unwrap(), expected);
        cancel.cancel();
        queue.join().await;
    }

    #[tokio::test]
    async fn retries_until_sink_recovers() {
        let flaky = RecordingSink::new("flaky", 2);
        let cancel = CancellationToken::new();
        let queue = NotificationQueue::spawn(test_config(), vec![flaky.clone()], cancel.clone());

        queue.publisher().publish(volume_event(10)).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(flaky.seen.lock().unwrap().len(), 1);
        cancel.cancel();
        queue.join().await;
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_once() {
        // fails more often than max_retry_attempts allows
        let broken = RecordingSink::new("broken", 100);
        let healthy = RecordingSink::new("healthy", 0);
        let cancel = CancellationToken::new();
        let queue = NotificationQueue::spawn(
            test_config(),
            vec![broken.clone(), healthy.clone()],
            cancel.clone(),
        );

        queue.publisher().publish(volume_event(10)).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(broken.seen.lock().unwrap().is_empty());
        assert_eq!(healthy.seen.lock().unwrap().len(), 1, "other sinks unaffected");
        cancel.cancel();
        queue.join().await;
    }

    #[tokio::test]
    async fn publisher_blocks_when_full_instead_of_dropping() {
        // a sink that blocks forever while holding the consumer
        struct StuckSink;
        #[async_trait]
        impl StatusSink for StuckSink {
            fn name(&self) -> &'static str {
                "stuck"
            }
            async fn deliver(&self, _event: &StatusEvent) -> Result<()> {
                std::future::pending().await
            }
        }

        let cancel = CancellationToken::new();
        let mut config = test_config();
        config.max_queue_capacity = 2;
        let queue = NotificationQueue::spawn(config, vec![Arc::new(StuckSink)], cancel.clone());
        let publisher = queue.publisher();

        // consumer takes one, capacity 2 buffers two more
        for i in 0..3 {
            publisher.publish(volume_event(i)).await;
        }
        // the queue is now full: the next publish must suspend
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            publisher.publish(volume_event(99)),
        )
        .await;
        assert!(blocked.is_err(), "publish into a full queue must block");
        cancel.cancel();
    }
}
