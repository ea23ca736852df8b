//! Event bus
//!
//! Every subscription owns a bounded queue and a dispatch task. `publish`
//! only enqueues with `try_send`, so it never waits on a subscriber; a full
//! queue drops the event for that subscriber and counts it. The dispatch
//! task handles its queue in order, running each invocation in a separate
//! task so panics and timeouts stay contained.

use super::{BusEvent, EventHandler, HandlerFailure, TopicFilter, HANDLER_ERROR_TOPIC};
use crate::config::BusConfig;
use crate::error::BusError;
use crate::observability::MonitorMetrics;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

type Envelope = (String, Arc<BusEvent>);

/// Returned by [`EventBus::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

struct Subscription {
    filter: TopicFilter,
    handler_name: String,
    tx: mpsc::Sender<Envelope>,
}

struct BusInner {
    config: BusConfig,
    subscriptions: DashMap<u64, Subscription>,
    next_id: AtomicU64,
    closed: AtomicBool,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    metrics: MonitorMetrics,
}

/// Topic-based publish/subscribe hub
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create the bus; a zero queue capacity is rejected
    pub fn new(config: BusConfig) -> Result<Self, BusError> {
        if config.queue_capacity == 0 {
            return Err(BusError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if config.handler_timeout_secs == 0 {
            return Err(BusError::InvalidConfig(
                "handler_timeout_secs must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                subscriptions: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                dispatchers: Mutex::new(Vec::new()),
                metrics: MonitorMetrics::new(),
            }),
        })
    }

    /// Register a handler for topics matching `filter`
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        filter: TopicFilter,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);

        debug!(handler = %handler.name(), filter = ?filter, "Subscribing handler");
        self.inner.subscriptions.insert(
            id,
            Subscription {
                filter,
                handler_name: handler.name().to_string(),
                tx,
            },
        );

        let task = tokio::spawn(dispatch(
            Arc::downgrade(&self.inner),
            handler,
            rx,
            self.inner.config.handler_timeout(),
        ));
        if let Ok(mut dispatchers) = self.inner.dispatchers.lock() {
            dispatchers.retain(|h| !h.is_finished());
            dispatchers.push(task);
        }

        SubscriptionHandle(id)
    }

    /// Remove a subscription; already queued events are still delivered
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.subscriptions.remove(&handle.0).is_some()
    }

    /// Fan `event` out to every matching subscription without waiting
    ///
    /// Returns the number of subscriptions the event was queued for.
    pub fn publish(&self, topic: &str, event: BusEvent) -> Result<usize, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(self.inner.fan_out(topic, Arc::new(event)))
    }

    /// Stop accepting publishes
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            info!("Event bus closed to publishers");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Close the bus, let handlers drain their queues within `grace`, then
    /// abort whatever is still running
    pub async fn shutdown(&self, grace: Duration) {
        self.close();
        // Dropping the senders ends each dispatch loop once its queue is empty
        self.inner.subscriptions.clear();

        let dispatchers: Vec<JoinHandle<()>> = match self.inner.dispatchers.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let deadline = Instant::now() + grace;
        let mut aborted = 0usize;
        for mut task in dispatchers {
            if timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted, "Handlers did not drain within grace period");
        } else {
            info!("Event bus drained");
        }
    }
}

impl BusInner {
    fn fan_out(&self, topic: &str, event: Arc<BusEvent>) -> usize {
        let mut delivered = 0;
        for subscription in self.subscriptions.iter() {
            if !subscription.filter.matches(topic) {
                continue;
            }
            match subscription
                .tx
                .try_send((topic.to_string(), Arc::clone(&event)))
            {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.inc_events_dropped(&subscription.handler_name);
                    warn!(
                        handler = %subscription.handler_name,
                        topic = %topic,
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(handler = %subscription.handler_name, "Subscriber gone");
                }
            }
        }
        delivered
    }

    fn report_failure(&self, handler: &str, topic: &str, event: &BusEvent, error: String) {
        self.metrics.inc_handler_failures(handler);
        error!(handler = %handler, topic = %topic, error = %error, "Handler failed");

        // Failures while handling a failure report are only logged
        if matches!(event, BusEvent::HandlerError(_)) || self.closed.load(Ordering::SeqCst) {
            return;
        }

        let failure = BusEvent::HandlerError(HandlerFailure {
            timestamp: Utc::now(),
            handler: handler.to_string(),
            topic: topic.to_string(),
            event_id: event.as_anomaly().map(|e| e.id),
            error,
        });
        self.fan_out(HANDLER_ERROR_TOPIC, Arc::new(failure));
    }
}

/// Per-subscription dispatch loop
async fn dispatch(
    bus: Weak<BusInner>,
    handler: Arc<dyn EventHandler>,
    mut rx: mpsc::Receiver<Envelope>,
    handler_timeout: Duration,
) {
    while let Some((topic, event)) = rx.recv().await {
        let invocation = {
            let handler = Arc::clone(&handler);
            let event = Arc::clone(&event);
            tokio::spawn(async move { handler.handle(&event).await })
        };
        let abort = invocation.abort_handle();

        let failure = match timeout(handler_timeout, invocation).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(format!("{:#}", e)),
            Ok(Err(join_error)) if join_error.is_panic() => {
                Some("handler panicked".to_string())
            }
            Ok(Err(join_error)) => Some(join_error.to_string()),
            Err(_) => {
                abort.abort();
                Some(format!("timed out after {}s", handler_timeout.as_secs()))
            }
        };

        if let Some(error) = failure {
            match bus.upgrade() {
                Some(bus) => bus.report_failure(handler.name(), &topic, &event, error),
                None => warn!(handler = %handler.name(), error = %error, "Handler failed"),
            }
        }
    }
    debug!(handler = %handler.name(), "Dispatch loop finished");
}
