//! Topic-based event fan-out
//!
//! Watchers publish anomaly events on `anomaly.<metric>` topics; handlers
//! subscribe with a [`TopicFilter`]. Handler failures are reported on the
//! `handler.error` topic as [`BusEvent::HandlerError`].

mod bus;

pub use bus::{EventBus, SubscriptionHandle};

use crate::models::AnomalyEvent;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic handler failures are reported on
pub const HANDLER_ERROR_TOPIC: &str = "handler.error";

/// A failed, timed out or panicked handler invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub timestamp: DateTime<Utc>,
    pub handler: String,
    pub topic: String,
    /// Id of the anomaly the handler was processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub error: String,
}

/// Everything that travels over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum BusEvent {
    Anomaly(AnomalyEvent),
    HandlerError(HandlerFailure),
}

impl BusEvent {
    pub fn topic(&self) -> String {
        match self {
            BusEvent::Anomaly(event) => event.topic(),
            BusEvent::HandlerError(_) => HANDLER_ERROR_TOPIC.to_string(),
        }
    }

    pub fn as_anomaly(&self) -> Option<&AnomalyEvent> {
        match self {
            BusEvent::Anomaly(event) => Some(event),
            BusEvent::HandlerError(_) => None,
        }
    }
}

/// Which topics a subscription receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    All,
    Exact(String),
    /// Matches topics starting with the given prefix, e.g. `anomaly.`
    Prefix(String),
}

impl TopicFilter {
    /// Parse `*`, `anomaly.*` or an exact topic
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            TopicFilter::All
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            TopicFilter::Prefix(prefix.to_string())
        } else {
            TopicFilter::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Exact(exact) => exact == topic,
            TopicFilter::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }
}

/// A bus subscriber
///
/// Each invocation runs in its own task under the bus handler timeout, so a
/// failing, slow or panicking handler never affects the publisher or other
/// subscribers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs, metrics and failure reports
    fn name(&self) -> &str;

    async fn handle(&self, event: &BusEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_filter() {
        assert!(TopicFilter::parse("*").matches("anomaly.cpu"));
        assert!(TopicFilter::parse("*").matches(HANDLER_ERROR_TOPIC));

        let prefix = TopicFilter::parse("anomaly.*");
        assert_eq!(prefix, TopicFilter::Prefix("anomaly.".to_string()));
        assert!(prefix.matches("anomaly.memory"));
        assert!(!prefix.matches("handler.error"));

        let exact = TopicFilter::parse("anomaly.load");
        assert!(exact.matches("anomaly.load"));
        assert!(!exact.matches("anomaly.loadavg"));
    }

    #[test]
    fn test_handler_error_record_format() {
        let event = BusEvent::HandlerError(HandlerFailure {
            timestamp: Utc::now(),
            handler: "console".to_string(),
            topic: "anomaly.cpu".to_string(),
            event_id: None,
            error: "boom".to_string(),
        });
        assert_eq!(event.topic(), HANDLER_ERROR_TOPIC);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["record"], "handler_error");
        assert_eq!(json["handler"], "console");
        assert!(json.get("event_id").is_none());
    }
}
