//! # Event Bus
//!
//! Fan-out of domain events to typed handlers and named subscribers. Every
//! delivery runs on its own task, so a slow or panicking observer never holds
//! up the trading path or the other observers.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::dex::PnLResult;
use crate::error::BotResult;
use crate::models::Operation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskExecuted,
    PositionCreated,
    PositionUpdated,
    SellCompleted,
    MonitoringSessionStarted,
    MonitoringSessionStopped,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::TaskExecuted,
        EventType::PositionCreated,
        EventType::PositionUpdated,
        EventType::SellCompleted,
        EventType::MonitoringSessionStarted,
        EventType::MonitoringSessionStopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskExecuted => "task_executed",
            EventType::PositionCreated => "position_created",
            EventType::PositionUpdated => "position_updated",
            EventType::SellCompleted => "sell_completed",
            EventType::MonitoringSessionStarted => "monitoring_session_started",
            EventType::MonitoringSessionStopped => "monitoring_session_stopped",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    TaskExecuted {
        task_id: u64,
        token_mint: String,
        operation: Operation,
        success: bool,
        tx_signature: Option<String>,
        error: Option<String>,
    },
    PositionCreated {
        task_id: u64,
        token_mint: String,
        wallet: String,
        amount_sol: f64,
        /// Raw balance observed after the buy, 0 when it could not be read
        token_amount: u64,
        entry_price: f64,
    },
    PositionUpdated {
        token_mint: String,
        current_price: f64,
        initial_price: f64,
        percent_change: f64,
        tokens: f64,
    },
    SellCompleted {
        token_mint: String,
        percentage: f64,
        success: bool,
        tx_signature: Option<String>,
        error: Option<String>,
        pnl: Option<PnLResult>,
    },
    MonitoringSessionStarted {
        task_id: u64,
        token_mint: String,
        initial_price: f64,
    },
    MonitoringSessionStopped {
        token_mint: String,
        reason: String,
    },
}

/// A published event; cheap to share behind an `Arc`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(user_id: impl Into<String>, payload: EventPayload) -> Self {
        Self { timestamp: Utc::now(), user_id: user_id.into(), payload }
    }

    pub fn event_type(&self) -> EventType {
        match &self.payload {
            EventPayload::TaskExecuted { .. } => EventType::TaskExecuted,
            EventPayload::PositionCreated { .. } => EventType::PositionCreated,
            EventPayload::PositionUpdated { .. } => EventType::PositionUpdated,
            EventPayload::SellCompleted { .. } => EventType::SellCompleted,
            EventPayload::MonitoringSessionStarted { .. } => EventType::MonitoringSessionStarted,
            EventPayload::MonitoringSessionStopped { .. } => EventType::MonitoringSessionStopped,
        }
    }

    /// Mint the event concerns, if any
    pub fn token_mint(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::TaskExecuted { token_mint, .. }
            | EventPayload::PositionCreated { token_mint, .. }
            | EventPayload::PositionUpdated { token_mint, .. }
            | EventPayload::SellCompleted { token_mint, .. }
            | EventPayload::MonitoringSessionStarted { token_mint, .. }
            | EventPayload::MonitoringSessionStopped { token_mint, .. } => Some(token_mint),
        }
    }
}

/// Observer registered for one event type
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> BotResult<()>;

    fn can_handle(&self, _event: &Event) -> bool {
        true
    }
}

/// Observer registered by event name, possibly for several types
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: &Event);

    fn subscribed_event_types(&self) -> Vec<EventType>;
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    subscribers: RwLock<HashMap<EventType, Vec<Arc<dyn EventSubscriber>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers.write().entry(event_type).or_default().push(handler);
        debug!("registered handler for {}", event_type);
    }

    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let types = subscriber.subscribed_event_types();
        let mut subscribers = self.subscribers.write();
        for event_type in types {
            subscribers.entry(event_type).or_default().push(Arc::clone(&subscriber));
        }
    }

    /// Fan the event out to every interested observer.
    ///
    /// Registries are snapshotted and released before anything runs, and
    /// each delivery is spawned separately. Returns the number of deliveries
    /// started; delivery order across observers is unspecified.
    pub fn publish(&self, event: Event) -> usize {
        let event_type = event.event_type();
        let event = Arc::new(event);

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&event_type)
            .map(|h| h.iter().filter(|h| h.can_handle(&event)).cloned().collect())
            .unwrap_or_default();
        let subscribers: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        let deliveries = handlers.len() + subscribers.len();

        for handler in handlers {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("handler for {} failed: {}", event_type, e),
                    Err(_) => error!("handler for {} panicked", event_type),
                }
            });
        }

        for subscriber in subscribers {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if AssertUnwindSafe(subscriber.on_event(&event)).catch_unwind().await.is_err() {
                    error!("subscriber for {} panicked", event_type);
                }
            });
        }

        deliveries
    }
}

/// Logs every event at info level
pub struct LoggingSubscriber;

#[async_trait]
impl EventSubscriber for LoggingSubscriber {
    async fn on_event(&self, event: &Event) {
        match &event.payload {
            EventPayload::TaskExecuted { task_id, token_mint, operation, success, error, .. } => {
                if *success {
                    info!("✅ task {} {} {} executed", task_id, operation, token_mint);
                } else {
                    warn!("❌ task {} {} {} failed: {}", task_id, operation, token_mint,
                          error.as_deref().unwrap_or("unknown error"));
                }
            }
            EventPayload::PositionCreated { token_mint, amount_sol, token_amount, entry_price, .. } => {
                info!("📈 position opened on {}: {} SOL for {} units @ {:.12}",
                      token_mint, amount_sol, token_amount, entry_price);
            }
            EventPayload::PositionUpdated { token_mint, current_price, percent_change, .. } => {
                debug!("{} @ {:.12} ({:+.2}%)", token_mint, current_price, percent_change);
            }
            EventPayload::SellCompleted { token_mint, percentage, success, error, .. } => {
                if *success {
                    info!("💰 sold {}% of {}", percentage, token_mint);
                } else {
                    warn!("❌ sell of {}% {} failed: {}", percentage, token_mint,
                          error.as_deref().unwrap_or("unknown error"));
                }
            }
            EventPayload::MonitoringSessionStarted { token_mint, initial_price, .. } => {
                info!("👀 monitoring {} from {:.12}", token_mint, initial_price);
            }
            EventPayload::MonitoringSessionStopped { token_mint, reason } => {
                info!("🛑 monitoring of {} stopped: {}", token_mint, reason);
            }
        }
    }

    fn subscribed_event_types(&self) -> Vec<EventType> {
        EventType::ALL.to_vec()
    }
}

/// Forwards every event into a channel so tests can assert on them
#[cfg(test)]
pub struct EventRecorder {
    tx: tokio::sync::mpsc::UnboundedSender<Event>,
}

#[cfg(test)]
impl EventRecorder {
    pub fn attach(bus: &EventBus) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(Arc::new(EventRecorder { tx }));
        rx
    }
}

#[cfg(test)]
#[async_trait]
impl EventSubscriber for EventRecorder {
    async fn on_event(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }

    fn subscribed_event_types(&self) -> Vec<EventType> {
        EventType::ALL.to_vec()
    }
}

/// Drain whatever arrives within `wait`, ordered by event timestamp
#[cfg(test)]
pub async fn collect_events(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    wait: std::time::Duration,
) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        events.push(event);
    }
    events.sort_by_key(|e| e.timestamp);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct PanickingSubscriber;

    #[async_trait]
    impl EventSubscriber for PanickingSubscriber {
        async fn on_event(&self, _event: &Event) {
            panic!("observer bug");
        }

        fn subscribed_event_types(&self) -> Vec<EventType> {
            vec![EventType::SellCompleted]
        }
    }

    struct MintFilterHandler {
        mint: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for MintFilterHandler {
        async fn handle(&self, _event: &Event) -> BotResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BotError::Internal("handler failures are only logged".to_string()))
        }

        fn can_handle(&self, event: &Event) -> bool {
            event.token_mint() == Some(self.mint)
        }
    }

    fn sell_completed(mint: &str) -> Event {
        Event::new("u1", EventPayload::SellCompleted {
            token_mint: mint.to_string(),
            percentage: 50.0,
            success: true,
            tx_signature: Some("sig".to_string()),
            error: None,
            pnl: None,
        })
    }

    #[tokio::test]
    async fn test_panicking_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(PanickingSubscriber));
        let mut rx = EventRecorder::attach(&bus);

        assert_eq!(bus.publish(sell_completed("M")), 2);
        let events = collect_events(&mut rx, Duration::from_millis(200)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), EventType::SellCompleted);
    }

    #[tokio::test]
    async fn test_handlers_filtered_by_can_handle() {
        let bus = EventBus::new();
        let handler = Arc::new(MintFilterHandler { mint: "M", calls: AtomicU32::new(0) });
        bus.register_handler(EventType::SellCompleted, handler.clone());

        assert_eq!(bus.publish(sell_completed("OTHER")), 0);
        assert_eq!(bus.publish(sell_completed("M")), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribed_types_not_delivered() {
        let bus = EventBus::new();
        bus.subscribe(Arc::new(PanickingSubscriber));
        let stopped = Event::new("u1", EventPayload::MonitoringSessionStopped {
            token_mint: "M".to_string(),
            reason: "exit".to_string(),
        });
        assert_eq!(bus.publish(stopped), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(sell_completed("M")).unwrap();
        assert_eq!(json["type"], "sell_completed");
        assert_eq!(json["user_id"], "u1");
        assert_eq!(json["token_mint"], "M");
    }
}
