//! Process-wide registry of monitoring sessions, at most one per mint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus, EventPayload};
use crate::error::{BotError, BotResult};
use crate::monitor::session::{MonitoringSession, SessionConfig};
use crate::shutdown::Closer;

pub const SYSTEM_USER: &str = "system";

pub struct MonitorService {
    sessions: Mutex<HashMap<String, Arc<MonitoringSession>>>,
    event_bus: Arc<EventBus>,
    root: CancellationToken,
}

impl MonitorService {
    pub fn new(event_bus: Arc<EventBus>, root: CancellationToken) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            event_bus,
            root,
        }
    }

    /// Token new sessions derive their cancellation from
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Claim the mint for `session`; fails if another live session holds it
    pub fn register(&self, session: Arc<MonitoringSession>) -> BotResult<()> {
        let mint = session.mint().to_string();
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&mint) {
            if existing.is_active() {
                return Err(BotError::SessionExists(mint));
            }
            debug!("replacing terminated session for {}", mint);
        }
        sessions.insert(mint, session);
        Ok(())
    }

    /// Remove `session` if it is still the registered one for its mint
    pub fn unregister(&self, session: &Arc<MonitoringSession>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session.mint()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.mint());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, mint: &str) -> Option<Arc<MonitoringSession>> {
        self.sessions.lock().get(mint).cloned()
    }

    pub fn active_mints(&self) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.is_active())
            .map(|(mint, _)| mint.clone())
            .collect()
    }

    /// Register and announce a session the caller will drive itself
    pub fn attach(&self, session: Arc<MonitoringSession>, user_id: &str) -> BotResult<()> {
        let task_id = session.task().id;
        let mint = session.mint().to_string();
        let initial_price = session.initial_price();
        self.register(session)?;

        self.event_bus.publish(Event::new(user_id, EventPayload::MonitoringSessionStarted {
            task_id,
            token_mint: mint,
            initial_price,
        }));
        Ok(())
    }

    /// Unregister and announce the end of a session. Only the call that
    /// actually removes the session publishes `MonitoringSessionStopped`.
    pub fn detach(&self, session: &Arc<MonitoringSession>, reason: &str, user_id: &str) -> bool {
        if !self.unregister(session) {
            return false;
        }
        self.publish_stopped(session.mint(), reason, user_id);
        true
    }

    fn publish_stopped(&self, mint: &str, reason: &str, user_id: &str) {
        info!("🛑 monitoring of {} stopped: {}", mint, reason);
        self.event_bus.publish(Event::new(user_id, EventPayload::MonitoringSessionStopped {
            token_mint: mint.to_string(),
            reason: reason.to_string(),
        }));
    }

    /// Create, register and start a session whose updates are published on
    /// the event bus as `PositionUpdated`.
    pub fn start_monitoring(self: &Arc<Self>, config: SessionConfig, user_id: &str) -> BotResult<Arc<MonitoringSession>> {
        let session = MonitoringSession::new(config, &self.root);
        self.attach(Arc::clone(&session), user_id)?;

        if let Err(e) = session.start() {
            self.detach(&session, "start_failed", user_id);
            return Err(e);
        }

        let (Some(mut updates), Some(mut errors)) = (session.take_price_updates(), session.take_errors()) else {
            return Err(BotError::Internal("session receivers already taken".to_string()));
        };

        let service = Arc::clone(self);
        let publisher_session = Arc::clone(&session);
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            let session = publisher_session;
            let mint = session.mint().to_string();
            let mut errors_open = true;

            loop {
                tokio::select! {
                    update = updates.recv() => {
                        let Some(update) = update else { break };
                        if !session.is_active() {
                            continue;
                        }
                        service.event_bus.publish(Event::new(user_id.as_str(), EventPayload::PositionUpdated {
                            token_mint: mint.clone(),
                            current_price: update.current_price,
                            initial_price: update.initial_price,
                            percent_change: update.percent_change,
                            tokens: update.tokens,
                        }));
                    }
                    error = errors.recv(), if errors_open => match error {
                        Some(e) if e.is_transient() => debug!("price read for {} failed: {}", mint, e),
                        Some(e) => warn!("monitoring of {} failed: {}", mint, e),
                        None => errors_open = false,
                    },
                }
            }

            service.detach(&session, "session_terminated", &user_id);
        });

        Ok(session)
    }

    /// Stop the session for `mint` and announce it with `reason`
    pub async fn stop_monitoring(&self, mint: &str, reason: &str, user_id: &str) -> BotResult<()> {
        let session = self
            .sessions
            .lock()
            .remove(mint)
            .ok_or_else(|| BotError::NotFound(format!("monitoring session not found for token {}", mint)))?;

        session.stop().await;
        self.publish_stopped(mint, reason, user_id);
        Ok(())
    }

    pub async fn stop_all(&self, reason: &str) {
        let sessions: Vec<Arc<MonitoringSession>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }

        info!("stopping {} monitoring session(s)", sessions.len());
        join_all(sessions.iter().map(|s| s.stop())).await;
        for session in &sessions {
            self.publish_stopped(session.mint(), reason, SYSTEM_USER);
        }
    }
}

#[async_trait]
impl Closer for MonitorService {
    async fn close(&self) -> BotResult<()> {
        self.stop_all("shutdown").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::{collect_events, EventRecorder};
    use crate::bus::EventType;
    use crate::dex::mock::MockDex;
    use crate::models::task::sample_task;
    use crate::models::Operation;
    use crate::monitor::session::SessionState;
    use std::time::Duration;

    const MINT: &str = "So11111111111111111111111111111111111111112";

    fn config(dex: Arc<MockDex>) -> SessionConfig {
        let task = Arc::new(sample_task(1, Operation::Snipe, MINT));
        SessionConfig::new(task, dex)
            .with_initial_price(1.0)
            .with_token_balance(1_000_000)
            .with_polling_interval(Duration::from_millis(50))
    }

    fn service() -> Arc<MonitorService> {
        Arc::new(MonitorService::new(Arc::new(EventBus::new()), CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_second_session_for_mint_rejected() {
        let service = service();
        let dex = Arc::new(MockDex::new(1.0, 1_000_000));
        let first = service.start_monitoring(config(dex.clone()), "u1").unwrap();

        let second = service.start_monitoring(config(dex), "u1");
        assert!(matches!(second, Err(BotError::SessionExists(_))));
        assert!(Arc::ptr_eq(&service.get(MINT).unwrap(), &first));

        service.stop_all("test").await;
        assert!(service.active_mints().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_ignores_stale_session() {
        let service = service();
        let dex = Arc::new(MockDex::new(1.0, 1_000_000));
        let stale = MonitoringSession::new(config(dex.clone()), service.root_token());
        let current = MonitoringSession::new(config(dex), service.root_token());
        service.register(Arc::clone(&current)).unwrap();

        assert!(!service.unregister(&stale));
        assert!(service.unregister(&current));
        assert!(service.get(MINT).is_none());
    }

    #[tokio::test]
    async fn test_terminated_session_can_be_replaced() {
        let service = service();
        let dex = Arc::new(MockDex::new(1.0, 1_000_000));
        let old = MonitoringSession::new(config(dex.clone()), service.root_token());
        service.register(Arc::clone(&old)).unwrap();
        old.stop().await;

        let fresh = MonitoringSession::new(config(dex), service.root_token());
        assert!(service.register(fresh).is_ok());
    }

    #[tokio::test]
    async fn test_stop_monitoring_announces_once() {
        let bus = Arc::new(EventBus::new());
        let mut rx = EventRecorder::attach(&bus);
        let service = Arc::new(MonitorService::new(bus, CancellationToken::new()));
        let session = service
            .start_monitoring(config(Arc::new(MockDex::new(1.2, 1_000_000))), "u1")
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        service.stop_monitoring(MINT, "position_fully_sold", "u1").await.unwrap();
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(service.stop_monitoring(MINT, "again", "u1").await.is_err());

        let events = collect_events(&mut rx, Duration::from_millis(200)).await;
        let stopped: Vec<_> = events
            .iter()
            .filter(|e| e.event_type() == EventType::MonitoringSessionStopped)
            .collect();
        assert_eq!(stopped.len(), 1);
        assert!(matches!(
            &stopped[0].payload,
            EventPayload::MonitoringSessionStopped { reason, .. } if reason == "position_fully_sold"
        ));
        assert!(events.iter().any(|e| e.event_type() == EventType::MonitoringSessionStarted));
        assert!(events.iter().any(|e| e.event_type() == EventType::PositionUpdated));

        let stopped_at = stopped[0].timestamp;
        assert!(events
            .iter()
            .filter(|e| e.event_type() == EventType::PositionUpdated)
            .all(|e| e.timestamp <= stopped_at));
    }
}
