//! # Monitor Worker
//!
//! Runs one position from "bought" to "sold or abandoned": a monitoring
//! session, the operator input handler and the sell function, as three
//! children of one cancellation scope. The first child to fail cancels the
//! scope, and the worker returns only after every child has finished.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dex::retry::with_deadline;
use crate::dex::Dex;
use crate::error::{BotError, BotResult};
use crate::monitor::display::PriceRenderer;
use crate::monitor::service::MonitorService;
use crate::monitor::session::{MonitoringSession, PriceUpdate, SessionConfig};
use crate::monitor::ui::{InputLine, UiEvent, UiInputHandler};

/// Budget for a sell once the operator asked for it
pub const SELL_BUDGET: Duration = Duration::from_secs(60);

/// Sells the given percentage of the position and returns the signature
pub type SellFn = Arc<dyn Fn(f64) -> BoxFuture<'static, BotResult<String>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Sold(String),
    Exited,
    /// The session was stopped elsewhere, e.g. by a sell command
    Stopped,
    /// Stopped from outside before the operator decided
    Cancelled,
}

impl WorkerOutcome {
    fn stop_reason(&self) -> &'static str {
        match self {
            WorkerOutcome::Sold(_) => "position_sold",
            WorkerOutcome::Exited => "operator_exit",
            WorkerOutcome::Stopped => "session_stopped",
            WorkerOutcome::Cancelled => "shutdown",
        }
    }
}

type ChildResult = BotResult<Option<WorkerOutcome>>;

pub struct MonitorWorker {
    config: SessionConfig,
    sell: SellFn,
    monitor_service: Arc<MonitorService>,
    renderer: Arc<dyn PriceRenderer>,
    input: Option<broadcast::Receiver<InputLine>>,
    user_id: String,
}

impl MonitorWorker {
    pub fn new(
        config: SessionConfig,
        sell: SellFn,
        monitor_service: Arc<MonitorService>,
        renderer: Arc<dyn PriceRenderer>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            sell,
            monitor_service,
            renderer,
            input: None,
            user_id: user_id.into(),
        }
    }

    /// Read operator input from `input` instead of stdin
    pub fn with_input(mut self, input: broadcast::Receiver<InputLine>) -> Self {
        self.input = Some(input);
        self
    }

    pub async fn run(self, parent: &CancellationToken) -> BotResult<WorkerOutcome> {
        let scope = parent.child_token();
        let mint = self.config.task.token_mint.clone();
        let autosell = self.config.task.autosell_percent as f64;
        let investment = self.config.task.amount_sol;
        let dex = Arc::clone(&self.config.dex);

        let session = MonitoringSession::new(self.config, &scope);
        self.monitor_service.attach(Arc::clone(&session), &self.user_id)?;
        if let Err(e) = session.start() {
            self.monitor_service.detach(&session, "start_failed", &self.user_id);
            return Err(e);
        }

        let ui = Arc::new(match self.input {
            Some(input) => UiInputHandler::new(input, &scope),
            None => UiInputHandler::from_stdin(&scope),
        });

        let (Some(ui_events), Some(prices), Some(errors)) =
            (ui.take_events(), session.take_price_updates(), session.take_errors())
        else {
            session.stop().await;
            self.monitor_service.detach(&session, "start_failed", &self.user_id);
            return Err(BotError::Internal("monitor channels already taken".to_string()));
        };
        if let Err(e) = ui.start() {
            session.stop().await;
            self.monitor_service.detach(&session, "start_failed", &self.user_id);
            return Err(e);
        }

        info!("👀 monitoring {}: press Enter to sell {}%, q to exit", mint, autosell);

        let mut children: JoinSet<ChildResult> = JoinSet::new();
        children.spawn(route_ui(ui_events, Arc::clone(&session), Arc::clone(&ui), self.sell, autosell, scope.clone()));
        children.spawn(consume_prices(prices, dex, self.renderer, mint.clone(), investment));
        children.spawn(consume_errors(errors, mint.clone()));

        let mut outcome = None;
        let mut first_error = None;
        while let Some(joined) = children.join_next().await {
            match joined {
                Ok(Ok(Some(result))) => {
                    outcome = Some(result);
                    scope.cancel();
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    scope.cancel();
                }
                Err(e) => {
                    error!("monitor child for {} aborted: {}", mint, e);
                    if first_error.is_none() {
                        first_error = Some(BotError::Internal(format!("monitor child aborted: {}", e)));
                    }
                    scope.cancel();
                }
            }
        }

        session.stop().await;
        ui.stop();

        match first_error {
            Some(e) => {
                self.monitor_service.detach(&session, "monitoring_failed", &self.user_id);
                Err(e)
            }
            None => {
                let outcome = outcome.unwrap_or(WorkerOutcome::Cancelled);
                self.monitor_service.detach(&session, outcome.stop_reason(), &self.user_id);
                Ok(outcome)
            }
        }
    }
}

/// Turns operator events into a sell or an exit. The session and the input
/// handler are stopped before the sell starts, and the sell runs on its own
/// budget so that cancelling the scope cannot abandon it halfway. A session
/// that terminates while the scope is live ends the worker, so a position
/// sold elsewhere is never sold again from here.
async fn route_ui(
    mut events: mpsc::Receiver<UiEvent>,
    session: Arc<MonitoringSession>,
    ui: Arc<UiInputHandler>,
    sell: SellFn,
    autosell: f64,
    scope: CancellationToken,
) -> ChildResult {
    let event = tokio::select! {
        event = events.recv() => event,
        _ = session.terminated() => {
            ui.stop();
            if scope.is_cancelled() {
                return Ok(None);
            }
            info!("monitoring of {} ended, no longer taking input", session.mint());
            return Ok(Some(WorkerOutcome::Stopped));
        }
    };
    let Some(event) = event else {
        return Ok(None);
    };

    session.stop().await;
    ui.stop();

    match event {
        UiEvent::SellRequested => {
            info!("💸 selling {}% of {}", autosell, session.mint());
            let signature = with_deadline("sell", SELL_BUDGET, sell(autosell)).await?;
            Ok(Some(WorkerOutcome::Sold(signature)))
        }
        UiEvent::ExitRequested => {
            info!("leaving {} without selling", session.mint());
            Ok(Some(WorkerOutcome::Exited))
        }
    }
}

async fn consume_prices(
    mut prices: mpsc::Receiver<PriceUpdate>,
    dex: Arc<dyn Dex>,
    renderer: Arc<dyn PriceRenderer>,
    mint: String,
    investment: f64,
) -> ChildResult {
    while let Some(update) = prices.recv().await {
        let pnl = match update.pnl {
            Some(pnl) => Some(pnl),
            None => dex.calculate_pnl(&mint, update.tokens, investment).await.ok(),
        };
        renderer.render(&mint, &update, pnl.as_ref());
    }
    Ok(None)
}

/// Transient read failures are only reported; anything else ends the worker
async fn consume_errors(mut errors: mpsc::Receiver<BotError>, mint: String) -> ChildResult {
    while let Some(e) = errors.recv().await {
        if e.is_transient() {
            warn!("price read for {} failed: {}", mint, e);
            continue;
        }
        error!("monitoring {} failed: {}", mint, e);
        return Err(e);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::dex::mock::MockDex;
    use crate::dex::PnLResult;
    use crate::models::task::sample_task;
    use crate::models::{Operation, PriorityFee};
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    const MINT: &str = "So11111111111111111111111111111111111111112";

    #[derive(Default)]
    struct CountingRenderer {
        renders: AtomicU32,
        last: Mutex<Option<PriceUpdate>>,
    }

    impl PriceRenderer for CountingRenderer {
        fn render(&self, _mint: &str, update: &PriceUpdate, _pnl: Option<&PnLResult>) {
            self.renders.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(*update);
        }
    }

    struct Harness {
        dex: Arc<MockDex>,
        service: Arc<MonitorService>,
        renderer: Arc<CountingRenderer>,
        input: broadcast::Sender<InputLine>,
        root: CancellationToken,
    }

    impl Harness {
        fn new(dex: MockDex) -> Self {
            let root = CancellationToken::new();
            Self {
                dex: Arc::new(dex),
                service: Arc::new(MonitorService::new(Arc::new(EventBus::new()), root.clone())),
                renderer: Arc::new(CountingRenderer::default()),
                input: broadcast::channel(8).0,
                root,
            }
        }

        fn worker(&self, initial_price: f64) -> MonitorWorker {
            let task = Arc::new(sample_task(1, Operation::Snipe, MINT));
            let config = SessionConfig::new(task, self.dex.clone())
                .with_initial_price(initial_price)
                .with_token_balance(1_000_000)
                .with_polling_interval(Duration::from_millis(100));

            let dex = Arc::clone(&self.dex);
            let sell: SellFn = Arc::new(move |percent| {
                let dex = Arc::clone(&dex);
                async move { dex.sell_percent_tokens(MINT, percent, 1.0, PriorityFee::Default, 0).await }.boxed()
            });

            MonitorWorker::new(config, sell, self.service.clone(), self.renderer.clone(), "u1")
                .with_input(self.input.subscribe())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_sells_autosell_percent() {
        let h = Harness::new(MockDex::new(1.2, 1_000_000));
        let worker = h.worker(1.0);
        let input = h.input.clone();
        let service = h.service.clone();

        let run = tokio::spawn({
            let root = h.root.clone();
            async move { worker.run(&root).await }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(service.get(MINT).is_some());
        input.send(InputLine::Line(String::new())).unwrap();

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, WorkerOutcome::Sold(format!("sig-sell-{}", MINT)));
        assert_eq!(h.dex.last_sell_percent(), Some(99.0));
        assert_eq!(h.dex.sell_calls.load(Ordering::SeqCst), 1);
        assert!(h.renderer.renders.load(Ordering::SeqCst) >= 1);
        assert!(service.get(MINT).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_leaves_without_selling() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000));
        let worker = h.worker(1.0);
        let input = h.input.clone();

        let run = tokio::spawn({
            let root = h.root.clone();
            async move { worker.run(&root).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        input.send(InputLine::Line("q".into())).unwrap();

        assert_eq!(run.await.unwrap().unwrap(), WorkerOutcome::Exited);
        assert_eq!(h.dex.sell_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_completes_in_flight_sell() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000).with_sell_delay(Duration::from_secs(5)));
        let worker = h.worker(1.0);
        let input = h.input.clone();

        let run = tokio::spawn({
            let root = h.root.clone();
            async move { worker.run(&root).await }
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        input.send(InputLine::Line(String::new())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let renders_before = h.renderer.renders.load(Ordering::SeqCst);
        h.root.cancel();

        let outcome = run.await.unwrap().unwrap();
        assert!(matches!(outcome, WorkerOutcome::Sold(_)));
        assert_eq!(h.dex.sells_completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.renderer.renders.load(Ordering::SeqCst), renders_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_exceeding_budget_fails_worker() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000).with_sell_delay(Duration::from_secs(120)));
        let worker = h.worker(1.0);
        let input = h.input.clone();

        let run = tokio::spawn({
            let root = h.root.clone();
            async move { worker.run(&root).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        input.send(InputLine::Line(String::new())).unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, BotError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_session_error_fails_worker() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000).with_prices(vec![None]));
        let worker = h.worker(0.0);

        let err = worker.run(&h.root.clone()).await.unwrap_err();
        assert!(matches!(err, BotError::Protocol(_)));
        assert!(h.service.get(MINT).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_root_cancel_without_input_is_cancelled_outcome() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000));
        let worker = h.worker(1.0);

        let run = tokio::spawn({
            let root = h.root.clone();
            async move { worker.run(&root).await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        h.root.cancel();

        assert_eq!(run.await.unwrap().unwrap(), WorkerOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stopped_elsewhere_ends_worker() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000));
        let worker = h.worker(1.0);
        let input = h.input.clone();
        let service = h.service.clone();

        let run = tokio::spawn({
            let root = h.root.clone();
            async move { worker.run(&root).await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        service.stop_monitoring(MINT, "position_fully_sold", "u1").await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), run).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, WorkerOutcome::Stopped);

        let _ = input.send(InputLine::Line(String::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.dex.sell_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_worker_for_same_mint_rejected() {
        let h = Harness::new(MockDex::new(1.0, 1_000_000));
        let first = MonitoringSession::new(
            SessionConfig::new(Arc::new(sample_task(9, Operation::Snipe, MINT)), h.dex.clone()),
            &h.root,
        );
        h.service.register(first).unwrap();

        let err = h.worker(1.0).run(&h.root.clone()).await.unwrap_err();
        assert!(matches!(err, BotError::SessionExists(_)));
    }
}
