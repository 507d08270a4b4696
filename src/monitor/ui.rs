//! Operator input: Enter sells, `q` or `exit` leaves without selling.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BotError, BotResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    SellRequested,
    ExitRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputLine {
    Line(String),
    Eof,
}

static STDIN_CLOSED: AtomicBool = AtomicBool::new(false);

/// Lines read from stdin by a single reader thread, fanned out to every
/// handler that subscribes.
static STDIN_LINES: Lazy<broadcast::Sender<InputLine>> = Lazy::new(|| {
    let (tx, _) = broadcast::channel(64);
    let reader = tx.clone();
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        let _ = reader.send(InputLine::Line(line));
                    }
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                }
            }
            STDIN_CLOSED.store(true, Ordering::SeqCst);
            let _ = reader.send(InputLine::Eof);
        });
    if let Err(e) = spawned {
        warn!("cannot start stdin reader: {}", e);
        STDIN_CLOSED.store(true, Ordering::SeqCst);
    }
    tx
});

/// Map one input line to an event; `None` for anything unrecognised
pub fn classify(line: &str) -> Option<UiEvent> {
    let line = line.trim();
    if line.is_empty() {
        Some(UiEvent::SellRequested)
    } else if line.eq_ignore_ascii_case("q") || line.eq_ignore_ascii_case("exit") {
        Some(UiEvent::ExitRequested)
    } else {
        None
    }
}

pub struct UiInputHandler {
    input: Mutex<Option<broadcast::Receiver<InputLine>>>,
    input_closed: bool,
    events_tx: Mutex<Option<mpsc::Sender<UiEvent>>>,
    events_rx: Mutex<Option<mpsc::Receiver<UiEvent>>>,
    cancel: CancellationToken,
}

impl UiInputHandler {
    pub fn new(input: broadcast::Receiver<InputLine>, parent: &CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(4);
        Self {
            input: Mutex::new(Some(input)),
            input_closed: false,
            events_tx: Mutex::new(Some(tx)),
            events_rx: Mutex::new(Some(rx)),
            cancel: parent.child_token(),
        }
    }

    pub fn from_stdin(parent: &CancellationToken) -> Self {
        let mut handler = Self::new(STDIN_LINES.subscribe(), parent);
        handler.input_closed = STDIN_CLOSED.load(Ordering::SeqCst);
        handler
    }

    /// Receiver of classified events; closed once the handler stops
    pub fn take_events(&self) -> Option<mpsc::Receiver<UiEvent>> {
        self.events_rx.lock().take()
    }

    pub fn start(&self) -> BotResult<()> {
        let input = self.input.lock().take();
        let events = self.events_tx.lock().take();
        let (Some(mut input), Some(events)) = (input, events) else {
            return Err(BotError::AlreadyStarted);
        };

        let cancel = self.cancel.clone();
        let input_closed = self.input_closed;
        tokio::spawn(async move {
            if input_closed {
                let _ = events.send(UiEvent::ExitRequested).await;
                return;
            }

            loop {
                let line = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    line = input.recv() => line,
                };

                let event = match line {
                    Ok(InputLine::Line(line)) => match classify(&line) {
                        Some(event) => event,
                        None => {
                            warn!("unrecognised input '{}': press Enter to sell or type q to exit", line.trim());
                            continue;
                        }
                    },
                    Ok(InputLine::Eof) | Err(broadcast::error::RecvError::Closed) => {
                        debug!("input closed");
                        UiEvent::ExitRequested
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("input handler skipped {} line(s)", skipped);
                        continue;
                    }
                };

                let delivered = tokio::select! {
                    _ = cancel.cancelled() => false,
                    sent = events.send(event) => sent.is_ok(),
                };
                if !delivered || event == UiEvent::ExitRequested {
                    break;
                }
            }
        });
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
        // unstarted handlers still close their event channel
        self.events_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> (broadcast::Sender<InputLine>, UiInputHandler) {
        let (tx, rx) = broadcast::channel(8);
        (tx, UiInputHandler::new(rx, &CancellationToken::new()))
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(""), Some(UiEvent::SellRequested));
        assert_eq!(classify("  \r"), Some(UiEvent::SellRequested));
        assert_eq!(classify("q"), Some(UiEvent::ExitRequested));
        assert_eq!(classify("EXIT"), Some(UiEvent::ExitRequested));
        assert_eq!(classify("sell"), None);
    }

    #[tokio::test]
    async fn test_lines_become_events() {
        let (tx, ui) = handler();
        let mut events = ui.take_events().unwrap();
        ui.start().unwrap();

        tx.send(InputLine::Line("hello".into())).unwrap();
        tx.send(InputLine::Line(String::new())).unwrap();
        tx.send(InputLine::Line("q".into())).unwrap();

        assert_eq!(events.recv().await, Some(UiEvent::SellRequested));
        assert_eq!(events.recv().await, Some(UiEvent::ExitRequested));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_eof_requests_exit() {
        let (tx, ui) = handler();
        let mut events = ui.take_events().unwrap();
        ui.start().unwrap();

        tx.send(InputLine::Eof).unwrap();
        assert_eq!(events.recv().await, Some(UiEvent::ExitRequested));
    }

    #[tokio::test]
    async fn test_closed_input_requests_exit() {
        let (tx, ui) = handler();
        let mut events = ui.take_events().unwrap();
        ui.start().unwrap();

        drop(tx);
        assert_eq!(events.recv().await, Some(UiEvent::ExitRequested));
    }

    #[tokio::test]
    async fn test_stop_closes_events_without_emitting() {
        let (_tx, ui) = handler();
        let mut events = ui.take_events().unwrap();
        ui.start().unwrap();

        ui.stop();
        assert_eq!(events.recv().await, None);
        assert!(matches!(ui.start(), Err(BotError::AlreadyStarted)));
    }
}
