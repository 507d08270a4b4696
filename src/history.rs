//! # Trade History
//!
//! Audit trail of every buy and sell: a bounded in-memory ring for queries
//! and statistics, and an append-only CSV file per UTC day on disk. Rows are
//! buffered and pushed to the OS in batches; `flush` and `close` also fsync.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BotError, BotResult};
use crate::models::trade::CSV_HEADER;
use crate::models::{Trade, TradeAction};
use crate::shutdown::Closer;

pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const WRITE_BATCH: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TradeStatistics {
    pub total_trades: usize,
    pub successful_trades: usize,
    pub failed_trades: usize,
    /// Percent of trades that succeeded
    pub success_rate: f64,
    pub total_pnl: Decimal,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent of trades with PnL that were winners
    pub win_rate: f64,
    pub average_pnl_percent: f64,
    pub total_volume_sol: f64,
    pub buys: usize,
    pub sells: usize,
}

struct DayFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

struct Inner {
    trades: VecDeque<Trade>,
    capacity: usize,
    file: Option<DayFile>,
    unwritten: usize,
    closed: bool,
}

pub struct TradeHistory {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl TradeHistory {
    pub fn new(dir: impl Into<PathBuf>) -> BotResult<Self> {
        Self::with_capacity(dir, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(dir: impl Into<PathBuf>, capacity: usize) -> BotResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        info!("📒 trade history in {}", dir.display());

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                trades: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                capacity: capacity.max(1),
                file: None,
                unwritten: 0,
                closed: false,
            }),
        })
    }

    pub fn file_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("trades_{}.csv", date.format("%Y-%m-%d")))
    }

    fn open_day(path: &Path, date: NaiveDate) -> BotResult<DayFile> {
        let needs_header = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if needs_header {
            writeln!(writer, "{}", CSV_HEADER)?;
        }
        Ok(DayFile { date, writer })
    }

    /// Record a trade in memory and append it to the day's CSV
    pub fn log_trade(&self, trade: Trade) -> BotResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(BotError::Internal("trade history is closed".to_string()));
        }

        let row = trade.to_csv_row();
        let date = trade.timestamp.date_naive();
        debug!("recording {} {} ({})", trade.action, trade.token_mint, trade.id);

        if inner.file.as_ref().map(|f| f.date) != Some(date) {
            if let Some(mut previous) = inner.file.take() {
                previous.writer.flush()?;
                previous.writer.get_ref().sync_all()?;
            }
            inner.file = Some(Self::open_day(&self.file_path(date), date)?);
        }

        let inner = &mut *inner;
        if let Some(file) = inner.file.as_mut() {
            writeln!(file.writer, "{}", row)?;
            inner.unwritten += 1;
            if inner.unwritten >= WRITE_BATCH {
                file.writer.flush()?;
                inner.unwritten = 0;
            }
        }

        // only rows that reached the writer are queryable
        inner.trades.push_back(trade);
        while inner.trades.len() > inner.capacity {
            inner.trades.pop_front();
        }
        Ok(())
    }

    /// Push buffered rows to disk and fsync
    pub fn flush(&self) -> BotResult<()> {
        let mut inner = self.inner.lock();
        Self::flush_locked(&mut inner)
    }

    fn flush_locked(inner: &mut Inner) -> BotResult<()> {
        if let Some(file) = inner.file.as_mut() {
            file.writer.flush()?;
            file.writer.get_ref().sync_all()?;
        }
        inner.unwritten = 0;
        Ok(())
    }

    /// Last `n` trades, oldest first
    pub fn get_recent_trades(&self, n: usize) -> Vec<Trade> {
        let inner = self.inner.lock();
        let skip = inner.trades.len().saturating_sub(n);
        inner.trades.iter().skip(skip).cloned().collect()
    }

    pub fn get_trades_by_token(&self, mint: &str) -> Vec<Trade> {
        self.inner
            .lock()
            .trades
            .iter()
            .filter(|t| t.token_mint == mint)
            .cloned()
            .collect()
    }

    pub fn get_trade_by_id(&self, id: &str) -> Option<Trade> {
        self.inner.lock().trades.iter().find(|t| t.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregates over the trades still held in memory
    pub fn get_statistics(&self) -> TradeStatistics {
        let inner = self.inner.lock();
        let mut stats = TradeStatistics::default();
        let mut pnl_percent_sum = 0.0;
        let mut pnl_percent_count = 0usize;

        for trade in &inner.trades {
            stats.total_trades += 1;
            match trade.action {
                TradeAction::Buy => stats.buys += 1,
                TradeAction::Sell => stats.sells += 1,
            }
            if !trade.success {
                stats.failed_trades += 1;
                continue;
            }
            stats.successful_trades += 1;
            stats.total_volume_sol += trade.amount_sol;

            if let Some(pnl) = trade.pnl {
                stats.total_pnl += Decimal::from_f64(pnl).unwrap_or_default();
                if pnl > 0.0 {
                    stats.winning_trades += 1;
                } else {
                    stats.losing_trades += 1;
                }
            }
            if let Some(pct) = trade.pnl_percent {
                pnl_percent_sum += pct;
                pnl_percent_count += 1;
            }
        }

        stats.total_pnl = stats.total_pnl.round_dp(9);
        if stats.total_trades > 0 {
            stats.success_rate = stats.successful_trades as f64 / stats.total_trades as f64 * 100.0;
        }
        let decided = stats.winning_trades + stats.losing_trades;
        if decided > 0 {
            stats.win_rate = stats.winning_trades as f64 / decided as f64 * 100.0;
        }
        if pnl_percent_count > 0 {
            stats.average_pnl_percent = pnl_percent_sum / pnl_percent_count as f64;
        }
        stats
    }

    /// Flush, fsync and stop accepting trades. Idempotent.
    pub fn close(&self) -> BotResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        let result = Self::flush_locked(&mut inner);
        inner.file = None;
        info!("📒 trade history closed ({} trades in memory)", inner.trades.len());
        result
    }

    /// Periodically flush until `cancel` fires
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken, interval: Duration) -> JoinHandle<()> {
        let history = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = history.flush() {
                            warn!("trade history flush failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Closer for TradeHistory {
    async fn close(&self) -> BotResult<()> {
        TradeHistory::close(self)
    }
}
