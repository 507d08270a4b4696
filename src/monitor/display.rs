use crate::dex::PnLResult;
use crate::models::trade::short_symbol;
use crate::monitor::session::PriceUpdate;

/// Sink for price updates while a position is monitored
pub trait PriceRenderer: Send + Sync {
    fn render(&self, mint: &str, update: &PriceUpdate, pnl: Option<&PnLResult>);
}

/// One line per update on stdout
pub struct ConsoleRenderer {
    autosell_percent: u8,
}

impl ConsoleRenderer {
    pub fn new(autosell_percent: u8) -> Self {
        Self { autosell_percent }
    }

    pub fn format_line(&self, mint: &str, update: &PriceUpdate, pnl: Option<&PnLResult>) -> String {
        let trend = if update.percent_change >= 0.0 { "📈" } else { "📉" };
        let mut line = format!(
            "{} {} {:.12} SOL ({:+.2}%) | {:.4} tokens",
            trend,
            short_symbol(mint),
            update.current_price,
            update.percent_change,
            update.tokens
        );
        if let Some(pnl) = pnl {
            line.push_str(&format!(
                " | est. {:.6} SOL | PnL {:+.6} SOL ({:+.2}%)",
                pnl.sell_estimate, pnl.net_pnl, pnl.pnl_percent
            ));
        }
        line.push_str(&format!(" | [Enter] sell {}%  [q] exit", self.autosell_percent));
        line
    }
}

impl PriceRenderer for ConsoleRenderer {
    fn render(&self, mint: &str, update: &PriceUpdate, pnl: Option<&PnLResult>) {
        println!("{}", self.format_line(mint, update, pnl));
    }
}
