// =============================================================================
// Paper shadow — replays live signals under training-equivalent costs
// =============================================================================
//
// A secondary set of books that fills every signal at the training cost
// model, never sending an order. Comparing its ledger with real fills
// measures how far live execution has drifted from the assumptions the
// model was trained under. It must never influence the real path.
// =============================================================================

pub mod account;
pub mod stats;

use std::collections::HashMap;

use tracing::info;

use crate::predictor::model::TrainingConfig;
use crate::types::{Bar, Signal};
use account::{PaperAccount, PaperTrade};

pub struct PaperTrader {
    initial_balance: f64,
    accounts: HashMap<String, PaperAccount>,
}

impl PaperTrader {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            initial_balance,
            accounts: HashMap::new(),
        }
    }

    /// Register a symbol with its model's training parameters. Called right
    /// after the model loads.
    pub fn load_config(&mut self, symbol: &str, config: &TrainingConfig) {
        self.accounts.insert(
            symbol.to_string(),
            PaperAccount::new(self.initial_balance, config),
        );
        info!(
            %symbol,
            spread_points = config.spread_points,
            lots = ?config.lot_sizes,
            "paper account configured"
        );
    }

    pub fn unload(&mut self, symbol: &str) {
        self.accounts.remove(symbol);
    }

    /// Mirror one signal into the shadow books. Returns the closed trade
    /// when the signal caused a close.
    pub fn process_signal(&mut self, signal: &Signal, bar: &Bar) -> Option<PaperTrade> {
        let account = self.accounts.get_mut(&signal.symbol)?;

        let price = bar.close;
        let timestamp = bar.time as f64;
        let target_dir = signal.direction;
        let target_intensity = signal.intensity;

        let current = account.positions.get(&signal.symbol);
        let current_dir = current.map(|p| p.direction).unwrap_or(0);

        if current_dir == target_dir {
            // Same direction: an intensity change still closes and reopens,
            // exactly like the training environment.
            let intensity_changed = current
                .map(|p| p.intensity != target_intensity)
                .unwrap_or(false);
            if intensity_changed && target_dir != 0 {
                let trade =
                    account.close_position(&signal.symbol, price, timestamp, signal.regime_state);
                account.open_position(
                    &signal.symbol,
                    target_dir,
                    target_intensity,
                    price,
                    timestamp,
                );
                return trade;
            }
            return None;
        }

        let mut trade = None;
        if current_dir != 0 {
            trade = account.close_position(&signal.symbol, price, timestamp, signal.regime_state);
        }
        if target_dir != 0 && target_intensity > 0 {
            account.open_position(&signal.symbol, target_dir, target_intensity, price, timestamp);
        }
        trade
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    /// Lightweight metrics, safe to compute every heartbeat.
    pub fn get_metrics(&self) -> serde_json::Value {
        let all_trades = self.get_trades(None);
        let total_balance: f64 = self.accounts.values().map(|a| a.balance).sum();
        let total_commission: f64 = self.accounts.values().map(|a| a.total_commission).sum();

        if all_trades.is_empty() {
            return serde_json::json!({
                "total_trades": 0,
                "total_pnl": 0.0,
                "win_rate": 0.0,
                "avg_balance": self.initial_balance,
                "total_commission": 0.0,
            });
        }

        let wins = all_trades.iter().filter(|t| t.pnl > 0.0).count();
        let total_pnl: f64 = all_trades.iter().map(|t| t.pnl).sum();

        serde_json::json!({
            "total_trades": all_trades.len(),
            "total_pnl": round2(total_pnl),
            "win_rate": round1(wins as f64 / all_trades.len() as f64 * 100.0),
            "avg_balance": round2(total_balance / self.accounts.len().max(1) as f64),
            "total_commission": round2(total_commission),
        })
    }

    /// Heavy analytics: drawdown, Sharpe, profit factor, expectancy,
    /// average win/loss, downsampled equity curve (≤ 50 points).
    pub fn get_analytics(&self, bars_per_year: u32) -> serde_json::Value {
        let trades = self.get_trades(None);
        if trades.is_empty() {
            return serde_json::json!({});
        }

        let wins: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|&p| p > 0.0).collect();
        let losses: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|&p| p < 0.0).collect();
        let total: f64 = trades.iter().map(|t| t.pnl).sum();

        let mut equity_curve = Vec::new();
        let mut equity = self.initial_balance;
        let step = (trades.len() / 50).max(1);
        for (i, trade) in trades.iter().enumerate() {
            equity += trade.pnl;
            if i % step == 0 || i == trades.len() - 1 {
                equity_curve.push(serde_json::json!({
                    "trade": i + 1,
                    "equity": round2(equity),
                    "pnl": round2(trade.pnl),
                }));
            }
        }

        serde_json::json!({
            "max_drawdown": -stats::max_drawdown(&trades, self.initial_balance),
            "profit_factor": finite_or_zero(stats::profit_factor(&trades)),
            "sharpe_ratio": round2(stats::sharpe(&trades, bars_per_year)),
            "expectancy": round2(total / trades.len() as f64),
            "avg_win": if wins.is_empty() {
                0.0
            } else {
                round2(wins.iter().sum::<f64>() / wins.len() as f64)
            },
            "avg_loss": if losses.is_empty() {
                0.0
            } else {
                round2(losses.iter().sum::<f64>() / losses.len() as f64)
            },
            "equity_curve": equity_curve,
        })
    }

    /// Closed trades, globally or for one symbol, ordered by exit time.
    pub fn get_trades(&self, symbol: Option<&str>) -> Vec<PaperTrade> {
        let mut trades: Vec<PaperTrade> = match symbol {
            Some(s) => self
                .accounts
                .get(s)
                .map(|a| a.closed_trades.clone())
                .unwrap_or_default(),
            None => self
                .accounts
                .values()
                .flat_map(|a| a.closed_trades.clone())
                .collect(),
        };
        trades.sort_by(|a, b| a.exit_time.total_cmp(&b.exit_time));
        trades
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    fn signal(direction: i32, intensity: u8, regime_state: usize) -> Signal {
        let action = match (direction, intensity) {
            (0, _) => Action::Wait,
            (1, 1) => Action::LongWeak,
            (1, 3) => Action::LongStrong,
            (1, _) => Action::LongModerate,
            _ => Action::ShortWeak,
        };
        Signal {
            symbol: "EURUSD".into(),
            action,
            direction,
            intensity,
            regime_state,
            virtual_pnl: 0.0,
            timestamp: 0.0,
        }
    }

    fn bar(time: i64, close: f64) -> Bar {
        Bar {
            symbol: "EURUSD".into(),
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
        }
    }

    fn trader() -> PaperTrader {
        let mut trader = PaperTrader::new(10_000.0);
        trader.load_config("EURUSD", &TrainingConfig::default());
        trader
    }

    #[test]
    fn unknown_symbol_is_ignored() {
        let mut t = PaperTrader::new(10_000.0);
        assert!(t.process_signal(&signal(1, 1, 0), &bar(0, 1.1)).is_none());
    }

    #[test]
    fn open_then_wait_produces_one_trade() {
        let mut t = trader();
        assert!(t.process_signal(&signal(1, 1, 0), &bar(0, 1.10000)).is_none());
        let trade = t.process_signal(&signal(0, 0, 1), &bar(900, 1.10100)).unwrap();

        assert_eq!(trade.direction, 1);
        assert!((trade.pnl - 0.855).abs() < 1e-9, "training arithmetic");
        assert_eq!(trade.regime_state, 1);
        assert_eq!(t.get_trades(None).len(), 1);
    }

    #[test]
    fn repeated_same_signal_is_noop() {
        let mut t = trader();
        t.process_signal(&signal(1, 1, 0), &bar(0, 1.1));
        assert!(t.process_signal(&signal(1, 1, 0), &bar(900, 1.1)).is_none());
        assert!(t.get_trades(None).is_empty());
    }

    #[test]
    fn intensity_change_closes_and_reopens() {
        let mut t = trader();
        t.process_signal(&signal(1, 1, 0), &bar(0, 1.1));
        let trade = t.process_signal(&signal(1, 3, 0), &bar(900, 1.101));
        assert!(trade.is_some());

        // A new strong position is open.
        let account = t.accounts.get("EURUSD").unwrap();
        let position = account.positions.get("EURUSD").unwrap();
        assert_eq!(position.intensity, 3);
    }

    #[test]
    fn reversal_closes_then_opens_short() {
        let mut t = trader();
        t.process_signal(&signal(1, 1, 0), &bar(0, 1.1));
        let trade = t.process_signal(&signal(-1, 1, 0), &bar(900, 1.099));
        assert!(trade.is_some());

        let account = t.accounts.get("EURUSD").unwrap();
        assert_eq!(account.positions["EURUSD"].direction, -1);
    }

    #[test]
    fn metrics_aggregate_across_trades() {
        let mut t = trader();
        t.process_signal(&signal(1, 1, 0), &bar(0, 1.10000));
        t.process_signal(&signal(0, 0, 0), &bar(900, 1.10200));
        t.process_signal(&signal(1, 1, 0), &bar(1800, 1.10200));
        t.process_signal(&signal(0, 0, 0), &bar(2700, 1.10100));

        let metrics = t.get_metrics();
        assert_eq!(metrics["total_trades"], 2);
        assert!(metrics["win_rate"].as_f64().unwrap() > 0.0);

        let analytics = t.get_analytics(20_160);
        assert!(analytics["profit_factor"].as_f64().is_some());
        assert!(analytics["equity_curve"].as_array().unwrap().len() >= 2);
        assert!(analytics["expectancy"].as_f64().is_some());
    }

    #[test]
    fn empty_metrics_have_defaults() {
        let t = trader();
        let metrics = t.get_metrics();
        assert_eq!(metrics["total_trades"], 0);
        assert_eq!(metrics["avg_balance"], 10_000.0);
        assert_eq!(t.get_analytics(20_160), serde_json::json!({}));
    }
}
