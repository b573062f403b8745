// =============================================================================
// Risk guard — last line of defence before an order leaves the process
// =============================================================================
//
// First failure wins, in this order:
//   1. Drawdown     — emergency threshold checked before the soft limit.
//   2. Margin       — conservative estimate of volume × 1000 vs free margin.
//   3. Spread       — fail-open when unknown, logged for visibility.
//   4. Circuit breaker — consecutive losing real trades.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::executor::lots::{RiskSettings, SymbolConfig};
use crate::types::AccountInfo;

/// Outcome of a risk evaluation. `reason` is a machine-readable code
/// prefix (EMERGENCY, DD_LIMIT, MARGIN, SPREAD, CIRCUIT_BREAKER) followed
/// by detail.
#[derive(Debug, Clone)]
pub struct RiskCheck {
    pub passed: bool,
    pub reason: String,
}

impl RiskCheck {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
        }
    }

    fn fail(reason: String) -> Self {
        Self {
            passed: false,
            reason,
        }
    }
}

pub struct RiskGuard {
    pub dd_limit_pct: f64,
    pub dd_emergency_pct: f64,
    pub initial_balance: f64,
    pub max_consecutive_losses: u32,

    consecutive_losses: RwLock<u32>,
    /// Spread per symbol in pips, pushed by the orchestrator's refresh loop.
    spreads: RwLock<HashMap<String, f64>>,
}

impl RiskGuard {
    pub fn new(settings: &RiskSettings) -> Self {
        Self {
            dd_limit_pct: settings.dd_limit_pct,
            dd_emergency_pct: settings.dd_emergency_pct,
            initial_balance: settings.initial_balance,
            max_consecutive_losses: settings.max_consecutive_losses,
            consecutive_losses: RwLock::new(0),
            spreads: RwLock::new(HashMap::new()),
        }
    }

    pub fn update_spread(&self, symbol: &str, spread_pips: f64) {
        self.spreads.write().insert(symbol.to_string(), spread_pips);
    }

    pub fn spread(&self, symbol: &str) -> Option<f64> {
        self.spreads.read().get(symbol).copied()
    }

    pub fn consecutive_losses(&self) -> u32 {
        *self.consecutive_losses.read()
    }

    /// Run every gate; the first failure is returned.
    pub fn check_all(
        &self,
        symbol: &str,
        volume: f64,
        account: &AccountInfo,
        config: &SymbolConfig,
    ) -> RiskCheck {
        for check in [
            self.check_drawdown(account),
            self.check_margin(account, volume),
            self.check_spread(symbol, config),
            self.check_circuit_breaker(),
        ] {
            if !check.passed {
                warn!(%symbol, reason = %check.reason, "risk gate blocked order");
                return check;
            }
        }
        RiskCheck::pass()
    }

    fn check_drawdown(&self, account: &AccountInfo) -> RiskCheck {
        if self.initial_balance <= 0.0 {
            return RiskCheck::pass();
        }

        let dd_pct = (self.initial_balance - account.equity) / self.initial_balance * 100.0;

        if dd_pct >= self.dd_emergency_pct {
            return RiskCheck::fail(format!(
                "EMERGENCY: DD {:.1}% >= {}%",
                dd_pct, self.dd_emergency_pct
            ));
        }
        if dd_pct >= self.dd_limit_pct {
            return RiskCheck::fail(format!(
                "DD_LIMIT: DD {:.1}% >= {}%",
                dd_pct, self.dd_limit_pct
            ));
        }
        RiskCheck::pass()
    }

    fn check_margin(&self, account: &AccountInfo, volume: f64) -> RiskCheck {
        let estimated_margin = volume * 1000.0;
        if account.free_margin < estimated_margin {
            return RiskCheck::fail(format!(
                "MARGIN: free {:.2} < required ~{:.2}",
                account.free_margin, estimated_margin
            ));
        }
        RiskCheck::pass()
    }

    fn check_spread(&self, symbol: &str, config: &SymbolConfig) -> RiskCheck {
        let Some(current) = self.spread(symbol) else {
            // Fail-open: no spread data yet.
            debug!(%symbol, "spread unknown — allowing order");
            return RiskCheck::pass();
        };

        if current > config.max_spread_pips {
            return RiskCheck::fail(format!(
                "SPREAD: current {:.1} pips > max {:.1} pips",
                current, config.max_spread_pips
            ));
        }
        RiskCheck::pass()
    }

    fn check_circuit_breaker(&self) -> RiskCheck {
        let losses = *self.consecutive_losses.read();
        if losses >= self.max_consecutive_losses {
            return RiskCheck::fail(format!(
                "CIRCUIT_BREAKER: {} consecutive losses (max={})",
                losses, self.max_consecutive_losses
            ));
        }
        RiskCheck::pass()
    }

    /// Feed a closed real trade's PnL into the circuit breaker. Wins reset
    /// the counter.
    pub fn record_trade_result(&self, pnl: f64) {
        let mut losses = self.consecutive_losses.write();
        if pnl < 0.0 {
            *losses += 1;
        } else {
            *losses = 0;
        }
    }

    pub fn reset_circuit_breaker(&self) {
        *self.consecutive_losses.write() = 0;
    }
}

impl std::fmt::Debug for RiskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGuard")
            .field("dd_limit_pct", &self.dd_limit_pct)
            .field("dd_emergency_pct", &self.dd_emergency_pct)
            .field("initial_balance", &self.initial_balance)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("consecutive_losses", &self.consecutive_losses())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> RiskGuard {
        RiskGuard::new(&RiskSettings {
            dd_limit_pct: 5.0,
            dd_emergency_pct: 10.0,
            initial_balance: 10_000.0,
            max_consecutive_losses: 3,
        })
    }

    fn account(equity: f64) -> AccountInfo {
        AccountInfo {
            balance: equity,
            equity,
            margin: 0.0,
            free_margin: equity,
            margin_level: 0.0,
            currency: "USD".into(),
        }
    }

    #[test]
    fn healthy_account_passes() {
        let g = guard();
        let check = g.check_all("EURUSD", 0.01, &account(10_000.0), &SymbolConfig::default());
        assert!(check.passed);
    }

    #[test]
    fn six_percent_drawdown_hits_soft_limit() {
        let g = guard();
        let check = g.check_all("EURUSD", 0.01, &account(9_400.0), &SymbolConfig::default());
        assert!(!check.passed);
        assert!(check.reason.starts_with("DD_LIMIT"), "{}", check.reason);
    }

    #[test]
    fn eleven_percent_drawdown_is_emergency_not_limit() {
        let g = guard();
        let check = g.check_all("EURUSD", 0.01, &account(8_900.0), &SymbolConfig::default());
        assert!(!check.passed);
        assert!(check.reason.starts_with("EMERGENCY"), "{}", check.reason);
    }

    #[test]
    fn margin_estimate_blocks_oversized_volume() {
        let g = guard();
        // 50 lots → 50 000 estimated margin vs 10 000 free.
        let check = g.check_all("EURUSD", 50.0, &account(10_000.0), &SymbolConfig::default());
        assert!(!check.passed);
        assert!(check.reason.starts_with("MARGIN"), "{}", check.reason);
    }

    #[test]
    fn unknown_spread_fails_open() {
        let g = guard();
        let check = g.check_all("EURUSD", 0.01, &account(10_000.0), &SymbolConfig::default());
        assert!(check.passed);
    }

    #[test]
    fn wide_spread_blocks() {
        let g = guard();
        g.update_spread("EURUSD", 5.0);
        let config = SymbolConfig {
            max_spread_pips: 2.0,
            ..Default::default()
        };
        let check = g.check_all("EURUSD", 0.01, &account(10_000.0), &config);
        assert!(!check.passed);
        assert!(check.reason.starts_with("SPREAD"), "{}", check.reason);
    }

    #[test]
    fn circuit_breaker_trips_after_three_losses_and_resets_on_win() {
        let g = guard();
        g.record_trade_result(-10.0);
        g.record_trade_result(-5.0);
        assert!(g
            .check_all("EURUSD", 0.01, &account(10_000.0), &SymbolConfig::default())
            .passed);

        g.record_trade_result(-1.0);
        let check = g.check_all("EURUSD", 0.01, &account(10_000.0), &SymbolConfig::default());
        assert!(!check.passed);
        assert!(
            check.reason.starts_with("CIRCUIT_BREAKER"),
            "{}",
            check.reason
        );

        g.record_trade_result(2.0);
        assert_eq!(g.consecutive_losses(), 0);
        assert!(g
            .check_all("EURUSD", 0.01, &account(10_000.0), &SymbolConfig::default())
            .passed);
    }

    #[test]
    fn drawdown_outranks_circuit_breaker() {
        let g = guard();
        for _ in 0..5 {
            g.record_trade_result(-1.0);
        }
        let check = g.check_all("EURUSD", 0.01, &account(8_000.0), &SymbolConfig::default());
        assert!(check.reason.starts_with("EMERGENCY"), "{}", check.reason);
    }

    #[test]
    fn zero_initial_balance_disables_drawdown_gate() {
        let g = RiskGuard::new(&RiskSettings {
            initial_balance: 0.0,
            ..Default::default()
        });
        let check = g.check_all("EURUSD", 0.01, &account(1.0), &SymbolConfig::default());
        assert!(check.passed);
    }
}
