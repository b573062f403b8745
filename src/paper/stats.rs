// =============================================================================
// Paper statistics
// =============================================================================

use super::account::PaperTrade;

/// Annualised Sharpe ratio over per-trade PnL. Needs at least two trades.
pub fn sharpe(trades: &[PaperTrade], bars_per_year: u32) -> f64 {
    if trades.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = trades.iter().map(|t| t.pnl).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std = variance.sqrt();
    if std == 0.0 {
        return 0.0;
    }
    mean / std * (bars_per_year as f64).sqrt()
}

/// Maximum peak-to-trough drawdown of the trade-by-trade equity curve, in
/// percent.
pub fn max_drawdown(trades: &[PaperTrade], initial_balance: f64) -> f64 {
    if trades.is_empty() {
        return 0.0;
    }
    let mut equity = initial_balance;
    let mut peak = initial_balance;
    let mut max_dd = 0.0f64;
    for trade in trades {
        equity += trade.pnl;
        peak = peak.max(equity);
        let dd = if peak > 0.0 { (peak - equity) / peak } else { 0.0 };
        max_dd = max_dd.max(dd);
    }
    (max_dd * 10_000.0).round() / 100.0
}

/// Gross wins over gross losses. Infinite when there are wins but no
/// losses.
pub fn profit_factor(trades: &[PaperTrade]) -> f64 {
    let wins: f64 = trades.iter().map(|t| t.pnl).filter(|&p| p > 0.0).sum();
    let losses: f64 = trades
        .iter()
        .map(|t| t.pnl)
        .filter(|&p| p < 0.0)
        .sum::<f64>()
        .abs();
    if losses == 0.0 {
        return if wins > 0.0 { f64::INFINITY } else { 0.0 };
    }
    ((wins / losses) * 100.0).round() / 100.0
}
