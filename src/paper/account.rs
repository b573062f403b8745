// =============================================================================
// Paper account — simulated fills under the training cost model
// =============================================================================
//
// Spread, slippage and commission are the frozen training parameters; fills
// are instant and never rejected. The arithmetic mirrors the virtual twin
// so realized paper PnL is directly comparable with what the model assumed
// while it was trained.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::predictor::model::TrainingConfig;

/// An open simulated position.
#[derive(Debug, Clone, Serialize)]
pub struct PaperPosition {
    pub symbol: String,
    pub direction: i32,
    pub intensity: u8,
    pub volume: f64,
    pub entry_price: f64,
    pub entry_time: f64,
    pub current_pnl: f64,
}

/// A closed simulated trade.
#[derive(Debug, Clone, Serialize)]
pub struct PaperTrade {
    pub symbol: String,
    pub direction: i32,
    pub intensity: u8,
    pub volume: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub entry_time: f64,
    pub exit_time: f64,
    pub pnl: f64,
    pub pnl_pips: f64,
    /// Round-trip commission.
    pub commission: f64,
    pub regime_state: usize,
}

pub struct PaperAccount {
    pub initial_balance: f64,
    pub balance: f64,
    pub equity: f64,

    spread_points: f64,
    slippage_points: f64,
    commission_per_lot: f64,
    point: f64,
    pip_value: f64,
    lot_sizes: Vec<f64>,
    points_per_pip: f64,

    pub positions: HashMap<String, PaperPosition>,
    pub closed_trades: Vec<PaperTrade>,
    pub total_commission: f64,
}

impl PaperAccount {
    pub fn new(initial_balance: f64, config: &TrainingConfig) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            equity: initial_balance,
            spread_points: config.spread_points,
            slippage_points: config.slippage_points,
            commission_per_lot: config.commission_per_lot,
            point: config.point,
            pip_value: config.pip_value,
            lot_sizes: config.lot_sizes.clone(),
            points_per_pip: if config.digits == 5 || config.digits == 3 {
                10.0
            } else {
                1.0
            },
            positions: HashMap::new(),
            closed_trades: Vec::new(),
            total_commission: 0.0,
        }
    }

    /// Open a simulated position. Returns false when one is already open
    /// for the symbol or the intensity maps to a zero lot.
    pub fn open_position(
        &mut self,
        symbol: &str,
        direction: i32,
        intensity: u8,
        price: f64,
        timestamp: f64,
    ) -> bool {
        if self.positions.contains_key(symbol) {
            return false;
        }

        let Some(&volume) = self.lot_sizes.get(intensity as usize) else {
            return false;
        };
        if volume <= 0.0 {
            return false;
        }

        let spread_cost = self.spread_points * self.point;
        let slippage = self.slippage_points * self.point;
        let entry_price = if direction == 1 {
            price + spread_cost + slippage
        } else {
            price - spread_cost - slippage
        };

        // Entry commission (half of the round trip).
        let commission = (self.commission_per_lot * volume) / 2.0;
        self.balance -= commission;
        self.total_commission += commission;

        self.positions.insert(
            symbol.to_string(),
            PaperPosition {
                symbol: symbol.to_string(),
                direction,
                intensity,
                volume,
                entry_price,
                entry_time: timestamp,
                current_pnl: 0.0,
            },
        );
        true
    }

    /// Close the simulated position and record the trade.
    pub fn close_position(
        &mut self,
        symbol: &str,
        price: f64,
        timestamp: f64,
        regime_state: usize,
    ) -> Option<PaperTrade> {
        let position = self.positions.remove(symbol)?;

        let slippage = self.slippage_points * self.point;
        let exit_price = if position.direction == 1 {
            price - slippage
        } else {
            price + slippage
        };

        let price_diff = (exit_price - position.entry_price) * position.direction as f64;
        let pips = price_diff / self.point / self.points_per_pip;
        let mut pnl = pips * self.pip_value * position.volume;

        // Exit commission (half of the round trip).
        let commission = (self.commission_per_lot * position.volume) / 2.0;
        pnl -= commission;
        self.total_commission += commission;

        self.balance += pnl;
        self.equity = self.balance;

        let trade = PaperTrade {
            symbol: position.symbol,
            direction: position.direction,
            intensity: position.intensity,
            volume: position.volume,
            entry_price: position.entry_price,
            exit_price,
            entry_time: position.entry_time,
            exit_time: timestamp,
            pnl,
            pnl_pips: pips,
            commission: commission * 2.0,
            regime_state,
        };
        self.closed_trades.push(trade.clone());
        Some(trade)
    }

    /// Refresh floating PnL and equity from current prices.
    pub fn update_equity(&mut self, prices: &HashMap<String, f64>) {
        let mut floating = 0.0;
        for (symbol, position) in self.positions.iter_mut() {
            if let Some(&price) = prices.get(symbol) {
                let diff = (price - position.entry_price) * position.direction as f64;
                let pips = diff / self.point / self.points_per_pip;
                position.current_pnl = pips * self.pip_value * position.volume;
            }
            floating += position.current_pnl;
        }
        self.equity = self.balance + floating;
    }
}
