// =============================================================================
// Virtual position — the policy's digital twin of its training account
// =============================================================================
//
// Replicates the training environment's position accounting exactly. The
// predictor believes its orders fill instantly, without rejection, at the
// training cost model — that keeps the position features (direction, size,
// pnl) mathematically consistent with what the policy saw in training.
//
// Do not reorder the arithmetic below: it must stay bit-reproducible
// against the training environment. All work is IEEE-754 double precision.
// =============================================================================

use crate::predictor::features::PositionView;
use crate::predictor::model::TrainingConfig;
use crate::types::Action;

/// Per-symbol virtual position with frozen training cost parameters.
#[derive(Debug, Clone)]
pub struct VirtualPositionManager {
    pub direction: i32,
    pub intensity: u8,
    pub entry_price: f64,
    pub current_pnl: f64,
    pub total_realized_pnl: f64,

    // Frozen training parameters.
    pub spread_points: f64,
    pub slippage_points: f64,
    pub commission_per_lot: f64,
    pub point: f64,
    pub pip_value: f64,
    pub digits: i32,
    pub lot_sizes: Vec<f64>,
}

impl VirtualPositionManager {
    pub fn from_training_config(config: &TrainingConfig) -> Self {
        Self {
            direction: 0,
            intensity: 0,
            entry_price: 0.0,
            current_pnl: 0.0,
            total_realized_pnl: 0.0,
            spread_points: config.spread_points,
            slippage_points: config.slippage_points,
            commission_per_lot: config.commission_per_lot,
            point: config.point,
            pip_value: config.pip_value,
            digits: config.digits,
            lot_sizes: config.lot_sizes.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.direction != 0
    }

    /// One pip is ten points in 5-digit and 3-digit pricing, one otherwise.
    pub fn points_per_pip(&self) -> f64 {
        if self.digits == 5 || self.digits == 3 {
            10.0
        } else {
            1.0
        }
    }

    /// Lot size for the current intensity, from the training table.
    pub fn size(&self) -> f64 {
        self.lot_sizes
            .get(self.intensity as usize)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn direction_name(&self) -> &'static str {
        match self.direction {
            1 => "LONG",
            -1 => "SHORT",
            _ => "FLAT",
        }
    }

    /// View injected into the policy feature vector.
    pub fn as_view(&self) -> PositionView {
        PositionView {
            direction: self.direction,
            size: self.size(),
            current_pnl: self.current_pnl,
        }
    }

    /// Apply the policy's action at the bar close.
    ///
    /// Same direction and intensity: refresh floating PnL only. Any change:
    /// close the open position (exit slippage + half commission), then open
    /// the new one if the target direction is non-zero (spread + slippage
    /// on entry, half commission). Returns the realized PnL of the close,
    /// 0.0 otherwise.
    pub fn update(&mut self, action: Action, current_price: f64) -> f64 {
        let target_dir = action.direction().value();
        let target_intensity = action.intensity();

        if target_dir == self.direction && target_intensity == self.intensity {
            self.update_floating_pnl(current_price);
            return 0.0;
        }

        let mut realized_pnl = 0.0;
        if self.direction != 0 {
            realized_pnl = self.close(current_price);
            self.total_realized_pnl += realized_pnl;
        }

        if target_dir != 0 {
            self.open(target_dir, target_intensity, current_price);
            self.update_floating_pnl(current_price);
        }

        realized_pnl
    }

    fn open(&mut self, direction: i32, intensity: u8, price: f64) {
        let spread_cost = self.spread_points * self.point;
        let slippage = self.slippage_points * self.point;

        if direction == 1 {
            self.entry_price = price + spread_cost + slippage;
        } else {
            self.entry_price = price - spread_cost - slippage;
        }

        self.direction = direction;
        self.intensity = intensity;
        self.current_pnl = 0.0;

        // Entry commission (half of the round trip).
        let lot_size = self.lot_sizes[intensity as usize];
        self.current_pnl -= (self.commission_per_lot * lot_size) / 2.0;
    }

    fn close(&mut self, price: f64) -> f64 {
        if self.direction == 0 {
            return 0.0;
        }

        let slippage = self.slippage_points * self.point;
        let exit_price = if self.direction == 1 {
            price - slippage
        } else {
            price + slippage
        };

        let price_diff = (exit_price - self.entry_price) * self.direction as f64;
        let pips = price_diff / self.point / self.points_per_pip();
        let lot_size = self.lot_sizes[self.intensity as usize];
        let mut pnl = pips * self.pip_value * lot_size;

        // Exit commission (half of the round trip).
        pnl -= (self.commission_per_lot * lot_size) / 2.0;

        self.direction = 0;
        self.intensity = 0;
        self.entry_price = 0.0;
        self.current_pnl = 0.0;

        pnl
    }

    fn update_floating_pnl(&mut self, current_price: f64) {
        if self.direction == 0 {
            self.current_pnl = 0.0;
            return;
        }

        let price_diff = (current_price - self.entry_price) * self.direction as f64;
        let pips = price_diff / self.point / self.points_per_pip();
        let lot_size = self.lot_sizes[self.intensity as usize];
        self.current_pnl = pips * self.pip_value * lot_size;
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn twin() -> VirtualPositionManager {
        VirtualPositionManager::from_training_config(&TrainingConfig {
            spread_points: 7.0,
            slippage_points: 2.0,
            commission_per_lot: 7.0,
            point: 0.00001,
            pip_value: 10.0,
            digits: 5,
            lot_sizes: vec![0.0, 0.01, 0.03, 0.05],
        })
    }

    #[test]
    fn flat_state_invariant() {
        let vp = twin();
        assert_eq!(vp.direction, 0);
        assert_eq!(vp.intensity, 0);
        assert_eq!(vp.entry_price, 0.0);
        assert!(!vp.is_open());
    }

    #[test]
    fn open_long_applies_spread_and_slippage() {
        let mut vp = twin();
        vp.update(Action::LongWeak, 1.10000);

        assert_eq!(vp.direction, 1);
        assert_eq!(vp.intensity, 1);
        // entry = close + (7 + 2) * 0.00001
        assert!((vp.entry_price - 1.10009).abs() < 1e-12);
    }

    #[test]
    fn open_short_mirrors_costs() {
        let mut vp = twin();
        vp.update(Action::ShortWeak, 1.10000);
        assert_eq!(vp.direction, -1);
        assert!((vp.entry_price - 1.09991).abs() < 1e-12);
    }

    #[test]
    fn same_action_is_noop_with_floating_refresh() {
        let mut vp = twin();
        vp.update(Action::LongWeak, 1.10000);
        let entry = vp.entry_price;

        let realized = vp.update(Action::LongWeak, 1.10100);
        assert_eq!(realized, 0.0);
        assert_eq!(vp.entry_price, entry);
        assert!(vp.current_pnl > 0.0);
    }

    #[test]
    fn close_realizes_expected_pnl() {
        let mut vp = twin();
        vp.update(Action::LongWeak, 1.10000);
        // entry = 1.10009; exit at close 1.10100 → exit = 1.10098 (slippage)
        let realized = vp.update(Action::Wait, 1.10100);

        // pips = (1.10098 - 1.10009) / 0.00001 / 10 = 8.9
        // pnl = 8.9 * 10 * 0.01 - 7 * 0.01 / 2 = 0.89 - 0.035 = 0.855
        assert!((realized - 0.855).abs() < 1e-9, "realized = {realized}");
        assert!((vp.total_realized_pnl - 0.855).abs() < 1e-9);
        assert!(!vp.is_open());
    }

    #[test]
    fn flat_iff_zero_entry_iff_zero_intensity() {
        let mut vp = twin();
        let prices = [1.1, 1.101, 1.102, 1.1, 1.099, 1.1];
        let actions = [
            Action::LongWeak,
            Action::LongStrong,
            Action::Wait,
            Action::ShortModerate,
            Action::ShortModerate,
            Action::Wait,
        ];
        for (action, price) in actions.into_iter().zip(prices) {
            vp.update(action, price);
            let flat = vp.direction == 0;
            assert_eq!(flat, vp.intensity == 0);
            assert_eq!(flat, vp.entry_price == 0.0);
        }
    }

    #[test]
    fn intensity_change_closes_and_reopens() {
        let mut vp = twin();
        vp.update(Action::LongWeak, 1.10000);
        let realized = vp.update(Action::LongStrong, 1.10050);

        // The weak position closed (realized is non-zero) and a strong one
        // opened at the new price.
        assert!(realized != 0.0);
        assert_eq!(vp.direction, 1);
        assert_eq!(vp.intensity, 3);
        assert!((vp.entry_price - 1.10059).abs() < 1e-12);
    }

    #[test]
    fn reversal_realizes_then_opens_opposite() {
        let mut vp = twin();
        vp.update(Action::LongModerate, 1.10000);
        let realized = vp.update(Action::ShortModerate, 1.09900);

        // Long lost ~10 pips on 0.03 lots plus costs.
        assert!(realized < 0.0);
        assert_eq!(vp.direction, -1);
        assert_eq!(vp.intensity, 2);
    }

    #[test]
    fn total_realized_accumulates_signed() {
        let mut vp = twin();
        vp.update(Action::LongWeak, 1.10000);
        let win = vp.update(Action::Wait, 1.10200);
        vp.update(Action::LongWeak, 1.10200);
        let loss = vp.update(Action::Wait, 1.10100);

        assert!(win > 0.0);
        assert!(loss < 0.0);
        assert!((vp.total_realized_pnl - (win + loss)).abs() < 1e-12);
    }

    #[test]
    fn jpy_digits_keep_ten_points_per_pip() {
        let mut vp = twin();
        vp.digits = 3;
        assert_eq!(vp.points_per_pip(), 10.0);
        vp.digits = 2;
        assert_eq!(vp.points_per_pip(), 1.0);
    }

    #[test]
    fn wait_on_flat_stays_flat() {
        let mut vp = twin();
        let realized = vp.update(Action::Wait, 1.1);
        assert_eq!(realized, 0.0);
        assert!(!vp.is_open());
        assert_eq!(vp.current_pnl, 0.0);
    }
}
