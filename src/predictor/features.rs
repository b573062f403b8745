// =============================================================================
// Feature computation — frozen formulas from the training environment
// =============================================================================
//
// The values produced here are part of the trained model's implicit
// contract: every term, clip and normalisation must match the training
// pipeline exactly, in IEEE-754 double precision, or the policy's outputs
// drift from what it was trained against. Windows that cannot be satisfied
// (or divisions by zero) yield 0 for the affected term, matching the
// training pipeline's NaN handling on the last row.
// =============================================================================

use crate::types::Bar;

/// Virtual-position view injected into the policy feature vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionView {
    pub direction: i32,
    /// Real lot size for the current intensity.
    pub size: f64,
    pub current_pnl: f64,
}

/// Parameterised by the model bundle's regime + policy configs.
#[derive(Debug, Clone)]
pub struct FeatureCalculator {
    // Regime windows.
    pub momentum_period: usize,
    pub consistency_period: usize,
    pub regime_range_period: usize,
    pub n_states: usize,

    // Policy windows.
    pub roc_period: usize,
    pub atr_period: usize,
    pub ema_period: usize,
    pub range_period: usize,
    pub volume_ma_period: usize,
}

impl FeatureCalculator {
    pub fn from_config(config: &serde_json::Value) -> Self {
        let get = |key: &str, default: u64| -> usize {
            config.get(key).and_then(|v| v.as_u64()).unwrap_or(default) as usize
        };
        Self {
            momentum_period: get("momentum_period", 12),
            consistency_period: get("consistency_period", 12),
            regime_range_period: get("range_period", 20),
            n_states: get("n_states", 5),
            roc_period: get("roc_period", 10),
            atr_period: get("atr_period", 14),
            ema_period: get("ema_period", 200),
            range_period: get("range_period", 20),
            volume_ma_period: get("volume_ma_period", 20),
        }
    }

    // -------------------------------------------------------------------------
    // Regime features: [momentum, consistency, range_position]
    // -------------------------------------------------------------------------

    pub fn regime_features(&self, bars: &[&Bar]) -> Vec<f64> {
        vec![
            zero_if_nan(self.momentum(bars)),
            zero_if_nan(self.consistency(bars)),
            zero_if_nan(self.range_position(bars, self.regime_range_period)),
        ]
    }

    /// Sum of the last `momentum_period` single-bar returns × 100,
    /// clipped to ±5.
    fn momentum(&self, bars: &[&Bar]) -> f64 {
        let n = self.momentum_period;
        if bars.len() < n + 1 {
            return f64::NAN;
        }
        let mut sum = 0.0;
        for i in bars.len() - n..bars.len() {
            let prev = bars[i - 1].close;
            if prev == 0.0 {
                return f64::NAN;
            }
            sum += bars[i].close / prev - 1.0;
        }
        (sum * 100.0).clamp(-5.0, 5.0)
    }

    /// Directional persistence over the last `consistency_period` returns:
    /// (max(up, down) / n × 2 − 1) × sign(up − down).
    fn consistency(&self, bars: &[&Bar]) -> f64 {
        let n = self.consistency_period;
        if bars.len() < n + 1 {
            return f64::NAN;
        }
        let mut up = 0.0f64;
        let mut down = 0.0f64;
        for i in bars.len() - n..bars.len() {
            let ret = bars[i].close - bars[i - 1].close;
            if ret > 0.0 {
                up += 1.0;
            } else if ret < 0.0 {
                down += 1.0;
            }
        }
        let skew = up.max(down) / n as f64 * 2.0 - 1.0;
        skew * (up - down).signum_or_zero()
    }

    /// Close position within the rolling high/low range, scaled to ±1.
    fn range_position(&self, bars: &[&Bar], period: usize) -> f64 {
        if bars.len() < period {
            return f64::NAN;
        }
        let window = &bars[bars.len() - period..];
        let highest = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let range = highest - lowest;
        if range == 0.0 {
            return f64::NAN;
        }
        let close = bars[bars.len() - 1].close;
        (close - lowest) / range * 2.0 - 1.0
    }

    // -------------------------------------------------------------------------
    // Policy features: 6 market + n_states one-hot + 3 position
    // -------------------------------------------------------------------------

    pub fn policy_features(
        &self,
        bars: &[&Bar],
        regime_state: usize,
        position: &PositionView,
    ) -> Vec<f64> {
        let mut features = Vec::with_capacity(6 + self.n_states + 3);

        features.push(zero_if_nan(self.roc(bars)));
        features.push(zero_if_nan(self.atr_normalised(bars)));
        features.push(zero_if_nan(self.trend_vs_ema(bars)));
        features.push(zero_if_nan(self.range_position(bars, self.range_period)));
        features.push(zero_if_nan(self.relative_volume(bars)));
        features.push(zero_if_nan(self.session(bars)));

        for i in 0..self.n_states {
            features.push(if i == regime_state { 1.0 } else { 0.0 });
        }

        features.push(position.direction as f64);
        features.push(position.size * 10.0);
        features.push((position.current_pnl / 100.0).tanh());

        features
    }

    /// tanh of the `roc_period` rate of change × 20.
    fn roc(&self, bars: &[&Bar]) -> f64 {
        let p = self.roc_period;
        if bars.len() < p + 1 {
            return f64::NAN;
        }
        let past = bars[bars.len() - 1 - p].close;
        if past == 0.0 {
            return f64::NAN;
        }
        let close = bars[bars.len() - 1].close;
        ((close - past) / past * 20.0).tanh()
    }

    /// tanh of (mean true range / close × 50).
    fn atr_normalised(&self, bars: &[&Bar]) -> f64 {
        let p = self.atr_period;
        if bars.len() < p + 1 {
            return f64::NAN;
        }
        let mut sum_tr = 0.0;
        for i in bars.len() - p..bars.len() {
            let high = bars[i].high;
            let low = bars[i].low;
            let prev_close = bars[i - 1].close;
            let tr = (high - low)
                .max((high - prev_close).abs())
                .max((low - prev_close).abs());
            sum_tr += tr;
        }
        let atr = sum_tr / p as f64;
        let close = bars[bars.len() - 1].close;
        if close == 0.0 {
            return f64::NAN;
        }
        (atr / close * 50.0).tanh()
    }

    /// tanh of the close's deviation from the span-`ema_period` EMA × 20.
    /// The EMA recursion runs from the start of the window (adjust = false).
    fn trend_vs_ema(&self, bars: &[&Bar]) -> f64 {
        if bars.is_empty() {
            return f64::NAN;
        }
        let alpha = 2.0 / (self.ema_period as f64 + 1.0);
        let mut ema = bars[0].close;
        for bar in &bars[1..] {
            ema = alpha * bar.close + (1.0 - alpha) * ema;
        }
        if ema == 0.0 {
            return f64::NAN;
        }
        let close = bars[bars.len() - 1].close;
        ((close - ema) / ema * 20.0).tanh()
    }

    /// tanh of (volume / rolling mean − 1) × 2, zero-mean volume guarded.
    fn relative_volume(&self, bars: &[&Bar]) -> f64 {
        let p = self.volume_ma_period;
        if bars.len() < p {
            return f64::NAN;
        }
        let window = &bars[bars.len() - p..];
        let mean: f64 = window.iter().map(|b| b.volume).sum::<f64>() / p as f64;
        let mean = if mean == 0.0 { 1.0 } else { mean };
        let volume = bars[bars.len() - 1].volume;
        ((volume / mean - 1.0) * 2.0).tanh()
    }

    /// Time-of-day encoding: sin(2π · hour / 24) of the last bar.
    fn session(&self, bars: &[&Bar]) -> f64 {
        let Some(last) = bars.last() else {
            return f64::NAN;
        };
        let hour = (last.time.rem_euclid(86_400)) / 3600;
        (2.0 * std::f64::consts::PI * hour as f64 / 24.0).sin()
    }
}

fn zero_if_nan(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v
    }
}

trait SignumOrZero {
    fn signum_or_zero(self) -> f64;
}

impl SignumOrZero for f64 {
    /// `f64::signum` maps 0.0 to 1.0; the training code uses sign(0) = 0.
    fn signum_or_zero(self) -> f64 {
        if self == 0.0 {
            0.0
        } else {
            self.signum()
        }
    }
}
