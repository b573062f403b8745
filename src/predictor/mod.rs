// =============================================================================
// Predictor — per-symbol inference pipeline and virtual-position twin
// =============================================================================
//
// The predictor is blind to reality: it never sees the real account,
// positions, margin or live spread, and no executor ACK feeds back into
// it. Its state is exactly what the models were trained against — a ring
// of recent bars plus the virtual twin.
//
// Per closed bar:
//   1. Append to the ring; below capacity, stay silent.
//   2. Regime features → regime state.
//   3. Policy features (market + one-hot state + twin view) → action.
//   4. Update the twin.
//   5. Emit the Signal.
// =============================================================================

pub mod buffer;
pub mod features;
pub mod model;
pub mod virtual_position;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::types::{Action, Bar, Signal, Timeframe};
use buffer::BarBuffer;
use features::FeatureCalculator;
use model::ModelBundle;
use virtual_position::VirtualPositionManager;

pub struct Predictor {
    default_min_bars: usize,
    models: HashMap<String, ModelBundle>,
    buffers: HashMap<String, BarBuffer>,
    virtual_positions: HashMap<String, VirtualPositionManager>,
    calculators: HashMap<String, FeatureCalculator>,
}

impl Predictor {
    pub fn new(default_min_bars: usize) -> Self {
        Self {
            default_min_bars,
            models: HashMap::new(),
            buffers: HashMap::new(),
            virtual_positions: HashMap::new(),
            calculators: HashMap::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Model management
    // -------------------------------------------------------------------------

    /// Load a bundle and initialise the symbol's ring, twin and feature
    /// calculator. Returns the symbol on success; failure leaves all maps
    /// untouched.
    pub fn load_model(&mut self, path: impl AsRef<Path>) -> Result<String> {
        let bundle = ModelBundle::load(path)?;
        let symbol = bundle.symbol.clone();

        let min_bars = bundle
            .metadata
            .get("preditor")
            .and_then(|p| p.get("min_bars"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(self.default_min_bars);

        // Feature windows come from both model configs merged.
        let mut merged = bundle.regime_config.clone();
        if let (Some(dst), Some(src)) = (merged.as_object_mut(), bundle.policy_config.as_object())
        {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        let calculator = FeatureCalculator::from_config(&merged);
        let twin = VirtualPositionManager::from_training_config(&bundle.training_config);

        info!(
            symbol = %symbol,
            timeframe = %bundle.timeframe,
            min_bars,
            n_states = bundle.regime.n_states,
            "model registered"
        );

        self.buffers.insert(symbol.clone(), BarBuffer::new(min_bars));
        self.virtual_positions.insert(symbol.clone(), twin);
        self.calculators.insert(symbol.clone(), calculator);
        self.models.insert(symbol.clone(), bundle);

        Ok(symbol)
    }

    /// Drop a model and every piece of per-symbol state.
    pub fn unload_model(&mut self, symbol: &str) -> bool {
        if self.models.remove(symbol).is_none() {
            return false;
        }
        self.buffers.remove(symbol);
        self.virtual_positions.remove(symbol);
        self.calculators.remove(symbol);
        info!(%symbol, "model unloaded");
        true
    }

    pub fn list_models(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.models.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn has_model(&self, symbol: &str) -> bool {
        self.models.contains_key(symbol)
    }

    pub fn timeframe(&self, symbol: &str) -> Option<Timeframe> {
        self.models.get(symbol).map(|m| m.timeframe)
    }

    pub fn training_config(&self, symbol: &str) -> Option<&model::TrainingConfig> {
        self.models.get(symbol).map(|m| &m.training_config)
    }

    // -------------------------------------------------------------------------
    // Warmup
    // -------------------------------------------------------------------------

    /// Fast-forward through history: fill the ring, then run the pipeline
    /// silently for each remaining bar so the twin ends up holding what the
    /// model "would have" held. No signals are emitted.
    pub fn warmup(&mut self, symbol: &str, bars: &[Bar]) -> usize {
        if !self.models.contains_key(symbol) {
            warn!(%symbol, "warmup: model not loaded");
            return 0;
        }

        let mut predicted = 0;
        for bar in bars {
            self.buffers.get_mut(symbol).unwrap().push(bar.clone());
            if self.buffers[symbol].is_ready() {
                self.predict_internal(symbol, bar);
                predicted += 1;
            }
        }

        let vp = &self.virtual_positions[symbol];
        info!(
            %symbol,
            bars = bars.len(),
            predicted,
            position = vp.direction_name(),
            pnl = format!("{:.2}", vp.current_pnl),
            "warmup complete"
        );
        predicted
    }

    // -------------------------------------------------------------------------
    // Per-bar pipeline
    // -------------------------------------------------------------------------

    /// Process one closed bar. Returns `None` until the ring is full.
    pub fn process_bar(&mut self, symbol: &str, bar: &Bar) -> Option<Signal> {
        if !self.models.contains_key(symbol) {
            warn!(%symbol, "process_bar: model not loaded");
            return None;
        }

        self.buffers.get_mut(symbol).unwrap().push(bar.clone());
        if !self.buffers[symbol].is_ready() {
            return None;
        }

        let (action, regime_state) = self.predict_internal(symbol, bar);
        let vp = &self.virtual_positions[symbol];

        let signal = Signal {
            symbol: symbol.to_string(),
            action,
            direction: action.direction().value(),
            intensity: action.intensity(),
            regime_state,
            virtual_pnl: vp.current_pnl,
            timestamp: Utc::now().timestamp_millis() as f64 / 1000.0,
        };

        info!(
            %symbol,
            bar_time = bar.time,
            action = %signal.action,
            state = regime_state,
            virtual_pnl = format!("{:.2}", signal.virtual_pnl),
            "bar processed"
        );

        Some(signal)
    }

    /// Full inference step, shared by warmup and the live pipeline.
    fn predict_internal(&mut self, symbol: &str, bar: &Bar) -> (Action, usize) {
        let bundle = &self.models[symbol];
        let calc = &self.calculators[symbol];
        let window = self.buffers[symbol].as_slice();

        let regime_features = calc.regime_features(&window);
        let regime_state = bundle.regime.predict(&regime_features);

        let view = self.virtual_positions[symbol].as_view();
        let policy_features = calc.policy_features(&window, regime_state, &view);
        let action_idx = bundle.policy.predict(&policy_features);
        let action = Action::from_index(action_idx);

        let vp = self.virtual_positions.get_mut(symbol).unwrap();
        let old_dir = vp.direction;
        let realized = vp.update(action, bar.close);

        if old_dir != vp.direction {
            info!(
                %symbol,
                from = dir_name(old_dir),
                to = vp.direction_name(),
                realized = format!("{:.2}", realized),
                "virtual position changed"
            );
        }

        (action, regime_state)
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn get_virtual_position(&self, symbol: &str) -> Option<&VirtualPositionManager> {
        self.virtual_positions.get(symbol)
    }

    /// Complete state snapshot for the control channel.
    pub fn get_state(&self) -> serde_json::Value {
        let positions: serde_json::Map<String, serde_json::Value> = self
            .virtual_positions
            .iter()
            .map(|(symbol, vp)| {
                (
                    symbol.clone(),
                    serde_json::json!({
                        "direction": vp.direction,
                        "direction_name": vp.direction_name(),
                        "intensity": vp.intensity,
                        "entry_price": vp.entry_price,
                        "pnl": round2(vp.current_pnl),
                        "total_realized": round2(vp.total_realized_pnl),
                    }),
                )
            })
            .collect();

        let buffers: serde_json::Map<String, serde_json::Value> = self
            .buffers
            .iter()
            .map(|(symbol, buf)| {
                (
                    symbol.clone(),
                    serde_json::json!({
                        "size": buf.len(),
                        "maxlen": buf.maxlen(),
                        "ready": buf.is_ready(),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "models": self.list_models(),
            "positions": positions,
            "buffers": buffers,
        })
    }
}

fn dir_name(direction: i32) -> &'static str {
    match direction {
        1 => "LONG",
        -1 => "SHORT",
        _ => "FLAT",
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::model::tests::{metadata, policy_blob, regime_blob, write_bundle};
    use super::*;

    const MIN_BARS: usize = 30;

    fn bar(i: usize, close: f64) -> Bar {
        Bar {
            symbol: "EURUSD".into(),
            time: i as i64 * 900,
            open: close,
            high: close + 0.0005,
            low: close - 0.0005,
            close,
            volume: 100.0,
        }
    }

    /// Predictor with a bundle whose policy always prefers `bias_action`.
    fn predictor_with_bias(bias_action: usize) -> Predictor {
        let dir = tempfile::tempdir().unwrap();
        let n_states = 5;
        let mut meta = metadata("EURUSD", "M15", n_states);
        meta["preditor"] = serde_json::json!({ "min_bars": MIN_BARS });
        let path = write_bundle(
            dir.path(),
            "EURUSD",
            "M15",
            &meta,
            &regime_blob(n_states),
            &policy_blob(6 + n_states + 3, bias_action),
        );

        let mut predictor = Predictor::new(350);
        predictor.load_model(&path).unwrap();
        predictor
    }

    #[test]
    fn load_and_unload_roundtrip() {
        let mut predictor = predictor_with_bias(0);
        assert_eq!(predictor.list_models(), vec!["EURUSD".to_string()]);
        assert!(predictor.has_model("EURUSD"));

        assert!(predictor.unload_model("EURUSD"));
        assert!(!predictor.has_model("EURUSD"));
        assert!(predictor.get_virtual_position("EURUSD").is_none());
        assert!(!predictor.unload_model("EURUSD"));
    }

    #[test]
    fn load_failure_leaves_state_intact() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("missing.zip");

        let mut predictor = predictor_with_bias(0);
        assert!(predictor.load_model(&bad).is_err());
        assert_eq!(predictor.list_models().len(), 1);
    }

    #[test]
    fn silent_until_ring_full() {
        let mut predictor = predictor_with_bias(1);
        for i in 0..MIN_BARS - 1 {
            let signal = predictor.process_bar("EURUSD", &bar(i, 1.1));
            assert!(signal.is_none(), "bar {i} should be silent");
        }
        let signal = predictor.process_bar("EURUSD", &bar(MIN_BARS - 1, 1.1));
        assert!(signal.is_some());
    }

    #[test]
    fn signal_invariant_direction_iff_intensity() {
        for bias in 0..7 {
            let mut predictor = predictor_with_bias(bias);
            let mut last = None;
            for i in 0..MIN_BARS + 3 {
                last = predictor.process_bar("EURUSD", &bar(i, 1.1 + i as f64 * 1e-5));
            }
            let signal = last.unwrap();
            assert_eq!(
                signal.direction == 0,
                signal.intensity == 0,
                "bias {bias}: direction {} intensity {}",
                signal.direction,
                signal.intensity
            );
        }
    }

    #[test]
    fn long_bias_opens_virtual_long() {
        let mut predictor = predictor_with_bias(2); // LONG_MODERATE
        for i in 0..MIN_BARS {
            predictor.process_bar("EURUSD", &bar(i, 1.1));
        }
        let vp = predictor.get_virtual_position("EURUSD").unwrap();
        assert_eq!(vp.direction, 1);
        assert_eq!(vp.intensity, 2);
    }

    #[test]
    fn warmup_runs_silent_predictions_and_aligns_twin() {
        let mut predictor = predictor_with_bias(1); // LONG_WEAK
        let bars: Vec<Bar> = (0..MIN_BARS + 20).map(|i| bar(i, 1.1)).collect();

        let predicted = predictor.warmup("EURUSD", &bars);
        assert_eq!(predicted, 21);

        // After warmup the twin already holds the long the model favours.
        let vp = predictor.get_virtual_position("EURUSD").unwrap();
        assert_eq!(vp.direction, 1);
    }

    #[test]
    fn warmup_without_model_is_zero() {
        let mut predictor = Predictor::new(350);
        assert_eq!(predictor.warmup("EURUSD", &[]), 0);
    }

    #[test]
    fn state_snapshot_shape() {
        let mut predictor = predictor_with_bias(0);
        for i in 0..MIN_BARS {
            predictor.process_bar("EURUSD", &bar(i, 1.1));
        }
        let state = predictor.get_state();
        assert_eq!(state["models"][0], "EURUSD");
        assert_eq!(state["buffers"]["EURUSD"]["ready"], true);
        assert!(state["positions"]["EURUSD"]["direction_name"].is_string());
    }
}
