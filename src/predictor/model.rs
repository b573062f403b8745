// =============================================================================
// Model bundles — zip container with metadata header and two model blobs
// =============================================================================
//
// One bundle per symbol: `{SYMBOL}_{TIMEFRAME}.zip` holding
// `{SYMBOL}_{TIMEFRAME}_regime.json` and `{SYMBOL}_{TIMEFRAME}_policy.json`
// plus a JSON metadata header stored in the archive comment. Loading
// validates the metadata before touching any per-symbol state, so a broken
// bundle never leaves the predictor half-initialised.
//
// Both blobs parameterise deterministic pure functions:
//   regime(vec) -> state   diagonal-Gaussian scorer, argmax log-likelihood
//   policy(vec) -> action  feed-forward tanh network, argmax output
// =============================================================================

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{error, info};

use crate::types::Timeframe;

const SUPPORTED_VERSIONS: &[&str] = &["2.0"];

const REQUIRED_METADATA_KEYS: &[&str] = &[
    "format_version",
    "symbol",
    "training_config",
    "regime_config",
    "policy_config",
    "actions",
];

// ---------------------------------------------------------------------------
// Metadata sections
// ---------------------------------------------------------------------------

/// Training cost parameters — frozen at training time, consumed verbatim by
/// the virtual-position twin and the paper shadow.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_spread_points")]
    pub spread_points: f64,
    #[serde(default = "default_slippage_points")]
    pub slippage_points: f64,
    #[serde(default = "default_commission")]
    pub commission_per_lot: f64,
    #[serde(default = "default_point")]
    pub point: f64,
    #[serde(default = "default_pip_value")]
    pub pip_value: f64,
    #[serde(default = "default_digits")]
    pub digits: i32,
    #[serde(default = "default_lot_sizes")]
    pub lot_sizes: Vec<f64>,
}

fn default_spread_points() -> f64 {
    7.0
}
fn default_slippage_points() -> f64 {
    2.0
}
fn default_commission() -> f64 {
    7.0
}
fn default_point() -> f64 {
    0.00001
}
fn default_pip_value() -> f64 {
    10.0
}
fn default_digits() -> i32 {
    5
}
fn default_lot_sizes() -> Vec<f64> {
    vec![0.0, 0.01, 0.03, 0.05]
}

impl Default for TrainingConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults are valid")
    }
}

// ---------------------------------------------------------------------------
// Regime model
// ---------------------------------------------------------------------------

/// Diagonal-Gaussian state scorer. `predict` returns the state with the
/// highest log-likelihood for the feature vector.
#[derive(Debug, Clone, Deserialize)]
pub struct RegimeModel {
    pub n_states: usize,
    /// Per-state feature means, shape [n_states][n_features].
    pub means: Vec<Vec<f64>>,
    /// Per-state diagonal variances, same shape.
    pub variances: Vec<Vec<f64>>,
    /// Optional per-state log prior; uniform when absent.
    #[serde(default)]
    pub log_weights: Option<Vec<f64>>,
}

impl RegimeModel {
    pub fn validate(&self) -> Result<()> {
        if self.n_states == 0 || self.means.len() != self.n_states {
            bail!("regime model: means/n_states mismatch");
        }
        if self.variances.len() != self.n_states {
            bail!("regime model: variances/n_states mismatch");
        }
        for (mean, var) in self.means.iter().zip(&self.variances) {
            if mean.len() != var.len() {
                bail!("regime model: mean/variance width mismatch");
            }
            if var.iter().any(|&v| v <= 0.0) {
                bail!("regime model: non-positive variance");
            }
        }
        Ok(())
    }

    pub fn predict(&self, features: &[f64]) -> usize {
        let mut best_state = 0;
        let mut best_score = f64::NEG_INFINITY;

        for state in 0..self.n_states {
            let mut score = self
                .log_weights
                .as_ref()
                .and_then(|w| w.get(state).copied())
                .unwrap_or(0.0);

            let means = &self.means[state];
            let vars = &self.variances[state];
            for ((&x, &mean), &var) in features.iter().zip(means).zip(vars) {
                let diff = x - mean;
                score -= 0.5 * (diff * diff / var + (2.0 * std::f64::consts::PI * var).ln());
            }

            if score > best_score {
                best_score = score;
                best_state = state;
            }
        }

        best_state
    }
}

// ---------------------------------------------------------------------------
// Policy model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyLayer {
    /// Row-major [outputs][inputs].
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

/// Feed-forward network with tanh hidden activations and an argmax output
/// head. Deterministic: the same features always yield the same action.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyModel {
    pub layers: Vec<PolicyLayer>,
}

impl PolicyModel {
    pub fn validate(&self, n_inputs: usize, n_actions: usize) -> Result<()> {
        if self.layers.is_empty() {
            bail!("policy model: no layers");
        }
        let mut width = n_inputs;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.is_empty() {
                bail!("policy model: empty layer {i}");
            }
            for row in &layer.weights {
                if row.len() != width {
                    bail!(
                        "policy model: layer {i} expects {width} inputs, row has {}",
                        row.len()
                    );
                }
            }
            if layer.bias.len() != layer.weights.len() {
                bail!("policy model: layer {i} bias width mismatch");
            }
            width = layer.weights.len();
        }
        if width != n_actions {
            bail!("policy model: output width {width} != action count {n_actions}");
        }
        Ok(())
    }

    pub fn predict(&self, features: &[f64]) -> usize {
        let mut activations: Vec<f64> = features.to_vec();

        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let mut next = Vec::with_capacity(layer.weights.len());
            for (row, &bias) in layer.weights.iter().zip(&layer.bias) {
                let mut sum = bias;
                for (&w, &x) in row.iter().zip(&activations) {
                    sum += w * x;
                }
                next.push(if i == last { sum } else { sum.tanh() });
            }
            activations = next;
        }

        activations
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// A fully-loaded model bundle for one symbol.
pub struct ModelBundle {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub regime: RegimeModel,
    pub policy: PolicyModel,
    pub metadata: serde_json::Value,
    pub training_config: TrainingConfig,
    pub regime_config: serde_json::Value,
    pub policy_config: serde_json::Value,
}

impl ModelBundle {
    /// Load a bundle from disk. Any failure returns an error without side
    /// effects.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("bundle not found: {}", path.display()))?;
        let mut archive =
            zip::ZipArchive::new(file).with_context(|| format!("not a zip: {}", path.display()))?;

        // 1. Metadata lives in the archive comment.
        let comment = archive.comment().to_vec();
        if comment.is_empty() {
            bail!("bundle has no metadata header: {}", path.display());
        }
        let metadata: serde_json::Value =
            serde_json::from_slice(&comment).context("metadata header is not valid JSON")?;

        // 2. Required keys.
        for key in REQUIRED_METADATA_KEYS {
            if metadata.get(key).is_none() {
                bail!("metadata missing required key '{key}'");
            }
        }

        // 3. Version gate.
        let version = metadata
            .get("format_version")
            .and_then(|v| v.as_str())
            .unwrap_or("1.0");
        if !SUPPORTED_VERSIONS.contains(&version) {
            bail!("unsupported bundle version {version} (supported: {SUPPORTED_VERSIONS:?})");
        }

        // 4. Symbol / timeframe.
        let symbol = metadata["symbol"]
            .get("name")
            .and_then(|v| v.as_str())
            .context("metadata missing symbol.name")?
            .to_string();
        let tf_label = metadata["symbol"]
            .get("timeframe")
            .and_then(|v| v.as_str())
            .context("metadata missing symbol.timeframe")?;
        let timeframe = Timeframe::parse(tf_label)
            .with_context(|| format!("unknown timeframe {tf_label}"))?;

        let prefix = format!("{symbol}_{tf_label}");
        let regime_name = format!("{prefix}_regime.json");
        let policy_name = format!("{prefix}_policy.json");

        // 5. Blobs.
        let regime: RegimeModel = read_json_entry(&mut archive, &regime_name)?;
        regime.validate()?;
        let policy: PolicyModel = read_json_entry(&mut archive, &policy_name)?;

        let training_config: TrainingConfig =
            serde_json::from_value(metadata["training_config"].clone())
                .context("invalid training_config")?;
        let regime_config = metadata["regime_config"].clone();
        let policy_config = metadata["policy_config"].clone();

        let n_states = regime_config
            .get("n_states")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as usize;
        if n_states != regime.n_states {
            bail!(
                "regime_config.n_states ({n_states}) disagrees with regime blob ({})",
                regime.n_states
            );
        }

        // Policy input: 6 market terms + one-hot states + 3 position terms,
        // output: the 7-action table.
        policy.validate(6 + n_states + 3, 7)?;

        info!(%symbol, timeframe = %timeframe, version, "model bundle loaded");

        Ok(Self {
            symbol,
            timeframe,
            regime,
            policy,
            metadata,
            training_config,
            regime_config,
            policy_config,
        })
    }

    /// Read only the metadata header, without loading the blobs. Used for
    /// listing the models directory.
    pub fn load_metadata(path: impl AsRef<Path>) -> Option<serde_json::Value> {
        let file = File::open(path.as_ref()).ok()?;
        let archive = zip::ZipArchive::new(file).ok()?;
        let comment = archive.comment();
        if comment.is_empty() {
            return None;
        }
        serde_json::from_slice(comment).ok()
    }
}

fn read_json_entry<T: serde::de::DeserializeOwned>(
    archive: &mut zip::ZipArchive<File>,
    name: &str,
) -> Result<T> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("bundle entry missing: {name}"))?;
    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut buf)
        .with_context(|| format!("failed to read {name}"))?;
    serde_json::from_slice(&buf).with_context(|| {
        error!(entry = name, "model blob is not valid JSON");
        format!("invalid model blob {name}")
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub(crate) fn regime_blob(n_states: usize) -> serde_json::Value {
        // States separated along the momentum axis so tests can steer the
        // classifier with feature[0].
        let means: Vec<Vec<f64>> = (0..n_states)
            .map(|s| vec![s as f64 - (n_states as f64 - 1.0) / 2.0, 0.0, 0.0])
            .collect();
        let variances = vec![vec![0.5, 1.0, 1.0]; n_states];
        serde_json::json!({
            "n_states": n_states,
            "means": means,
            "variances": variances,
        })
    }

    pub(crate) fn policy_blob(n_inputs: usize, bias_action: usize) -> serde_json::Value {
        // Single linear layer whose bias prefers `bias_action` unless the
        // inputs push another logit higher.
        let weights = vec![vec![0.0; n_inputs]; 7];
        let mut bias = vec![0.0; 7];
        bias[bias_action] = 1.0;
        serde_json::json!({
            "layers": [{ "weights": weights, "bias": bias }],
        })
    }

    pub(crate) fn write_bundle(
        dir: &std::path::Path,
        symbol: &str,
        timeframe: &str,
        metadata: &serde_json::Value,
        regime: &serde_json::Value,
        policy: &serde_json::Value,
    ) -> std::path::PathBuf {
        let path = dir.join(format!("{symbol}_{timeframe}.zip"));
        let file = File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        writer
            .start_file(format!("{symbol}_{timeframe}_regime.json"), options)
            .unwrap();
        writer
            .write_all(regime.to_string().as_bytes())
            .unwrap();

        writer
            .start_file(format!("{symbol}_{timeframe}_policy.json"), options)
            .unwrap();
        writer
            .write_all(policy.to_string().as_bytes())
            .unwrap();

        writer.set_comment(metadata.to_string());
        writer.finish().unwrap();
        path
    }

    pub(crate) fn metadata(symbol: &str, timeframe: &str, n_states: usize) -> serde_json::Value {
        serde_json::json!({
            "format_version": "2.0",
            "symbol": { "name": symbol, "timeframe": timeframe },
            "training_config": {
                "spread_points": 7.0,
                "slippage_points": 2.0,
                "commission_per_lot": 7.0,
                "point": 0.00001,
                "pip_value": 10.0,
                "digits": 5,
                "lot_sizes": [0.0, 0.01, 0.03, 0.05],
            },
            "regime_config": { "n_states": n_states, "momentum_period": 12 },
            "policy_config": { "roc_period": 10, "ema_period": 200 },
            "actions": ["WAIT", "LONG_WEAK", "LONG_MODERATE", "LONG_STRONG",
                        "SHORT_WEAK", "SHORT_MODERATE", "SHORT_STRONG"],
        })
    }

    #[test]
    fn load_valid_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let n_states = 5;
        let path = write_bundle(
            dir.path(),
            "EURUSD",
            "M15",
            &metadata("EURUSD", "M15", n_states),
            &regime_blob(n_states),
            &policy_blob(6 + n_states + 3, 1),
        );

        let bundle = ModelBundle::load(&path).unwrap();
        assert_eq!(bundle.symbol, "EURUSD");
        assert_eq!(bundle.timeframe, Timeframe::M15);
        assert_eq!(bundle.regime.n_states, 5);
        assert!((bundle.training_config.pip_value - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_metadata_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = metadata("EURUSD", "M15", 5);
        meta.as_object_mut().unwrap().remove("training_config");
        let path = write_bundle(
            dir.path(),
            "EURUSD",
            "M15",
            &meta,
            &regime_blob(5),
            &policy_blob(14, 0),
        );
        assert!(ModelBundle::load(&path).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut meta = metadata("EURUSD", "M15", 5);
        meta["format_version"] = serde_json::json!("1.0");
        let path = write_bundle(
            dir.path(),
            "EURUSD",
            "M15",
            &meta,
            &regime_blob(5),
            &policy_blob(14, 0),
        );
        assert!(ModelBundle::load(&path).is_err());
    }

    #[test]
    fn missing_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // Write a bundle whose blob names do not match the metadata symbol.
        let path = write_bundle(
            dir.path(),
            "GBPUSD",
            "M15",
            &metadata("EURUSD", "M15", 5),
            &regime_blob(5),
            &policy_blob(14, 0),
        );
        assert!(ModelBundle::load(&path).is_err());
    }

    #[test]
    fn regime_predict_picks_nearest_state() {
        let model: RegimeModel = serde_json::from_value(regime_blob(5)).unwrap();
        model.validate().unwrap();
        // Means along feature[0] are [-2, -1, 0, 1, 2].
        assert_eq!(model.predict(&[-2.0, 0.0, 0.0]), 0);
        assert_eq!(model.predict(&[0.0, 0.0, 0.0]), 2);
        assert_eq!(model.predict(&[2.0, 0.0, 0.0]), 4);
    }

    #[test]
    fn regime_predict_is_deterministic() {
        let model: RegimeModel = serde_json::from_value(regime_blob(3)).unwrap();
        let features = [0.37, -0.12, 0.88];
        let first = model.predict(&features);
        for _ in 0..10 {
            assert_eq!(model.predict(&features), first);
        }
    }

    #[test]
    fn policy_predict_respects_bias() {
        let model: PolicyModel = serde_json::from_value(policy_blob(14, 3)).unwrap();
        model.validate(14, 7).unwrap();
        assert_eq!(model.predict(&vec![0.0; 14]), 3);
    }

    #[test]
    fn policy_validate_rejects_bad_widths() {
        let model: PolicyModel = serde_json::from_value(policy_blob(14, 0)).unwrap();
        assert!(model.validate(10, 7).is_err());
        assert!(model.validate(14, 5).is_err());
    }
}
