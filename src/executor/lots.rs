// =============================================================================
// Symbol configs and lot mapping
// =============================================================================
//
// Per-symbol execution settings live in a JSON file next to the runtime
// config. Keys starting with `_` are reserved (`_risk` carries the risk
// gate settings) and must survive round trips untouched. Signal intensity
// maps to a configured lot size; everything else about sizing is the risk
// gate's problem.
// =============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// SymbolConfig
// =============================================================================

fn default_enabled() -> bool {
    true
}
fn default_lot_weak() -> f64 {
    0.01
}
fn default_lot_moderate() -> f64 {
    0.03
}
fn default_lot_strong() -> f64 {
    0.05
}
fn default_sl_usd() -> f64 {
    10.0
}
fn default_max_spread_pips() -> f64 {
    2.0
}

/// Execution settings for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_lot_weak")]
    pub lot_weak: f64,
    #[serde(default = "default_lot_moderate")]
    pub lot_moderate: f64,
    #[serde(default = "default_lot_strong")]
    pub lot_strong: f64,
    #[serde(default = "default_sl_usd")]
    pub sl_usd: f64,
    #[serde(default)]
    pub tp_usd: f64,
    #[serde(default = "default_max_spread_pips")]
    pub max_spread_pips: f64,
}

impl Default for SymbolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lot_weak: default_lot_weak(),
            lot_moderate: default_lot_moderate(),
            lot_strong: default_lot_strong(),
            sl_usd: default_sl_usd(),
            tp_usd: 0.0,
            max_spread_pips: default_max_spread_pips(),
        }
    }
}

impl SymbolConfig {
    /// Intensity → configured volume. 0 for WAIT or out-of-range values.
    pub fn lot_for_intensity(&self, intensity: u8) -> f64 {
        match intensity {
            1 => self.lot_weak,
            2 => self.lot_moderate,
            3 => self.lot_strong,
            _ => 0.0,
        }
    }

    /// Apply a partial update from the control channel. Unknown fields are
    /// ignored; returns the list of applied field names.
    pub fn apply_updates(&mut self, updates: &serde_json::Value) -> Vec<String> {
        let mut applied = Vec::new();
        let Some(map) = updates.as_object() else {
            return applied;
        };

        for (key, value) in map {
            let ok = match key.as_str() {
                "enabled" => value.as_bool().map(|v| self.enabled = v).is_some(),
                "lot_weak" => value.as_f64().map(|v| self.lot_weak = v).is_some(),
                "lot_moderate" => value.as_f64().map(|v| self.lot_moderate = v).is_some(),
                "lot_strong" => value.as_f64().map(|v| self.lot_strong = v).is_some(),
                "sl_usd" => value.as_f64().map(|v| self.sl_usd = v).is_some(),
                "tp_usd" => value.as_f64().map(|v| self.tp_usd = v).is_some(),
                "max_spread_pips" => value.as_f64().map(|v| self.max_spread_pips = v).is_some(),
                _ => false,
            };
            if ok {
                applied.push(key.clone());
            }
        }
        applied
    }
}

// =============================================================================
// Risk gate settings (the `_risk` reserved key)
// =============================================================================

fn default_dd_limit() -> f64 {
    5.0
}
fn default_dd_emergency() -> f64 {
    10.0
}
fn default_max_losses() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSettings {
    #[serde(default = "default_dd_limit")]
    pub dd_limit_pct: f64,
    #[serde(default = "default_dd_emergency")]
    pub dd_emergency_pct: f64,
    #[serde(default)]
    pub initial_balance: f64,
    #[serde(default = "default_max_losses")]
    pub max_consecutive_losses: u32,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            dd_limit_pct: default_dd_limit(),
            dd_emergency_pct: default_dd_emergency(),
            initial_balance: 0.0,
            max_consecutive_losses: default_max_losses(),
        }
    }
}

// =============================================================================
// Config file I/O
// =============================================================================

/// The parsed symbol-config file: symbols plus the reserved `_` entries it
/// arrived with, preserved verbatim for the save path.
#[derive(Debug, Clone, Default)]
pub struct SymbolConfigFile {
    pub symbols: BTreeMap<String, SymbolConfig>,
    pub risk: RiskSettings,
    reserved: BTreeMap<String, serde_json::Value>,
}

impl SymbolConfigFile {
    /// Load from JSON. A missing file yields an empty config set with
    /// default risk settings.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read symbol config {}", path.display()))?;
        let data: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse symbol config {}", path.display()))?;

        let mut file = Self::default();
        for (key, value) in data {
            if let Some(rest) = key.strip_prefix('_') {
                if rest == "risk" {
                    file.risk = serde_json::from_value(value.clone())
                        .context("invalid _risk settings")?;
                }
                file.reserved.insert(key, value);
            } else {
                let config: SymbolConfig = serde_json::from_value(value)
                    .with_context(|| format!("invalid config for symbol {key}"))?;
                file.symbols.insert(key, config);
            }
        }

        info!(
            path = %path.display(),
            symbols = file.symbols.len(),
            dd_limit_pct = file.risk.dd_limit_pct,
            "symbol configs loaded"
        );
        Ok(file)
    }

    /// Persist symbols back to JSON, keeping reserved `_` keys intact.
    /// Atomic tmp + rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let mut out = serde_json::Map::new();
        for (key, value) in &self.reserved {
            out.insert(key.clone(), value.clone());
        }
        for (symbol, config) in &self.symbols {
            out.insert(symbol.clone(), serde_json::to_value(config)?);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }

        let content = serde_json::to_string_pretty(&serde_json::Value::Object(out))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;

        info!(path = %path.display(), "symbol configs saved (atomic)");
        Ok(())
    }
}
