// =============================================================================
// Runtime Configuration — YAML with env-var expansion and atomic save
// =============================================================================
//
// Central configuration for the Borealis runtime. Every field carries a
// serde default so older config files keep loading after new fields are
// added. Credentials are supplied via `${VAR}` / `${VAR:default}`
// placeholders expanded from the environment at load time.
//
// Persistence uses the tmp + rename pattern to prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_broker_type() -> String {
    "ctrader".to_string()
}

fn default_environment() -> String {
    "demo".to_string()
}

fn default_timeframe() -> String {
    "M15".to_string()
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_models_dir() -> String {
    "./models".to_string()
}

fn default_warmup_bars() -> usize {
    1000
}

fn default_min_bars() -> usize {
    350
}

fn default_executor_config_file() -> String {
    "./config/executor_symbols.json".to_string()
}

fn default_sl_usd() -> f64 {
    10.0
}

fn default_hub_url() -> String {
    "ws://localhost:8000/ws/bot-v2".to_string()
}

fn default_instance_id() -> String {
    "bot-v2".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Broker credentials and environment selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(rename = "type", default = "default_broker_type")]
    pub broker_type: String,

    /// "demo" or "live" — selects the broker endpoint.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default)]
    pub access_token: String,

    #[serde(default)]
    pub account_id: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_type: default_broker_type(),
            environment: default_environment(),
            client_id: String::new(),
            client_secret: String::new(),
            access_token: String::new(),
            account_id: 0,
        }
    }
}

/// Predictor settings. The section keeps its historical `preditor` key in
/// the YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default = "default_models_dir")]
    pub models_dir: String,

    /// Bars of history fetched for warmup.
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,

    /// Minimum bars in the ring before the pipeline runs.
    #[serde(default = "default_min_bars")]
    pub min_bars: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            warmup_bars: default_warmup_bars(),
            min_bars: default_min_bars(),
        }
    }
}

/// Executor defaults applied when auto-creating per-symbol configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_config_file")]
    pub config_file: String,

    #[serde(default = "default_sl_usd")]
    pub default_sl_usd: f64,

    #[serde(default)]
    pub default_tp_usd: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            config_file: default_executor_config_file(),
            default_sl_usd: default_sl_usd(),
            default_tp_usd: 0.0,
        }
    }
}

/// Telemetry hub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_hub_url")]
    pub url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_hub_url(),
            token: String::new(),
            instance_id: default_instance_id(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_file: None,
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Top-level runtime configuration loaded from a YAML document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    /// Close all real positions during graceful shutdown.
    #[serde(default)]
    pub close_on_exit: bool,

    /// Close all real positions when the UTC day rolls over.
    #[serde(default)]
    pub close_on_day_change: bool,

    #[serde(rename = "preditor", default)]
    pub predictor: PredictorConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub supabase_url: String,

    #[serde(default)]
    pub supabase_key: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            timeframe: default_timeframe(),
            initial_balance: default_initial_balance(),
            close_on_exit: false,
            close_on_day_change: false,
            predictor: PredictorConfig::default(),
            executor: ExecutorConfig::default(),
            hub: HubConfig::default(),
            persistence: PersistenceConfig::default(),
            supabase_url: String::new(),
            supabase_key: String::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` and
    /// `${VAR:default}` placeholders from the environment first.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let expanded = expand_env(&raw);

        let config: Self = serde_yaml::from_str(&expanded)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            broker = %config.broker.broker_type,
            environment = %config.broker.environment,
            timeframe = %config.timeframe,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration using an atomic write (write to
    /// `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_yaml::to_string(self).context("failed to serialise config to YAML")?;

        let tmp_path = path.with_extension("yaml.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Env expansion
// =============================================================================

/// Expand `${VAR}` and `${VAR:default}` placeholders. Unset variables
/// without a default are left verbatim so the parse error points at them.
pub fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(end) = raw[i + 2..].find('}') {
                let inner = &raw[i + 2..i + 2 + end];
                let expansion = match inner.split_once(':') {
                    Some((name, default)) => {
                        std::env::var(name).unwrap_or_else(|_| default.to_string())
                    }
                    None => std::env::var(inner).unwrap_or_else(|_| format!("${{{inner}}}")),
                };
                out.push_str(&expansion);
                i += 2 + end + 1;
                continue;
            }
        }
        // Advance one UTF-8 character.
        let ch_len = raw[i..].chars().next().map_or(1, char::len_utf8);
        out.push_str(&raw[i..i + ch_len]);
        i += ch_len;
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.timeframe, "M15");
        assert!((cfg.initial_balance - 10_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.predictor.warmup_bars, 1000);
        assert_eq!(cfg.predictor.min_bars, 350);
        assert!(!cfg.close_on_exit);
        assert!(!cfg.hub.enabled);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
timeframe: M5
broker:
  type: ctrader
  environment: live
  account_id: 123
preditor:
  warmup_bars: 500
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.timeframe, "M5");
        assert_eq!(cfg.broker.environment, "live");
        assert_eq!(cfg.broker.account_id, 123);
        assert_eq!(cfg.predictor.warmup_bars, 500);
        assert_eq!(cfg.predictor.min_bars, 350);
        assert_eq!(cfg.executor.config_file, "./config/executor_symbols.json");
    }

    #[test]
    fn expand_env_with_default() {
        std::env::remove_var("BOREALIS_TEST_UNSET");
        let out = expand_env("a: ${BOREALIS_TEST_UNSET:fallback}");
        assert_eq!(out, "a: fallback");
    }

    #[test]
    fn expand_env_from_environment() {
        std::env::set_var("BOREALIS_TEST_SET", "hello");
        let out = expand_env("a: ${BOREALIS_TEST_SET}");
        assert_eq!(out, "a: hello");
        std::env::remove_var("BOREALIS_TEST_SET");
    }

    #[test]
    fn expand_env_leaves_unset_without_default() {
        std::env::remove_var("BOREALIS_TEST_MISSING");
        let out = expand_env("a: ${BOREALIS_TEST_MISSING}");
        assert_eq!(out, "a: ${BOREALIS_TEST_MISSING}");
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut cfg = AppConfig::default();
        cfg.timeframe = "H1".to_string();
        cfg.close_on_exit = true;
        cfg.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.timeframe, "H1");
        assert!(loaded.close_on_exit);
    }
}
