// =============================================================================
// Executor — turns predictor signals into real orders
// =============================================================================
//
// Per signal: config gates (missing/disabled/paused), fetch the real
// position, run the decision table, apply the edge rule, map intensity to
// lots, pass the risk gate, convert monetary SL/TP to absolute prices and
// submit. Every path returns an Ack; nothing here panics or unwinds
// through the pipeline.
//
// The executor never assumes the position cache reflects an order it just
// sent — the execution event stream is the ground truth.
// =============================================================================

pub mod comment;
pub mod lots;
pub mod price;
pub mod risk;
pub mod sync;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::connector::Connector;
use crate::types::{Position, Signal};
use lots::{SymbolConfig, SymbolConfigFile};
use price::SymbolPricing;
use risk::RiskGuard;
use sync::{decide, Decision, SyncState};

// ---------------------------------------------------------------------------
// Ack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckStatus {
    Ok,
    Skip,
    Error,
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Skip => "SKIP",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Acknowledgement of one processed signal.
#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub symbol: String,
    pub action: String,
    pub status: AckStatus,
    pub reason: String,
    pub ticket: Option<i64>,
}

impl Ack {
    fn new(signal: &Signal, status: AckStatus, reason: impl Into<String>) -> Self {
        Self {
            symbol: signal.symbol.clone(),
            action: signal.action.to_string(),
            status,
            reason: reason.into(),
            ticket: None,
        }
    }

    fn with_ticket(mut self, ticket: Option<i64>) -> Self {
        self.ticket = ticket;
        self
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    connector: Arc<dyn Connector>,
    config_path: PathBuf,
    configs: RwLock<SymbolConfigFile>,
    sync_states: RwLock<HashMap<String, SyncState>>,
    risk_guard: RiskGuard,
    paused: AtomicBool,
}

impl Executor {
    /// Load symbol configs from `config_path` and build the risk gate from
    /// the file's `_risk` entry.
    pub fn new(connector: Arc<dyn Connector>, config_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let config_path = config_path.into();
        let configs = SymbolConfigFile::load(&config_path)?;
        let risk_guard = RiskGuard::new(&configs.risk);

        let mut sync_states = HashMap::new();
        for symbol in configs.symbols.keys() {
            sync_states.insert(symbol.clone(), SyncState::new());
        }

        info!(
            symbols = configs.symbols.len(),
            dd_limit_pct = risk_guard.dd_limit_pct,
            "executor initialised"
        );

        Ok(Self {
            connector,
            config_path,
            configs: RwLock::new(configs),
            sync_states: RwLock::new(sync_states),
            risk_guard,
            paused: AtomicBool::new(false),
        })
    }

    pub fn risk_guard(&self) -> &RiskGuard {
        &self.risk_guard
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Signal pipeline
    // -------------------------------------------------------------------------

    pub async fn process_signal(&self, signal: &Signal) -> Ack {
        let symbol = &signal.symbol;

        // 1-2. Config gates.
        let config = match self.configs.read().symbols.get(symbol) {
            Some(config) => config.clone(),
            None => {
                warn!(%symbol, "no symbol config — add one via the control channel");
                return Ack::new(signal, AckStatus::Skip, "NO_CONFIG");
            }
        };
        if !config.enabled {
            return Ack::new(signal, AckStatus::Skip, "DISABLED");
        }

        // 3. Global pause.
        if self.is_paused() {
            return Ack::new(signal, AckStatus::Skip, "PAUSED");
        }

        // 4-5. Real position and decision.
        let real_position = self.connector.get_position(symbol).await;
        let decision = decide(signal, real_position.as_ref());

        // 6-7. Edge rule + execution.
        let should_open = {
            let mut states = self.sync_states.write();
            let state = states.entry(symbol.clone()).or_default();
            state.should_open(signal, decision)
        };

        match decision {
            Decision::Noop => Ack::new(signal, AckStatus::Ok, "SYNCED"),
            Decision::Close => self.close_real_position(signal, real_position).await,
            Decision::Open => {
                if should_open {
                    self.open_position(signal, &config).await
                } else {
                    Ack::new(signal, AckStatus::Ok, "WAITING_EDGE")
                }
            }
            Decision::CloseAndOpen => {
                let close_ack = self.close_real_position(signal, real_position).await;
                if close_ack.status == AckStatus::Error {
                    return close_ack;
                }
                if should_open {
                    self.open_position(signal, &config).await
                } else {
                    Ack::new(signal, AckStatus::Ok, "CLOSED_WAITING_EDGE")
                }
            }
        }
    }

    async fn open_position(&self, signal: &Signal, config: &SymbolConfig) -> Ack {
        let symbol = &signal.symbol;

        // Lot mapping.
        let volume = config.lot_for_intensity(signal.intensity);
        if volume <= 0.0 {
            warn!(%symbol, intensity = signal.intensity, "zero lot for intensity");
            return Ack::new(signal, AckStatus::Skip, "ZERO_LOT");
        }

        // Risk gate — first failure wins.
        let account = self.connector.get_account().await;
        let risk_check = self.risk_guard.check_all(symbol, volume, &account, config);
        if !risk_check.passed {
            return Ack::new(signal, AckStatus::Skip, risk_check.reason);
        }

        // Audit comment.
        let initial = self.risk_guard.initial_balance;
        let dd_pct = if initial > 0.0 {
            (initial - account.equity) / initial * 100.0
        } else {
            0.0
        };
        let comment = comment::build(
            signal.regime_state,
            signal.action.index(),
            signal.intensity,
            account.balance,
            dd_pct,
            signal.virtual_pnl,
        );

        // Monetary SL/TP → absolute prices.
        let current_price = match self.current_price(symbol).await {
            Some(p) => p,
            None => {
                warn!(%symbol, "no current price — submitting without SL/TP");
                0.0
            }
        };
        let (sl_price, tp_price) = if current_price > 0.0 {
            let descriptor = self.connector.get_symbol_info(symbol).await;
            let pricing = SymbolPricing::resolve(symbol, descriptor.as_ref(), current_price);
            (
                price::usd_to_sl_price(signal.direction, config.sl_usd, volume, current_price, &pricing),
                price::usd_to_tp_price(signal.direction, config.tp_usd, volume, current_price, &pricing),
            )
        } else {
            (0.0, 0.0)
        };

        info!(
            %symbol,
            direction = signal.direction,
            volume,
            sl = sl_price,
            tp = tp_price,
            price = current_price,
            "opening position"
        );

        let result = self
            .connector
            .open_order(symbol, signal.direction, volume, sl_price, tp_price, &comment)
            .await;

        if result.success {
            info!(%symbol, action = %signal.action, volume, ticket = ?result.ticket, "opened");
            Ack::new(signal, AckStatus::Ok, "OPENED").with_ticket(result.ticket)
        } else {
            error!(%symbol, error = %result.error, "open failed");
            Ack::new(signal, AckStatus::Error, result.error)
        }
    }

    async fn close_real_position(&self, signal: &Signal, position: Option<Position>) -> Ack {
        let Some(position) = position else {
            return Ack::new(signal, AckStatus::Ok, "ALREADY_FLAT");
        };

        let result = self.connector.close_order(position.ticket).await;
        if result.success {
            self.risk_guard.record_trade_result(position.pnl);
            info!(
                symbol = %signal.symbol,
                ticket = position.ticket,
                pnl = format!("{:.2}", position.pnl),
                "closed"
            );
            Ack::new(signal, AckStatus::Ok, "CLOSED").with_ticket(Some(position.ticket))
        } else {
            error!(symbol = %signal.symbol, error = %result.error, "close failed");
            Ack::new(signal, AckStatus::Error, result.error)
        }
    }

    async fn current_price(&self, symbol: &str) -> Option<f64> {
        if let Some(price) = self.connector.get_price(symbol).await {
            if price > 0.0 {
                return Some(price);
            }
        }
        self.connector
            .get_position(symbol)
            .await
            .filter(|p| p.current_price > 0.0)
            .map(|p| p.current_price)
    }

    // -------------------------------------------------------------------------
    // Controls
    // -------------------------------------------------------------------------

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("executor paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("executor resumed");
    }

    /// Close one symbol's position, if any. Records the result into the
    /// circuit breaker like a signal-driven close.
    pub async fn close_position(&self, symbol: &str) -> bool {
        let Some(position) = self.connector.get_position(symbol).await else {
            return false;
        };
        let result = self.connector.close_order(position.ticket).await;
        if result.success {
            self.risk_guard.record_trade_result(position.pnl);
        }
        result.success
    }

    /// Close every open position. Returns how many closed.
    pub async fn close_all(&self) -> usize {
        let positions = self.connector.get_positions().await;
        let total = positions.len();
        let mut closed = 0;
        for position in positions {
            let result = self.connector.close_order(position.ticket).await;
            if result.success {
                self.risk_guard.record_trade_result(position.pnl);
                closed += 1;
            }
        }
        info!(closed, total, "close_all finished");
        closed
    }

    // -------------------------------------------------------------------------
    // Config surface
    // -------------------------------------------------------------------------

    pub fn has_config(&self, symbol: &str) -> bool {
        self.configs.read().symbols.contains_key(symbol)
    }

    pub fn get_symbol_config(&self, symbol: &str) -> Option<SymbolConfig> {
        self.configs.read().symbols.get(symbol).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.configs.read().symbols.keys().cloned().collect()
    }

    /// Create a default config for a freshly-loaded model and persist it.
    /// No-op when the symbol already has one.
    pub fn ensure_config(&self, symbol: &str, default_sl_usd: f64, default_tp_usd: f64) -> bool {
        {
            let mut configs = self.configs.write();
            if configs.symbols.contains_key(symbol) {
                return false;
            }
            configs.symbols.insert(
                symbol.to_string(),
                SymbolConfig {
                    sl_usd: default_sl_usd,
                    tp_usd: default_tp_usd,
                    ..Default::default()
                },
            );
        }
        self.sync_states
            .write()
            .insert(symbol.to_string(), SyncState::new());
        self.persist();
        info!(%symbol, sl = default_sl_usd, tp = default_tp_usd, "symbol config auto-created");
        true
    }

    /// Apply field updates from the control channel and persist. Returns
    /// the applied field names, or None when the symbol has no config.
    pub fn set_symbol_config(&self, symbol: &str, updates: &serde_json::Value) -> Option<Vec<String>> {
        let applied = {
            let mut configs = self.configs.write();
            let config = configs.symbols.get_mut(symbol)?;
            config.apply_updates(updates)
        };
        self.persist();
        info!(%symbol, ?applied, "symbol config updated");
        Some(applied)
    }

    /// Apply new default SL/TP to every configured symbol and persist.
    pub fn apply_default_sltp(&self, sl_usd: Option<f64>, tp_usd: Option<f64>) {
        {
            let mut configs = self.configs.write();
            for config in configs.symbols.values_mut() {
                if let Some(sl) = sl_usd {
                    config.sl_usd = sl;
                }
                if let Some(tp) = tp_usd {
                    config.tp_usd = tp;
                }
            }
        }
        self.persist();
    }

    fn persist(&self) {
        if let Err(e) = self.configs.read().save(&self.config_path) {
            error!(error = %e, "failed to persist symbol configs");
        }
    }

    /// State snapshot for the control channel.
    pub fn get_state(&self) -> serde_json::Value {
        let configs = self.configs.read();
        let states = self.sync_states.read();

        let symbols: serde_json::Map<String, serde_json::Value> = configs
            .symbols
            .iter()
            .map(|(symbol, config)| {
                let sync = states.get(symbol);
                (
                    symbol.clone(),
                    serde_json::json!({
                        "enabled": config.enabled,
                        "lots": [config.lot_weak, config.lot_moderate, config.lot_strong],
                        "sl_usd": config.sl_usd,
                        "tp_usd": config.tp_usd,
                        "max_spread_pips": config.max_spread_pips,
                        "waiting_sync": sync.map(|s| s.waiting_sync).unwrap_or(false),
                        "first_live": sync.map(|s| s.first_live).unwrap_or(true),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "paused": self.is_paused(),
            "consecutive_losses": self.risk_guard.consecutive_losses(),
            "symbols": symbols,
        })
    }
}
