// =============================================================================
// Orchestrator — wires every subsystem together and runs the show
// =============================================================================
//
// Bootstrap order matters:
//   1. persistence   2. predictor (scan models dir)   3. broker connect
//   4. executor      5. paper shadow                  6. hub channel
//   7. reconcile check (orphans)  8. warmup  9. session  10. background tasks
//
// Background loops:
//   pipeline   — closed bars → predictor → executor → paper → telemetry
//   heartbeat  — 1 s with open positions, 5 s flat, heavy analytics each 30 s
//   health     — every 30 s
//   retry      — drain persistence queue every 300 s
//   spread     — refresh the risk gate's spread cache every 30 s
//   hub        — reconnect the control channel every 15 s when down
//
// Bar processing is strictly serial: the pipeline task is the only
// consumer of the bar channel, so a symbol's next bar never overtakes the
// predictor → executor → paper chain of the previous one.
// =============================================================================

pub mod health;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::connector::ctrader::CTraderConnector;
use crate::connector::hub::{HubClient, HubCommand};
use crate::connector::mock::MockConnector;
use crate::connector::Connector;
use crate::executor::Executor;
use crate::paper::PaperTrader;
use crate::persistence::local::LocalStorage;
use crate::persistence::session::{SessionEndReason, SessionManager, SessionStats};
use crate::persistence::trade_log::TradeLogger;
use crate::persistence::StoreClient;
use crate::predictor::Predictor;
use crate::types::{Bar, Timeframe};
use health::HealthMonitor;

pub struct Orchestrator {
    me: Weak<Orchestrator>,
    config: Mutex<AppConfig>,
    config_path: PathBuf,

    connector: Arc<dyn Connector>,
    predictor: Mutex<Predictor>,
    executor: Arc<Executor>,
    paper: Mutex<PaperTrader>,
    store: Arc<StoreClient>,
    storage: LocalStorage,
    session: Arc<SessionManager>,
    trade_logger: Arc<TradeLogger>,
    health: Arc<HealthMonitor>,
    hub: Option<Arc<HubClient>>,

    bar_tx: mpsc::Sender<Bar>,
    bar_rx: Mutex<Option<mpsc::Receiver<Bar>>>,
    command_rx: Mutex<Option<mpsc::Receiver<HubCommand>>>,

    running: AtomicBool,
    dry_run: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(config: AppConfig, config_path: PathBuf, dry_run: bool) -> Result<Arc<Self>> {
        Self::with_base_dir(config, config_path, dry_run, std::env::current_dir()?)
    }

    /// Build against an explicit working directory (session snapshot,
    /// pending uploads and bar cache live there).
    pub fn with_base_dir(
        config: AppConfig,
        config_path: PathBuf,
        dry_run: bool,
        base_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let connector: Arc<dyn Connector> =
            if config.broker.broker_type.eq_ignore_ascii_case("ctrader") {
                CTraderConnector::new(&config.broker)
            } else {
                info!(broker_type = %config.broker.broker_type, "using mock connector");
                MockConnector::new(config.initial_balance)
            };
        let executor = Arc::new(Executor::new(connector.clone(), &config.executor.config_file)?);

        let store = Arc::new(StoreClient::new(
            config.supabase_url.clone(),
            config.supabase_key.clone(),
            config.persistence.enabled,
            &base_dir,
        ));
        let session = Arc::new(SessionManager::new(store.clone(), &base_dir));
        let storage = LocalStorage::new(&base_dir);
        let trade_logger = Arc::new(TradeLogger::new(store.clone()));

        let (bar_tx, bar_rx) = mpsc::channel(1024);
        let (command_tx, command_rx) = mpsc::channel(64);

        let hub = if config.hub.enabled {
            Some(HubClient::new(
                config.hub.url.clone(),
                config.hub.token.clone(),
                config.hub.instance_id.clone(),
                command_tx,
            ))
        } else {
            None
        };

        let predictor = Predictor::new(config.predictor.min_bars);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config: Mutex::new(config),
            config_path,
            connector,
            predictor: Mutex::new(predictor),
            executor,
            paper: Mutex::new(PaperTrader::new(0.0)), // rebuilt in start()
            store,
            storage,
            session,
            trade_logger,
            health: Arc::new(HealthMonitor::new()),
            hub,
            bar_tx,
            bar_rx: Mutex::new(Some(bar_rx)),
            command_rx: Mutex::new(Some(command_rx)),
            running: AtomicBool::new(false),
            dry_run,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("orchestrator outlives its methods")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    pub async fn start(&self) -> Result<()> {
        info!("============================================================");
        info!("  BOREALIS TRADER v{}", crate::types::VERSION);
        info!("============================================================");

        let (models_dir, warmup_bars, initial_balance) = {
            let config = self.config.lock();
            (
                config.predictor.models_dir.clone(),
                config.predictor.warmup_bars,
                config.initial_balance,
            )
        };

        // Predictor: scan the models directory.
        let loaded = self.scan_models(&models_dir);
        info!(models = loaded.len(), "predictor initialised");

        // Broker.
        self.connector
            .connect()
            .await
            .context("broker connection failed")?;
        info!("connector ready");

        // Executor: auto-create configs for loaded models.
        {
            let config = self.config.lock();
            for symbol in &loaded {
                if self.executor.ensure_config(
                    symbol,
                    config.executor.default_sl_usd,
                    config.executor.default_tp_usd,
                ) {
                    info!(%symbol, "auto-created executor config");
                }
            }
        }
        if self.dry_run {
            warn!("dry-run mode — executor starts paused, no orders will be sent");
            self.executor.pause();
        }
        info!("executor ready");

        // Paper shadow seeded with each model's training parameters.
        {
            let mut paper = PaperTrader::new(initial_balance);
            let predictor = self.predictor.lock();
            for symbol in &loaded {
                if let Some(training) = predictor.training_config(symbol) {
                    paper.load_config(symbol, training);
                }
            }
            *self.paper.lock() = paper;
        }
        info!("paper shadow ready");

        // Hub.
        if let Some(hub) = &self.hub {
            if hub.connect().await {
                info!("hub channel ready");
            } else {
                warn!("hub connection failed — reconnect loop will retry");
            }
        }

        // Reconcile check: positions without a model are orphans.
        for position in self.connector.get_positions().await {
            if loaded.contains(&position.symbol) {
                info!(
                    symbol = %position.symbol,
                    direction = position.direction,
                    volume = position.volume,
                    open_price = position.open_price,
                    "existing position"
                );
            } else {
                warn!(symbol = %position.symbol, ticket = position.ticket, "orphan position (no model)");
            }
        }

        // Warmup.
        for symbol in &loaded {
            if let Err(e) = self.warmup_symbol(symbol, warmup_bars).await {
                error!(%symbol, error = %e, "warmup failed");
            }
        }
        info!("warmup complete");

        // Session.
        let session_id = self.session.start_session(initial_balance, &loaded).await;
        self.trade_logger.set_session_id(&session_id);
        info!(%session_id, "session started");

        // Subscriptions + background loops.
        self.running.store(true, Ordering::SeqCst);
        self.subscribe_all(&loaded).await;
        self.spawn_tasks();

        info!("============================================================");
        info!("  system READY");
        info!("============================================================");
        Ok(())
    }

    fn scan_models(&self, models_dir: &str) -> Vec<String> {
        let mut loaded = Vec::new();
        let Ok(entries) = std::fs::read_dir(models_dir) else {
            warn!(models_dir, "models directory missing");
            return loaded;
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "zip").unwrap_or(false))
            .collect();
        paths.sort();

        let mut predictor = self.predictor.lock();
        for path in paths {
            match predictor.load_model(&path) {
                Ok(symbol) => loaded.push(symbol),
                Err(e) => error!(path = %path.display(), error = %e, "model load failed"),
            }
        }
        loaded
    }

    async fn warmup_symbol(&self, symbol: &str, warmup_bars: usize) -> Result<()> {
        let timeframe = self
            .predictor
            .lock()
            .timeframe(symbol)
            .unwrap_or(Timeframe::M15);

        let bars = match self
            .connector
            .get_history(symbol, timeframe, warmup_bars)
            .await
        {
            Ok(bars) => {
                self.storage.cache_bars(symbol, &bars);
                bars
            }
            Err(e) => {
                let cached = self.storage.load_cached_bars(symbol);
                if cached.is_empty() {
                    return Err(e.into());
                }
                warn!(%symbol, error = %e, cached = cached.len(), "history fetch failed — warming up from cache");
                cached
            }
        };

        let predicted = self.predictor.lock().warmup(symbol, &bars);
        info!(%symbol, bars = bars.len(), predicted, %timeframe, "warmed up");
        Ok(())
    }

    async fn subscribe_all(&self, symbols: &[String]) {
        for symbol in symbols {
            let timeframe = self
                .predictor
                .lock()
                .timeframe(symbol)
                .unwrap_or(Timeframe::M15);
            if let Err(e) = self
                .connector
                .subscribe_bars(std::slice::from_ref(symbol), timeframe, self.bar_tx.clone())
                .await
            {
                error!(%symbol, error = %e, "subscription failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Background tasks
    // -------------------------------------------------------------------------

    fn spawn_tasks(&self) {
        let mut tasks = self.tasks.lock();

        // Main pipeline.
        if let Some(mut bar_rx) = self.bar_rx.lock().take() {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                while let Some(bar) = bar_rx.recv().await {
                    if !orch.is_running() {
                        break;
                    }
                    orch.process_bar(bar).await;
                }
            }));
        }

        // Control channel.
        if let Some(mut command_rx) = self.command_rx.lock().take() {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    orch.dispatch_command(command).await;
                }
            }));
        }

        // Heartbeat / telemetry.
        {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                orch.heartbeat_loop().await;
            }));
        }

        // Health + broker reconnect.
        {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                interval.tick().await;
                while orch.is_running() {
                    interval.tick().await;
                    let uptime = orch
                        .session
                        .start_time()
                        .map(|t| (chrono::Utc::now() - t).num_seconds() as f64)
                        .unwrap_or(0.0);
                    let report = orch.health.check(
                        orch.connector.is_connected(),
                        orch.store.pending_count(),
                        uptime,
                    );
                    if !report.healthy {
                        warn!(issues = ?report.issues, "health degraded");
                    }

                    if !orch.connector.is_connected() {
                        info!("broker down — attempting reconnect");
                        match orch.connector.connect().await {
                            Ok(()) => {
                                let symbols = orch.predictor.lock().list_models();
                                orch.subscribe_all(&symbols).await;
                                info!("broker reconnected and resubscribed");
                            }
                            Err(e) => warn!(error = %e, "broker reconnect failed"),
                        }
                    }
                }
            }));
        }

        // Persistence retry.
        {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(300));
                interval.tick().await;
                while orch.is_running() {
                    interval.tick().await;
                    orch.store.retry_pending().await;
                }
            }));
        }

        // Spread refresh.
        {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                interval.tick().await;
                while orch.is_running() {
                    interval.tick().await;
                    orch.refresh_spreads().await;
                }
            }));
        }

        // Hub reconnect.
        if self.hub.is_some() {
            let orch = self.arc();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(15));
                interval.tick().await;
                while orch.is_running() {
                    interval.tick().await;
                    if let Some(hub) = &orch.hub {
                        if !hub.is_connected() {
                            info!("reconnecting to hub");
                            hub.connect().await;
                        }
                    }
                }
            }));
        }
    }

    // -------------------------------------------------------------------------
    // Pipeline
    // -------------------------------------------------------------------------

    async fn process_bar(&self, bar: Bar) {
        let symbol = bar.symbol.clone();

        if !self.predictor.lock().has_model(&symbol) {
            return;
        }

        // 1. Predictor — None while the ring is still filling.
        let signal = self.predictor.lock().process_bar(&symbol, &bar);
        let Some(signal) = signal else {
            self.health.update(&symbol);
            return;
        };

        // 2. Executor (real side).
        let ack = self.executor.process_signal(&signal).await;

        // 3. Paper shadow.
        let paper_trade = self.paper.lock().process_signal(&signal, &bar);
        if let Some(trade) = &paper_trade {
            self.trade_logger.log_paper_trade(trade).await;
        }

        // 4. Result log.
        let mut log_line = format!(
            "[{symbol}] {} | state:{} | vpnl:${:.2} | exec:{}",
            signal.action, signal.regime_state, signal.virtual_pnl, ack.status
        );
        if !ack.reason.is_empty() {
            log_line.push_str(&format!("({})", ack.reason));
        }
        if let Some(ticket) = ack.ticket {
            log_line.push_str(&format!(" ticket={ticket}"));
        }
        info!("{log_line}");

        // 5. Health + telemetry.
        self.health.update(&symbol);

        if let Some(hub) = &self.hub {
            if hub.is_connected() {
                hub.send_signal(serde_json::json!({
                    "symbol": symbol,
                    "action": signal.action.to_string(),
                    "direction": signal.direction,
                    "intensity": signal.intensity,
                    "hmm_state": signal.regime_state,
                    "virtual_pnl": (signal.virtual_pnl * 100.0).round() / 100.0,
                    "exec_status": ack.status.to_string(),
                    "exec_reason": ack.reason,
                    "timestamp": signal.timestamp,
                }))
                .await;
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        const ANALYTICS_INTERVAL: Duration = Duration::from_secs(30);
        let mut last_analytics = std::time::Instant::now() - ANALYTICS_INTERVAL;

        while self.is_running() {
            let positions = self.connector.get_positions().await;
            let account = self.connector.get_account().await;

            self.session.update_heartbeat(account.balance);

            if self.session.check_day_boundary() {
                info!("UTC day boundary crossed");
                self.handle_day_change().await;
            }

            if let Some(hub) = &self.hub {
                if hub.is_connected() {
                    let include_analytics = last_analytics.elapsed() >= ANALYTICS_INTERVAL;
                    let telemetry = self.build_telemetry(include_analytics).await;
                    hub.send_telemetry(telemetry).await;
                    if include_analytics {
                        last_analytics = std::time::Instant::now();
                    }
                }
            }

            // Dense updates only while something is at risk.
            let interval = if positions.is_empty() { 5 } else { 1 };
            tokio::time::sleep(Duration::from_secs(interval)).await;
        }
    }

    async fn handle_day_change(&self) {
        let close_on_day_change = self.config.lock().close_on_day_change;
        if !close_on_day_change {
            return;
        }

        self.executor.close_all().await;
        let stats = self.session_stats().await;
        self.session
            .end_session(&stats, SessionEndReason::DayChange)
            .await;

        let account = self.connector.get_account().await;
        let symbols = self.predictor.lock().list_models();
        let session_id = self.session.start_session(account.balance, &symbols).await;
        self.trade_logger.set_session_id(&session_id);
        info!(%session_id, "new session after day change");
    }

    async fn refresh_spreads(&self) {
        let symbols = self.predictor.lock().list_models();
        for symbol in symbols {
            let Some(descriptor) = self.connector.get_symbol_info(&symbol).await else {
                continue;
            };
            let Some(spread_points) = descriptor.spread_points else {
                continue;
            };
            // One pip is ten points; 3-digit pairs scale accordingly.
            let factor = if descriptor.digits == 3 { 100.0 } else { 10_000.0 };
            let spread_pips = spread_points * descriptor.point * factor;
            self.executor
                .risk_guard()
                .update_spread(&symbol, spread_pips);
        }
    }

    async fn build_telemetry(&self, include_analytics: bool) -> serde_json::Value {
        let account = self.connector.get_account().await;
        let positions = self.connector.get_positions().await;
        let floating: f64 = positions.iter().map(|p| p.pnl).sum();

        let mut telemetry = serde_json::json!({
            "balance": account.balance,
            "equity": account.equity,
            "floating_pnl": floating,
            "status": if self.is_running() { "RUNNING" } else { "STOPPED" },
            "open_positions": positions.iter().map(|p| serde_json::json!({
                "symbol": p.symbol,
                "direction": p.direction,
                "volume": p.volume,
                "pnl": p.pnl,
                "open_price": p.open_price,
                "current_price": p.current_price,
            })).collect::<Vec<_>>(),
            "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        });

        let bars_per_year = {
            let predictor = self.predictor.lock();
            predictor
                .list_models()
                .first()
                .and_then(|s| predictor.timeframe(s))
                .unwrap_or(Timeframe::M15)
                .bars_per_year()
        };
        let (metrics, analytics) = {
            let paper = self.paper.lock();
            let analytics = include_analytics.then(|| paper.get_analytics(bars_per_year));
            (paper.get_metrics(), analytics)
        };

        telemetry["net_profit"] = metrics["total_pnl"].clone();
        telemetry["win_rate"] = metrics["win_rate"].clone();
        telemetry["total_trades"] = metrics["total_trades"].clone();

        if let Some(analytics) = analytics {
            if let (Some(dst), Some(src)) = (telemetry.as_object_mut(), analytics.as_object()) {
                for (key, value) in src {
                    dst.insert(key.clone(), value.clone());
                }
            }
        }

        telemetry
    }

    async fn session_stats(&self) -> SessionStats {
        let account = self.connector.get_account().await;
        let metrics = self.paper.lock().get_metrics();
        SessionStats {
            balance: account.balance,
            total_trades: metrics["total_trades"].as_u64().unwrap_or(0) as usize,
            total_pnl: metrics["total_pnl"].as_f64().unwrap_or(0.0),
        }
    }

    // -------------------------------------------------------------------------
    // Control commands
    // -------------------------------------------------------------------------

    async fn dispatch_command(&self, command: HubCommand) {
        let result = self.handle_command(&command.action, &command.params).await;
        if let Some(hub) = &self.hub {
            let status = if result.get("error").is_some() {
                "error"
            } else {
                "success"
            };
            hub.send_ack(&command.id, status, result).await;
        }
    }

    pub async fn handle_command(
        &self,
        action: &str,
        params: &serde_json::Value,
    ) -> serde_json::Value {
        info!(%action, "control command");

        match action {
            "pause" => {
                self.executor.pause();
                serde_json::json!({ "message": "paused" })
            }
            "resume" => {
                self.executor.resume();
                serde_json::json!({ "message": "resumed" })
            }
            "close_all" => {
                let closed = self.executor.close_all().await;
                serde_json::json!({ "closed": closed })
            }
            "close_position" => {
                let Some(symbol) = params.get("symbol").and_then(|v| v.as_str()) else {
                    return serde_json::json!({ "error": "symbol required" });
                };
                let result = self.executor.close_position(symbol).await;
                serde_json::json!({ "symbol": symbol, "result": result })
            }
            "status" => {
                let uptime = self
                    .session
                    .start_time()
                    .map(|t| (chrono::Utc::now() - t).num_seconds() as f64)
                    .unwrap_or(0.0);
                let report = self.health.check(
                    self.connector.is_connected(),
                    self.store.pending_count(),
                    uptime,
                );
                serde_json::to_value(report).unwrap_or_default()
            }
            "get_state" => {
                let telemetry = self.build_telemetry(true).await;
                let mut state = serde_json::json!({
                    "running": self.is_running(),
                    "preditor": self.predictor.lock().get_state(),
                    "executor": self.executor.get_state(),
                    "paper": self.paper.lock().get_metrics(),
                });
                if let (Some(dst), Some(src)) = (state.as_object_mut(), telemetry.as_object()) {
                    for (key, value) in src {
                        dst.insert(key.clone(), value.clone());
                    }
                }
                state
            }
            "list_models" => {
                serde_json::json!({ "models": self.predictor.lock().list_models() })
            }
            "get_available_models" => {
                let models_dir = self.config.lock().predictor.models_dir.clone();
                let available: Vec<String> = std::fs::read_dir(&models_dir)
                    .map(|entries| {
                        entries
                            .filter_map(|e| e.ok())
                            .map(|e| e.path())
                            .filter(|p| p.extension().map(|x| x == "zip").unwrap_or(false))
                            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                serde_json::json!({ "available": available })
            }
            "load_model" => self.cmd_load_model(params).await,
            "unload_model" => {
                let Some(symbol) = params.get("symbol").and_then(|v| v.as_str()) else {
                    return serde_json::json!({ "success": false, "error": "symbol required" });
                };
                let ok = self.predictor.lock().unload_model(symbol);
                if ok {
                    self.connector.unsubscribe_bars(&[symbol.to_string()]).await;
                    self.paper.lock().unload(symbol);
                    self.health.reset_symbol(symbol);
                }
                serde_json::json!({ "success": ok })
            }
            "get_symbol_config" => self.cmd_get_symbol_config(params),
            "set_symbol_config" => self.cmd_set_symbol_config(params),
            "get_general_config" => self.cmd_get_general_config(),
            "set_general_config" => self.cmd_set_general_config(params),
            other => serde_json::json!({ "error": format!("unknown: {other}") }),
        }
    }

    async fn cmd_load_model(&self, params: &serde_json::Value) -> serde_json::Value {
        let Some(path) = params.get("path").and_then(|v| v.as_str()) else {
            return serde_json::json!({ "success": false, "error": "path required" });
        };

        let symbol = match self.predictor.lock().load_model(path) {
            Ok(symbol) => symbol,
            Err(e) => {
                return serde_json::json!({ "success": false, "error": e.to_string() });
            }
        };

        // 1. Executor config.
        {
            let config = self.config.lock();
            self.executor.ensure_config(
                &symbol,
                config.executor.default_sl_usd,
                config.executor.default_tp_usd,
            );
        }

        // 2. Paper account.
        let training = self.predictor.lock().training_config(&symbol).cloned();
        if let Some(training) = training {
            self.paper.lock().load_config(&symbol, &training);
        }

        // 3. Warmup.
        let warmup_bars = self.config.lock().predictor.warmup_bars;
        if let Err(e) = self.warmup_symbol(&symbol, warmup_bars).await {
            error!(%symbol, error = %e, "warmup after load failed");
        }

        // 4. Subscribe.
        self.subscribe_all(std::slice::from_ref(&symbol)).await;

        // 5. Health.
        self.health.update(&symbol);

        serde_json::json!({ "success": true, "symbol": symbol })
    }

    fn cmd_get_symbol_config(&self, params: &serde_json::Value) -> serde_json::Value {
        let Some(symbol) = params.get("symbol").and_then(|v| v.as_str()) else {
            return serde_json::json!({ "error": "symbol required" });
        };

        // Auto-create when the model exists but the config is missing.
        if !self.executor.has_config(symbol) {
            if self.predictor.lock().has_model(symbol) {
                let config = self.config.lock();
                self.executor.ensure_config(
                    symbol,
                    config.executor.default_sl_usd,
                    config.executor.default_tp_usd,
                );
            } else {
                return serde_json::json!({ "error": format!("config not found: {symbol}") });
            }
        }

        match self.executor.get_symbol_config(symbol) {
            Some(config) => serde_json::json!({
                "symbol": symbol,
                "config": {
                    "enabled": config.enabled,
                    "lot_weak": config.lot_weak,
                    "lot_moderate": config.lot_moderate,
                    "lot_strong": config.lot_strong,
                    "sl_usd": config.sl_usd,
                    "tp_usd": config.tp_usd,
                    "max_spread_pips": config.max_spread_pips,
                }
            }),
            None => serde_json::json!({ "error": format!("config not found: {symbol}") }),
        }
    }

    fn cmd_set_symbol_config(&self, params: &serde_json::Value) -> serde_json::Value {
        let Some(symbol) = params.get("symbol").and_then(|v| v.as_str()) else {
            return serde_json::json!({ "success": false, "error": "symbol required" });
        };
        let updates = params
            .get("config")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        if !self.executor.has_config(symbol) {
            if self.predictor.lock().has_model(symbol) {
                let config = self.config.lock();
                self.executor.ensure_config(
                    symbol,
                    config.executor.default_sl_usd,
                    config.executor.default_tp_usd,
                );
            } else {
                return serde_json::json!({
                    "success": false,
                    "error": format!("symbol not found: {symbol}")
                });
            }
        }

        match self.executor.set_symbol_config(symbol, &updates) {
            Some(applied) => serde_json::json!({
                "success": true,
                "symbol": symbol,
                "applied": applied,
            }),
            None => serde_json::json!({
                "success": false,
                "error": format!("symbol not found: {symbol}")
            }),
        }
    }

    fn cmd_get_general_config(&self) -> serde_json::Value {
        let config = self.config.lock();
        serde_json::json!({
            "broker_type": config.broker.broker_type,
            "broker_env": config.broker.environment,
            "timeframe": config.timeframe,
            "initial_balance": config.initial_balance,
            "warmup_bars": config.predictor.warmup_bars,
            "persistence_enabled": config.persistence.enabled,
            "hub_connected": self.hub.as_ref().map(|h| h.is_connected()).unwrap_or(false),
            "models_dir": config.predictor.models_dir,
            "close_on_exit": config.close_on_exit,
            "close_on_day_change": config.close_on_day_change,
            "default_sl_usd": config.executor.default_sl_usd,
            "default_tp_usd": config.executor.default_tp_usd,
        })
    }

    fn cmd_set_general_config(&self, params: &serde_json::Value) -> serde_json::Value {
        let mut updated = serde_json::Map::new();

        {
            let mut config = self.config.lock();

            if let Some(v) = params.get("close_on_exit").and_then(|v| v.as_bool()) {
                config.close_on_exit = v;
                updated.insert("close_on_exit".into(), v.into());
            }
            if let Some(v) = params.get("close_on_day_change").and_then(|v| v.as_bool()) {
                config.close_on_day_change = v;
                updated.insert("close_on_day_change".into(), v.into());
            }
            if let Some(v) = params.get("default_sl_usd").and_then(|v| v.as_f64()) {
                config.executor.default_sl_usd = v;
                updated.insert("default_sl_usd".into(), v.into());
            }
            if let Some(v) = params.get("default_tp_usd").and_then(|v| v.as_f64()) {
                config.executor.default_tp_usd = v;
                updated.insert("default_tp_usd".into(), v.into());
            }
        }

        // Propagate new SL/TP defaults to every configured symbol.
        let sl = updated.get("default_sl_usd").and_then(|v| v.as_f64());
        let tp = updated.get("default_tp_usd").and_then(|v| v.as_f64());
        if sl.is_some() || tp.is_some() {
            self.executor.apply_default_sltp(sl, tp);
        }

        if !updated.is_empty() {
            let config = self.config.lock();
            if let Err(e) = config.save(&self.config_path) {
                error!(error = %e, "failed to persist general config");
            }
            info!(?updated, "general config updated");
        }

        serde_json::json!({ "success": true, "updated": updated })
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    pub async fn stop(&self, reason: SessionEndReason) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let close_on_exit = self.config.lock().close_on_exit;
        if close_on_exit {
            let closed = self.executor.close_all().await;
            info!(closed, "positions closed on exit");
        }

        let stats = self.session_stats().await;
        self.session.end_session(&stats, reason).await;

        self.connector.disconnect().await;
        if let Some(hub) = &self.hub {
            hub.disconnect().await;
        }

        info!("shutdown complete");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::model::tests::{metadata, policy_blob, regime_blob, write_bundle};
    use crate::types::Bar;

    const MIN_BARS: usize = 30;

    /// Orchestrator over the mock broker with one EURUSD model whose
    /// policy always prefers `bias_action`.
    fn build(dir: &std::path::Path, bias_action: usize) -> Arc<Orchestrator> {
        let models_dir = dir.join("models");
        std::fs::create_dir_all(&models_dir).unwrap();

        let n_states = 5;
        let mut meta = metadata("EURUSD", "M15", n_states);
        meta["preditor"] = serde_json::json!({ "min_bars": MIN_BARS });
        write_bundle(
            &models_dir,
            "EURUSD",
            "M15",
            &meta,
            &regime_blob(n_states),
            &policy_blob(6 + n_states + 3, bias_action),
        );

        let executor_file = dir.join("executor_symbols.json");
        std::fs::write(
            &executor_file,
            r#"{
                "_risk": { "dd_limit_pct": 5.0, "dd_emergency_pct": 10.0,
                           "initial_balance": 10000, "max_consecutive_losses": 5 },
                "EURUSD": { "enabled": true, "sl_usd": 10.0, "tp_usd": 0.0 }
            }"#,
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.broker.broker_type = "mock".to_string();
        config.predictor.models_dir = models_dir.to_string_lossy().to_string();
        config.predictor.min_bars = MIN_BARS;
        config.predictor.warmup_bars = MIN_BARS * 2;
        config.executor.config_file = executor_file.to_string_lossy().to_string();

        Orchestrator::with_base_dir(
            config,
            dir.join("default.yaml"),
            false,
            dir.to_path_buf(),
        )
        .unwrap()
    }

    fn live_bar(index: usize, close: f64) -> Bar {
        let time = 1_700_000_000i64 / 900 * 900 + index as i64 * 900;
        Bar {
            symbol: "EURUSD".into(),
            time,
            open: close,
            high: close + 0.0005,
            low: close - 0.0005,
            close,
            volume: 100.0,
        }
    }

    #[tokio::test]
    async fn warmup_then_first_live_bar_opens_a_real_position() {
        let dir = tempfile::tempdir().unwrap();
        let orch = build(dir.path(), 1); // LONG_WEAK bias

        let models_dir = orch.config.lock().predictor.models_dir.clone();
        let loaded = orch.scan_models(&models_dir);
        assert_eq!(loaded, vec!["EURUSD".to_string()]);

        orch.connector.connect().await.unwrap();

        // Seed the paper shadow the way start() does.
        let training = orch
            .predictor
            .lock()
            .training_config("EURUSD")
            .cloned()
            .unwrap();
        orch.paper.lock().load_config("EURUSD", &training);

        orch.warmup_symbol("EURUSD", MIN_BARS * 2).await.unwrap();

        // First live bar: long signal, edge passes, mock fills the order.
        orch.process_bar(live_bar(0, 1.10000)).await;

        let position = orch.connector.get_position("EURUSD").await.unwrap();
        assert_eq!(position.direction, 1);
        assert!((position.volume - 0.01).abs() < 1e-9);
        assert!(position.sl > 0.0, "risk budget mapped to an absolute stop");
        assert!(position.sl < position.open_price);
    }

    #[tokio::test]
    async fn repeated_signal_does_not_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let orch = build(dir.path(), 1);

        let models_dir = orch.config.lock().predictor.models_dir.clone();
        orch.scan_models(&models_dir);
        orch.connector.connect().await.unwrap();
        orch.warmup_symbol("EURUSD", MIN_BARS * 2).await.unwrap();

        orch.process_bar(live_bar(0, 1.10000)).await;
        let first = orch.connector.get_position("EURUSD").await.unwrap();

        // Same long signal again: NOOP cell of the decision table.
        orch.process_bar(live_bar(1, 1.10010)).await;
        let second = orch.connector.get_position("EURUSD").await.unwrap();
        assert_eq!(first.ticket, second.ticket);
    }

    #[tokio::test]
    async fn wait_bias_never_trades() {
        let dir = tempfile::tempdir().unwrap();
        let orch = build(dir.path(), 0); // WAIT bias

        let models_dir = orch.config.lock().predictor.models_dir.clone();
        orch.scan_models(&models_dir);
        orch.connector.connect().await.unwrap();
        orch.warmup_symbol("EURUSD", MIN_BARS * 2).await.unwrap();

        orch.process_bar(live_bar(0, 1.10000)).await;
        assert!(orch.connector.get_positions().await.is_empty());
    }

    #[tokio::test]
    async fn control_commands_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let orch = build(dir.path(), 1);
        let models_dir = orch.config.lock().predictor.models_dir.clone();
        orch.scan_models(&models_dir);

        let models = orch.handle_command("list_models", &serde_json::Value::Null).await;
        assert_eq!(models["models"][0], "EURUSD");

        let available = orch
            .handle_command("get_available_models", &serde_json::Value::Null)
            .await;
        assert_eq!(available["available"][0], "EURUSD_M15.zip");

        orch.handle_command("pause", &serde_json::Value::Null).await;
        assert!(orch.executor.is_paused());
        orch.handle_command("resume", &serde_json::Value::Null).await;
        assert!(!orch.executor.is_paused());

        let set = orch
            .handle_command(
                "set_symbol_config",
                &serde_json::json!({ "symbol": "EURUSD", "config": { "sl_usd": 17.5 } }),
            )
            .await;
        assert_eq!(set["success"], true);

        let get = orch
            .handle_command(
                "get_symbol_config",
                &serde_json::json!({ "symbol": "EURUSD" }),
            )
            .await;
        assert_eq!(get["config"]["sl_usd"], 17.5);

        let unknown = orch.handle_command("bogus", &serde_json::Value::Null).await;
        assert!(unknown.get("error").is_some());
    }

    #[tokio::test]
    async fn unload_model_clears_symbol_state() {
        let dir = tempfile::tempdir().unwrap();
        let orch = build(dir.path(), 1);
        let models_dir = orch.config.lock().predictor.models_dir.clone();
        orch.scan_models(&models_dir);
        orch.connector.connect().await.unwrap();

        let result = orch
            .handle_command("unload_model", &serde_json::json!({ "symbol": "EURUSD" }))
            .await;
        assert_eq!(result["success"], true);
        assert!(orch.predictor.lock().list_models().is_empty());

        // A bar for the unloaded symbol is ignored.
        orch.process_bar(live_bar(0, 1.1)).await;
        assert!(orch.connector.get_positions().await.is_empty());
    }
}
