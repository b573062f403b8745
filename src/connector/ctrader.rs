// =============================================================================
// cTrader adapter — domain semantics over the raw broker client
// =============================================================================
//
// Runs the boot protocol (app auth → account auth → symbols → details →
// trader → reconcile), owns the symbol registry and the position/account
// caches, decodes spot and execution events, and exposes the order
// surface. All event handling happens on a single dispatch task fed by the
// client's event channel, so cache mutation never races the transport.
//
// Scaling rules (never reinterpreted anywhere else):
//   prices     integer × 10^-digits
//   volumes    integer ÷ lot conversion factor (default 100 000)
//   balance    cents ÷ 100
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use prost::Message;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::connector::bar_detector::BarDetector;
use crate::connector::client::{BrokerClient, ClientEvent};
use crate::connector::proto::{self, payload_type};
use crate::connector::rate_limiter::RateLimiter;
use crate::connector::{Connector, DealRecord};
use crate::error::{ConnectorError, ConnectorResult};
use crate::types::{
    AccountInfo, Bar, OrderResult, OrderUpdate, Position, SymbolDescriptor, Timeframe,
};

const DEMO_HOST: &str = "demo.ctraderapi.com";
const LIVE_HOST: &str = "live.ctraderapi.com";
const PORT: u16 = 5035;

/// Symbol-detail fetches are chunked to stay within the API batch limit.
const DETAIL_CHUNK: usize = 100;
/// Default volume units per 1.0 lot when the broker omits it.
const DEFAULT_LOT_SIZE: f64 = 100_000.0;
/// Flat pip-value approximation used for floating PnL estimates.
const PIP_VALUE_ESTIMATE: f64 = 10.0;

#[derive(Default)]
struct AccountCache {
    balance: f64,
    equity: f64,
}

pub struct CTraderConnector {
    me: Weak<CTraderConnector>,
    account_id: i64,
    client_id: String,
    client_secret: String,
    access_token: String,

    client: Arc<BrokerClient>,
    bar_detector: Arc<BarDetector>,
    rate_limiter: RateLimiter,

    symbol_ids: RwLock<HashMap<String, i64>>,
    symbol_names: RwLock<HashMap<i64, String>>,
    descriptors: RwLock<HashMap<String, SymbolDescriptor>>,

    account: RwLock<AccountCache>,
    positions: RwLock<HashMap<i64, Position>>,
    quotes: RwLock<HashMap<String, (f64, f64)>>,

    connected: AtomicBool,
    event_wired: AtomicBool,
}

impl CTraderConnector {
    pub fn new(config: &BrokerConfig) -> Arc<Self> {
        let host = if config.environment.eq_ignore_ascii_case("live") {
            LIVE_HOST
        } else {
            DEMO_HOST
        };

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            account_id: config.account_id,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            access_token: config.access_token.clone(),
            client: BrokerClient::new(host, PORT),
            bar_detector: Arc::new(BarDetector::new()),
            rate_limiter: RateLimiter::new(50),
            symbol_ids: RwLock::new(HashMap::new()),
            symbol_names: RwLock::new(HashMap::new()),
            descriptors: RwLock::new(HashMap::new()),
            account: RwLock::new(AccountCache::default()),
            positions: RwLock::new(HashMap::new()),
            quotes: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            event_wired: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Boot protocol
    // -------------------------------------------------------------------------

    async fn authenticate(&self) -> ConnectorResult<()> {
        let app_req = proto::ApplicationAuthReq {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        };
        let (pt, payload) = self
            .request(&app_req, payload_type::APPLICATION_AUTH_REQ)
            .await?;
        self.check_error(pt, &payload, "application auth")
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;

        let acc_req = proto::AccountAuthReq {
            ctid_trader_account_id: self.account_id,
            access_token: self.access_token.clone(),
        };
        let (pt, payload) = self
            .request(&acc_req, payload_type::ACCOUNT_AUTH_REQ)
            .await?;
        self.check_error(pt, &payload, "account auth")
            .map_err(|e| ConnectorError::Authentication(e.to_string()))?;

        info!(account_id = self.account_id, "authenticated");
        Ok(())
    }

    async fn fetch_initial_data(&self) -> ConnectorResult<()> {
        // Symbols: names and ids.
        let req = proto::SymbolsListReq {
            ctid_trader_account_id: self.account_id,
        };
        let (pt, payload) = self.request(&req, payload_type::SYMBOLS_LIST_REQ).await?;
        self.check_error(pt, &payload, "symbols list")?;
        let res: proto::SymbolsListRes = proto::decode_payload(&payload)?;

        {
            let mut ids = self.symbol_ids.write();
            let mut names = self.symbol_names.write();
            for s in &res.symbol {
                ids.insert(s.symbol_name.clone(), s.symbol_id);
                names.insert(s.symbol_id, s.symbol_name.clone());
            }
        }
        info!(count = res.symbol.len(), "symbol registry loaded");

        // Symbol details in chunks.
        let all_ids: Vec<i64> = self.symbol_ids.read().values().copied().collect();
        for (i, chunk) in all_ids.chunks(DETAIL_CHUNK).enumerate() {
            match self.fetch_symbol_details(chunk).await {
                Ok(n) => debug!(batch = i + 1, count = n, "symbol details loaded"),
                Err(e) => warn!(batch = i + 1, error = %e, "symbol details batch failed"),
            }
        }

        // Trader info (balance).
        let req = proto::TraderReq {
            ctid_trader_account_id: self.account_id,
        };
        let (pt, payload) = self.request(&req, payload_type::TRADER_REQ).await?;
        self.check_error(pt, &payload, "trader info")?;
        self.handle_trader_res(&payload);

        // Reconcile open positions.
        let req = proto::ReconcileReq {
            ctid_trader_account_id: self.account_id,
        };
        let (pt, payload) = self.request(&req, payload_type::RECONCILE_REQ).await?;
        self.check_error(pt, &payload, "reconcile")?;
        self.handle_reconcile(&payload);

        Ok(())
    }

    async fn fetch_symbol_details(&self, ids: &[i64]) -> ConnectorResult<usize> {
        let req = proto::SymbolByIdReq {
            ctid_trader_account_id: self.account_id,
            symbol_id: ids.to_vec(),
        };
        let (pt, payload) = self.request(&req, payload_type::SYMBOL_BY_ID_REQ).await?;
        self.check_error(pt, &payload, "symbol details")?;
        let res: proto::SymbolByIdRes = proto::decode_payload(&payload)?;

        let names = self.symbol_names.read();
        let mut descriptors = self.descriptors.write();
        for s in &res.symbol {
            let Some(name) = names.get(&s.symbol_id) else {
                continue;
            };
            let digits = if s.digits > 0 { s.digits } else { 5 };
            descriptors.insert(
                name.clone(),
                SymbolDescriptor {
                    name: name.clone(),
                    id: s.symbol_id,
                    digits,
                    point: 10f64.powi(-digits),
                    lot_size: if s.lot_size > 0 {
                        s.lot_size as f64
                    } else {
                        DEFAULT_LOT_SIZE
                    },
                    min_volume: s.min_volume as f64 / 100.0,
                    max_volume: s.max_volume as f64 / 100.0,
                    step_volume: s.step_volume as f64 / 100.0,
                    spread_points: s.spread_points.map(|p| p as f64),
                    pip_value: None,
                },
            );
        }
        Ok(res.symbol.len())
    }

    // -------------------------------------------------------------------------
    // Event dispatch
    // -------------------------------------------------------------------------

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("adapter outlives its methods")
    }

    fn spawn_event_loop(&self, mut rx: mpsc::Receiver<ClientEvent>) {
        let adapter = self.arc();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ClientEvent::Message {
                        payload_type: pt,
                        payload,
                    } => adapter.on_message(pt, &payload).await,
                    ClientEvent::Disconnected { reason } => {
                        warn!(reason = %reason, "broker disconnected");
                        adapter.connected.store(false, Ordering::SeqCst);
                    }
                }
            }
        });
    }

    async fn on_message(&self, pt: u32, payload: &[u8]) {
        match pt {
            payload_type::SPOT_EVENT => self.handle_spot(payload).await,
            payload_type::EXECUTION_EVENT => self.handle_execution(payload),
            payload_type::TRADER_RES => self.handle_trader_res(payload),
            payload_type::RECONCILE_RES => self.handle_reconcile(payload),
            payload_type::ERROR_RES => {
                if let Ok(res) = proto::decode_payload::<proto::ErrorRes>(payload) {
                    error!(
                        code = %res.error_code,
                        description = %res.description.unwrap_or_default(),
                        "broker error event"
                    );
                }
            }
            other => debug!(payload_type = other, "unhandled broker event"),
        }
    }

    async fn handle_spot(&self, payload: &[u8]) {
        let Ok(spot) = proto::decode_payload::<proto::SpotEvent>(payload) else {
            return;
        };

        let Some(symbol) = self.symbol_names.read().get(&spot.symbol_id).cloned() else {
            return;
        };

        let digits = self
            .descriptors
            .read()
            .get(&symbol)
            .map(|d| d.digits)
            .unwrap_or(5);
        let divisor = 10f64.powi(digits);

        let bid = spot.bid.map(|b| b as f64 / divisor).unwrap_or(0.0);
        let ask = spot.ask.map(|a| a as f64 / divisor).unwrap_or(0.0);
        if bid <= 0.0 || ask <= 0.0 {
            return;
        }

        self.quotes.write().insert(symbol.clone(), (bid, ask));

        // Refresh floating PnL of cached positions and derived equity.
        let mid = (bid + ask) / 2.0;
        let point = 10f64.powi(-digits);
        let pip_size = point * 10.0;
        {
            let mut positions = self.positions.write();
            for pos in positions.values_mut() {
                if pos.symbol == symbol {
                    pos.current_price = mid;
                    let pips = (mid - pos.open_price) * pos.direction as f64 / pip_size;
                    pos.pnl = pips * PIP_VALUE_ESTIMATE * pos.volume;
                }
            }
            let floating: f64 = positions.values().map(|p| p.pnl).sum();
            let mut account = self.account.write();
            account.equity = account.balance + floating;
        }

        let tick_time = spot
            .timestamp
            .map(|ms| ms / 1000)
            .unwrap_or_else(|| Utc::now().timestamp());
        self.bar_detector
            .on_tick(&symbol, tick_time, bid, ask, 0.0)
            .await;
    }

    fn handle_execution(&self, payload: &[u8]) {
        let Ok(event) = proto::decode_payload::<proto::ExecutionEvent>(payload) else {
            return;
        };

        if let Some(p) = &event.position {
            let pid = p.position_id;

            if p.position_status == proto::POSITION_STATUS_CLOSED {
                if self.positions.write().remove(&pid).is_some() {
                    info!(ticket = pid, "position closed");
                }
            } else if let Some(td) = &p.trade_data {
                let symbol = self
                    .symbol_names
                    .read()
                    .get(&td.symbol_id)
                    .cloned()
                    .unwrap_or_else(|| td.symbol_id.to_string());
                let (digits, lot_size) = {
                    let descs = self.descriptors.read();
                    descs
                        .get(&symbol)
                        .map(|d| (d.digits, d.lot_size))
                        .unwrap_or((5, DEFAULT_LOT_SIZE))
                };
                let divisor = 10f64.powi(digits);

                let entry = p.price.map(|v| v as f64 / divisor).unwrap_or(0.0);
                let direction = if td.trade_side == proto::TRADE_SIDE_BUY {
                    1
                } else {
                    -1
                };
                let volume = td.volume as f64 / lot_size;

                let pos = Position {
                    ticket: pid,
                    symbol: symbol.clone(),
                    direction,
                    volume,
                    open_price: entry,
                    current_price: entry,
                    pnl: 0.0,
                    sl: p.stop_loss.map(|v| v as f64 / divisor).unwrap_or(0.0),
                    tp: p.take_profit.map(|v| v as f64 / divisor).unwrap_or(0.0),
                    open_time: td.open_timestamp.map(|ms| ms / 1000).unwrap_or(0),
                    comment: td.comment.clone().unwrap_or_default(),
                };
                self.positions.write().insert(pid, pos);
                info!(ticket = pid, %symbol, direction, volume, "position upserted");
            }
        }

        if let Some(order) = &event.order {
            let update = OrderUpdate {
                id: order.order_id.to_string(),
                status: if order.order_status == 1 {
                    "FILLED".to_string()
                } else {
                    "REJECTED".to_string()
                },
                filled_quantity: order.executed_volume.unwrap_or(0) as f64 / DEFAULT_LOT_SIZE,
                average_price: order.execution_price.unwrap_or(0.0),
            };
            debug!(id = %update.id, status = %update.status, qty = update.filled_quantity, "order update");
        }
    }

    fn handle_trader_res(&self, payload: &[u8]) {
        let Ok(res) = proto::decode_payload::<proto::TraderRes>(payload) else {
            return;
        };
        if let Some(trader) = res.trader {
            let balance = trader.balance as f64 / 100.0;
            let mut account = self.account.write();
            account.balance = balance;
            account.equity = balance;
            info!(balance, "balance updated");
        }
    }

    fn handle_reconcile(&self, payload: &[u8]) {
        let Ok(res) = proto::decode_payload::<proto::ReconcileRes>(payload) else {
            return;
        };

        let mut positions = self.positions.write();
        positions.clear();
        for p in &res.position {
            let Some(td) = &p.trade_data else { continue };
            let symbol = self
                .symbol_names
                .read()
                .get(&td.symbol_id)
                .cloned()
                .unwrap_or_else(|| td.symbol_id.to_string());
            let (digits, lot_size) = {
                let descs = self.descriptors.read();
                descs
                    .get(&symbol)
                    .map(|d| (d.digits, d.lot_size))
                    .unwrap_or((5, DEFAULT_LOT_SIZE))
            };
            let divisor = 10f64.powi(digits);
            let price = p.price.map(|v| v as f64 / divisor).unwrap_or(0.0);

            positions.insert(
                p.position_id,
                Position {
                    ticket: p.position_id,
                    symbol,
                    direction: if td.trade_side == proto::TRADE_SIDE_BUY {
                        1
                    } else {
                        -1
                    },
                    volume: td.volume as f64 / lot_size,
                    open_price: price,
                    current_price: price,
                    pnl: 0.0,
                    sl: p.stop_loss.map(|v| v as f64 / divisor).unwrap_or(0.0),
                    tp: p.take_profit.map(|v| v as f64 / divisor).unwrap_or(0.0),
                    open_time: td.open_timestamp.map(|ms| ms / 1000).unwrap_or(0),
                    comment: td.comment.clone().unwrap_or_default(),
                },
            );
        }
        info!(count = positions.len(), "positions reconciled");
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn request<M: Message>(
        &self,
        msg: &M,
        payload_type: u32,
    ) -> ConnectorResult<(u32, Vec<u8>)> {
        self.rate_limiter.acquire().await;
        self.client.send_request(msg, payload_type).await
    }

    /// Map an ERROR_RES reply into the connector taxonomy. Rejections are
    /// logged and surfaced to the caller; the connection stays up.
    fn check_error(&self, pt: u32, payload: &[u8], context: &str) -> ConnectorResult<()> {
        if pt != payload_type::ERROR_RES {
            return Ok(());
        }
        let res: proto::ErrorRes = proto::decode_payload(payload)?;
        let description = res.description.unwrap_or_default();
        error!(
            code = %res.error_code,
            %description,
            context,
            "broker rejected request"
        );
        Err(ConnectorError::Protocol(format!(
            "{context}: {} ({})",
            description, res.error_code
        )))
    }

    fn symbol_id(&self, symbol: &str) -> ConnectorResult<i64> {
        self.symbol_ids
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| ConnectorError::SymbolNotFound(symbol.to_string()))
    }

    fn lot_units(&self, symbol: &str, volume: f64) -> i64 {
        let lot_size = self
            .descriptors
            .read()
            .get(symbol)
            .map(|d| d.lot_size)
            .unwrap_or(DEFAULT_LOT_SIZE);
        (volume * lot_size).round() as i64
    }
}

#[async_trait]
impl Connector for CTraderConnector {
    /// Full connect sequence: transport, auth handshakes, initial data.
    /// Reusable after a connection loss; the event loop is wired once.
    async fn connect(&self) -> ConnectorResult<()> {
        if !self.event_wired.swap(true, Ordering::SeqCst) {
            let (tx, rx) = mpsc::channel(1024);
            self.client.set_event_channel(tx);
            self.spawn_event_loop(rx);
        }

        self.client.connect().await?;
        self.authenticate().await?;
        self.connected.store(true, Ordering::SeqCst);
        self.fetch_initial_data().await?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_connected()
    }

    async fn get_account(&self) -> AccountInfo {
        let account = self.account.read();
        AccountInfo {
            balance: account.balance,
            equity: account.equity,
            margin: 0.0,
            free_margin: account.equity,
            margin_level: 0.0,
            currency: "USD".to_string(),
        }
    }

    async fn get_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions
            .read()
            .values()
            .find(|p| p.symbol == symbol)
            .cloned()
    }

    async fn get_price(&self, symbol: &str) -> Option<f64> {
        self.quotes
            .read()
            .get(symbol)
            .map(|(bid, ask)| (bid + ask) / 2.0)
    }

    async fn subscribe_bars(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        bars: mpsc::Sender<Bar>,
    ) -> ConnectorResult<()> {
        let mut ids = Vec::new();
        for symbol in symbols {
            match self.symbol_ids.read().get(symbol) {
                Some(id) => {
                    ids.push(*id);
                    self.bar_detector.register(symbol, timeframe, bars.clone());
                }
                None => warn!(%symbol, "symbol not found — skipping subscription"),
            }
        }

        if ids.is_empty() {
            return Ok(());
        }

        let req = proto::SubscribeSpotsReq {
            ctid_trader_account_id: self.account_id,
            symbol_id: ids,
            subscribe_to_spot_timestamp: Some(true),
        };
        let (pt, payload) = self
            .request(&req, payload_type::SUBSCRIBE_SPOTS_REQ)
            .await?;
        self.check_error(pt, &payload, "subscribe spots")?;
        info!(?symbols, %timeframe, "subscribed to spots");
        Ok(())
    }

    async fn unsubscribe_bars(&self, symbols: &[String]) {
        for symbol in symbols {
            self.bar_detector.unregister(symbol);
        }
    }

    async fn open_order(
        &self,
        symbol: &str,
        direction: i32,
        volume: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> OrderResult {
        let sid = match self.symbol_id(symbol) {
            Ok(id) => id,
            Err(e) => return OrderResult::failed(e.to_string()),
        };

        let mut comment = comment.to_string();
        if comment.len() > 100 {
            let mut cut = 100;
            while !comment.is_char_boundary(cut) {
                cut -= 1;
            }
            comment.truncate(cut);
        }

        let req = proto::NewOrderReq {
            ctid_trader_account_id: self.account_id,
            symbol_id: sid,
            order_type: proto::ORDER_TYPE_MARKET,
            trade_side: if direction == 1 {
                proto::TRADE_SIDE_BUY
            } else {
                proto::TRADE_SIDE_SELL
            },
            volume: self.lot_units(symbol, volume),
            stop_loss: (sl > 0.0).then_some(sl),
            take_profit: (tp > 0.0).then_some(tp),
            comment: (!comment.is_empty()).then_some(comment),
        };

        // The response to a new-order request carries no fill; the
        // execution event stream is the ground truth for position state.
        match self.request(&req, payload_type::NEW_ORDER_REQ).await {
            Ok((pt, payload)) => match self.check_error(pt, &payload, "new order") {
                Ok(()) => OrderResult::ok(),
                Err(e) => OrderResult::failed(e.to_string()),
            },
            Err(e) => OrderResult::failed(e.to_string()),
        }
    }

    async fn close_order(&self, ticket: i64) -> OrderResult {
        let (symbol, volume) = match self.positions.read().get(&ticket) {
            Some(p) => (p.symbol.clone(), p.volume),
            None => return OrderResult::failed(format!("unknown ticket {ticket}")),
        };

        let req = proto::ClosePositionReq {
            ctid_trader_account_id: self.account_id,
            position_id: ticket,
            volume: self.lot_units(&symbol, volume),
        };

        match self.request(&req, payload_type::CLOSE_POSITION_REQ).await {
            Ok((pt, payload)) => match self.check_error(pt, &payload, "close position") {
                Ok(()) => OrderResult::ok_ticket(ticket),
                Err(e) => OrderResult::failed(e.to_string()),
            },
            Err(e) => OrderResult::failed(e.to_string()),
        }
    }

    async fn modify_order(&self, ticket: i64, sl: f64, tp: f64) -> OrderResult {
        let req = proto::AmendPositionSltpReq {
            ctid_trader_account_id: self.account_id,
            position_id: ticket,
            stop_loss: (sl > 0.0).then_some(sl),
            take_profit: (tp > 0.0).then_some(tp),
        };

        match self
            .request(&req, payload_type::AMEND_POSITION_SLTP_REQ)
            .await
        {
            Ok((pt, payload)) => match self.check_error(pt, &payload, "amend sltp") {
                Ok(()) => OrderResult::ok_ticket(ticket),
                Err(e) => OrderResult::failed(e.to_string()),
            },
            Err(e) => OrderResult::failed(e.to_string()),
        }
    }

    async fn get_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: usize,
    ) -> ConnectorResult<Vec<Bar>> {
        let sid = self.symbol_id(symbol)?;

        let to_ts = Utc::now().timestamp_millis();
        let from_ts = to_ts - (bars as i64 * timeframe.seconds() * 1000);

        let req = proto::GetTrendbarsReq {
            ctid_trader_account_id: self.account_id,
            from_timestamp: from_ts,
            to_timestamp: to_ts,
            period: timeframe.period_code(),
            symbol_id: sid,
        };
        let (pt, payload) = self.request(&req, payload_type::GET_TRENDBARS_REQ).await?;
        self.check_error(pt, &payload, "trendbars")?;
        let res: proto::GetTrendbarsRes = proto::decode_payload(&payload)?;

        let digits = self
            .descriptors
            .read()
            .get(symbol)
            .map(|d| d.digits)
            .unwrap_or(5);

        let mut result: Vec<Bar> = res
            .trendbar
            .iter()
            .map(|tb| decode_trendbar(symbol, tb, digits))
            .collect();
        result.sort_by_key(|b| b.time);

        info!(%symbol, %timeframe, count = result.len(), "history fetched");
        Ok(result)
    }

    async fn get_symbol_info(&self, symbol: &str) -> Option<SymbolDescriptor> {
        self.descriptors.read().get(symbol).cloned()
    }

    async fn get_order_history(&self, since: DateTime<Utc>) -> Vec<DealRecord> {
        let req = proto::DealListReq {
            ctid_trader_account_id: self.account_id,
            from_timestamp: since.timestamp_millis(),
            to_timestamp: Utc::now().timestamp_millis(),
            max_rows: None,
        };

        let (pt, payload) = match self.request(&req, payload_type::DEAL_LIST_REQ).await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "deal list failed");
                return Vec::new();
            }
        };
        if self.check_error(pt, &payload, "deal list").is_err() {
            return Vec::new();
        }
        let Ok(res) = proto::decode_payload::<proto::DealListRes>(&payload) else {
            return Vec::new();
        };

        res.deal
            .iter()
            .map(|d| {
                let symbol = self
                    .symbol_names
                    .read()
                    .get(&d.symbol_id)
                    .cloned()
                    .unwrap_or_else(|| d.symbol_id.to_string());
                let lot_size = self
                    .descriptors
                    .read()
                    .get(&symbol)
                    .map(|s| s.lot_size)
                    .unwrap_or(DEFAULT_LOT_SIZE);
                DealRecord {
                    id: d.deal_id,
                    order_id: d.order_id,
                    position_id: d.position_id,
                    symbol,
                    volume: d.volume as f64 / lot_size,
                    direction: if d.trade_side == proto::TRADE_SIDE_BUY {
                        1
                    } else {
                        -1
                    },
                    price: d.execution_price.unwrap_or(0.0),
                    pnl: d
                        .close_position_detail
                        .as_ref()
                        .and_then(|c| c.gross_profit)
                        .map(|g| g as f64 / 100.0)
                        .unwrap_or(0.0),
                    commission: d.commission.map(|c| c as f64 / 100.0).unwrap_or(0.0),
                    timestamp: d.execution_timestamp as f64 / 1000.0,
                }
            })
            .collect()
    }
}

fn decode_trendbar(symbol: &str, tb: &proto::Trendbar, digits: i32) -> Bar {
    let divisor = 10f64.powi(digits);
    let low = tb.low.map(|v| v as f64 / divisor).unwrap_or(0.0);
    Bar {
        symbol: symbol.to_string(),
        time: tb
            .utc_timestamp_in_minutes
            .map(|m| m as i64 * 60)
            .unwrap_or(0),
        open: low + tb.delta_open.map(|d| d as f64 / divisor).unwrap_or(0.0),
        high: low + tb.delta_high.map(|d| d as f64 / divisor).unwrap_or(0.0),
        low,
        close: low + tb.delta_close.map(|d| d as f64 / divisor).unwrap_or(0.0),
        volume: tb.volume as f64,
    }
}

impl std::fmt::Debug for CTraderConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CTraderConnector")
            .field("account_id", &self.account_id)
            .field("client_id", &"<redacted>")
            .field("access_token", &"<redacted>")
            .field("connected", &self.is_connected())
            .field("symbols", &self.symbol_ids.read().len())
            .field("positions", &self.positions.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_adapter() -> Arc<CTraderConnector> {
        let cfg = BrokerConfig {
            broker_type: "ctrader".into(),
            environment: "demo".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            access_token: "token".into(),
            account_id: 7,
        };
        let adapter = CTraderConnector::new(&cfg);
        adapter.symbol_ids.write().insert("EURUSD".into(), 1);
        adapter.symbol_names.write().insert(1, "EURUSD".into());
        adapter.descriptors.write().insert(
            "EURUSD".into(),
            SymbolDescriptor {
                name: "EURUSD".into(),
                id: 1,
                digits: 5,
                point: 1e-5,
                lot_size: 100_000.0,
                min_volume: 0.01,
                max_volume: 100.0,
                step_volume: 0.01,
                spread_points: Some(7.0),
                pip_value: None,
            },
        );
        adapter
    }

    #[test]
    fn trendbar_decode_applies_deltas_from_low() {
        let tb = proto::Trendbar {
            volume: 42,
            low: Some(109_000),
            delta_open: Some(50),
            delta_close: Some(120),
            delta_high: Some(200),
            utc_timestamp_in_minutes: Some(28_000_000),
        };
        let bar = decode_trendbar("EURUSD", &tb, 5);

        assert!((bar.low - 1.09).abs() < 1e-9);
        assert!((bar.open - 1.0905).abs() < 1e-9);
        assert!((bar.close - 1.0912).abs() < 1e-9);
        assert!((bar.high - 1.092).abs() < 1e-9);
        assert_eq!(bar.time, 28_000_000 * 60);
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
    }

    #[tokio::test]
    async fn reconcile_replaces_position_cache() {
        let adapter = test_adapter();
        adapter.positions.write().insert(
            99,
            Position {
                ticket: 99,
                symbol: "EURUSD".into(),
                direction: 1,
                volume: 0.01,
                open_price: 1.1,
                current_price: 1.1,
                pnl: 0.0,
                sl: 0.0,
                tp: 0.0,
                open_time: 0,
                comment: String::new(),
            },
        );

        let res = proto::ReconcileRes {
            ctid_trader_account_id: 7,
            position: vec![proto::WirePosition {
                position_id: 5,
                trade_data: Some(proto::TradeData {
                    symbol_id: 1,
                    volume: 1000,
                    trade_side: proto::TRADE_SIDE_SELL,
                    open_timestamp: Some(1_700_000_000_000),
                    comment: Some("c".into()),
                }),
                position_status: 1,
                price: Some(110_000),
                stop_loss: None,
                take_profit: None,
            }],
        };
        adapter.handle_reconcile(&res.encode_to_vec());

        let positions = adapter.get_positions().await;
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.ticket, 5);
        assert_eq!(p.direction, -1);
        assert!((p.volume - 0.01).abs() < 1e-9);
        assert!((p.open_price - 1.1).abs() < 1e-9);
        assert_eq!(p.open_time, 1_700_000_000);
    }

    #[tokio::test]
    async fn execution_close_removes_exactly_one_position() {
        let adapter = test_adapter();

        // Create via execution event.
        let create = proto::ExecutionEvent {
            ctid_trader_account_id: 7,
            execution_type: 3,
            position: Some(proto::WirePosition {
                position_id: 11,
                trade_data: Some(proto::TradeData {
                    symbol_id: 1,
                    volume: 3000,
                    trade_side: proto::TRADE_SIDE_BUY,
                    open_timestamp: None,
                    comment: None,
                }),
                position_status: 1,
                price: Some(109_500),
                stop_loss: Some(108_500),
                take_profit: None,
            }),
            order: None,
        };
        adapter.handle_execution(&create.encode_to_vec());
        assert_eq!(adapter.get_positions().await.len(), 1);
        let p = adapter.get_position("EURUSD").await.unwrap();
        assert!((p.volume - 0.03).abs() < 1e-9);
        assert!((p.sl - 1.085).abs() < 1e-9);

        // Close removes it.
        let close = proto::ExecutionEvent {
            ctid_trader_account_id: 7,
            execution_type: 3,
            position: Some(proto::WirePosition {
                position_id: 11,
                trade_data: None,
                position_status: proto::POSITION_STATUS_CLOSED,
                price: None,
                stop_loss: None,
                take_profit: None,
            }),
            order: None,
        };
        adapter.handle_execution(&close.encode_to_vec());
        assert!(adapter.get_positions().await.is_empty());
    }

    #[tokio::test]
    async fn spot_event_updates_quotes_pnl_and_equity() {
        let adapter = test_adapter();
        adapter.account.write().balance = 10_000.0;
        adapter.positions.write().insert(
            1,
            Position {
                ticket: 1,
                symbol: "EURUSD".into(),
                direction: 1,
                volume: 1.0,
                open_price: 1.1000,
                current_price: 1.1000,
                pnl: 0.0,
                sl: 0.0,
                tp: 0.0,
                open_time: 0,
                comment: String::new(),
            },
        );

        let spot = proto::SpotEvent {
            ctid_trader_account_id: 7,
            symbol_id: 1,
            bid: Some(110_099),
            ask: Some(110_101),
            timestamp: Some(1_700_000_000_000),
        };
        adapter.handle_spot(&spot.encode_to_vec()).await;

        // mid = 1.10100 → +10 pips on 1 lot at 10 USD/pip ≈ +100 USD.
        let p = adapter.get_position("EURUSD").await.unwrap();
        assert!((p.pnl - 100.0).abs() < 1e-6, "pnl = {}", p.pnl);

        let account = adapter.get_account().await;
        assert!((account.equity - 10_100.0).abs() < 1e-6);
        assert!((adapter.get_price("EURUSD").await.unwrap() - 1.101).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trader_res_updates_balance_from_cents() {
        let adapter = test_adapter();
        let res = proto::TraderRes {
            ctid_trader_account_id: 7,
            trader: Some(proto::Trader {
                ctid_trader_account_id: 7,
                balance: 1_234_567,
            }),
        };
        adapter.handle_trader_res(&res.encode_to_vec());
        let account = adapter.get_account().await;
        assert!((account.balance - 12_345.67).abs() < 1e-9);
    }

    #[test]
    fn lot_units_uses_conversion_factor() {
        let adapter = test_adapter();
        assert_eq!(adapter.lot_units("EURUSD", 0.01), 1000);
        assert_eq!(adapter.lot_units("EURUSD", 1.0), 100_000);
        // Unknown symbol falls back to the default factor.
        assert_eq!(adapter.lot_units("XXXYYY", 0.5), 50_000);
    }

    #[test]
    fn unknown_symbol_is_error() {
        let adapter = test_adapter();
        assert!(matches!(
            adapter.symbol_id("GBPUSD"),
            Err(ConnectorError::SymbolNotFound(_))
        ));
    }
}
