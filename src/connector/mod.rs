// =============================================================================
// Connector — broker transport, protocol adapter and market-data plumbing
// =============================================================================

pub mod bar_detector;
pub mod client;
pub mod ctrader;
pub mod frame;
pub mod hub;
pub mod mock;
pub mod proto;
pub mod rate_limiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::ConnectorResult;
use crate::types::{AccountInfo, Bar, OrderResult, Position, SymbolDescriptor, Timeframe};

/// A closed deal from the broker's transaction history.
#[derive(Debug, Clone)]
pub struct DealRecord {
    pub id: i64,
    pub order_id: i64,
    pub position_id: i64,
    pub symbol: String,
    pub volume: f64,
    pub direction: i32,
    pub price: f64,
    pub pnl: f64,
    pub commission: f64,
    pub timestamp: f64,
}

/// The seam between the pipeline and a concrete broker. `ctrader` is the
/// production implementation; `mock` backs tests and broker-free runs.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate. Returns once initial data (symbols,
    /// balance, open positions) is cached, or fails.
    async fn connect(&self) -> ConnectorResult<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn get_account(&self) -> AccountInfo;

    async fn get_positions(&self) -> Vec<Position>;

    async fn get_position(&self, symbol: &str) -> Option<Position>;

    /// Last known mid price for a symbol, from the spot stream.
    async fn get_price(&self, symbol: &str) -> Option<f64>;

    /// Subscribe spot ticks for `symbols` and deliver synthesised closed
    /// bars on `bars`.
    async fn subscribe_bars(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        bars: mpsc::Sender<Bar>,
    ) -> ConnectorResult<()>;

    /// Stop synthesising bars for `symbols`. Spot subscriptions stay up;
    /// only the bar callbacks are removed.
    async fn unsubscribe_bars(&self, symbols: &[String]);

    /// Market order with absolute SL/TP prices (0 = none).
    async fn open_order(
        &self,
        symbol: &str,
        direction: i32,
        volume: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> OrderResult;

    async fn close_order(&self, ticket: i64) -> OrderResult;

    async fn modify_order(&self, ticket: i64, sl: f64, tp: f64) -> OrderResult;

    async fn get_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: usize,
    ) -> ConnectorResult<Vec<Bar>>;

    async fn get_symbol_info(&self, symbol: &str) -> Option<SymbolDescriptor>;

    async fn get_order_history(&self, since: DateTime<Utc>) -> Vec<DealRecord>;
}
