// =============================================================================
// Mock connector — in-memory broker for tests and broker-free runs
// =============================================================================
//
// Fills every order instantly against the last known price, tracks a
// simulated balance, and serves deterministic pseudo-random history when
// none has been loaded. Selected with `broker.type: mock`; the rest of the
// pipeline cannot tell it apart from the real adapter.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::connector::{Connector, DealRecord};
use crate::error::ConnectorResult;
use crate::types::{AccountInfo, Bar, OrderResult, Position, SymbolDescriptor, Timeframe};

/// Approximate margin per lot used for the simulated account.
const MARGIN_PER_LOT: f64 = 1000.0;

struct ClosedOrder {
    ticket: i64,
    symbol: String,
    direction: i32,
    volume: f64,
    price: f64,
    pnl: f64,
    close_time: i64,
}

pub struct MockConnector {
    balance: RwLock<f64>,
    positions: RwLock<HashMap<String, Position>>,
    closed_orders: RwLock<Vec<ClosedOrder>>,
    next_ticket: AtomicI64,
    connected: AtomicBool,

    bars_data: RwLock<HashMap<String, Vec<Bar>>>,
    senders: RwLock<HashMap<String, mpsc::Sender<Bar>>>,
    last_prices: RwLock<HashMap<String, f64>>,
}

impl MockConnector {
    pub fn new(initial_balance: f64) -> Arc<Self> {
        Arc::new(Self {
            balance: RwLock::new(initial_balance),
            positions: RwLock::new(HashMap::new()),
            closed_orders: RwLock::new(Vec::new()),
            next_ticket: AtomicI64::new(1000),
            connected: AtomicBool::new(false),
            bars_data: RwLock::new(HashMap::new()),
            senders: RwLock::new(HashMap::new()),
            last_prices: RwLock::new(HashMap::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    /// Preload bars for history replay.
    pub fn load_bars(&self, symbol: &str, bars: Vec<Bar>) {
        if let Some(last) = bars.last() {
            self.last_prices
                .write()
                .insert(symbol.to_string(), last.close);
        }
        self.bars_data.write().insert(symbol.to_string(), bars);
    }

    /// Move the simulated market and refresh the open position's PnL.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.last_prices.write().insert(symbol.to_string(), price);
        if let Some(pos) = self.positions.write().get_mut(symbol) {
            let diff = (price - pos.open_price) * pos.direction as f64;
            pos.current_price = price;
            pos.pnl = diff * pos.volume * 100_000.0;
        }
    }

    /// Push one closed bar through the registered subscription.
    pub async fn emit_bar(&self, bar: Bar) {
        self.last_prices
            .write()
            .insert(bar.symbol.clone(), bar.close);
        let sender = self.senders.read().get(&bar.symbol).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(bar).await;
        }
    }

    fn generate_random_bars(&self, symbol: &str, timeframe: Timeframe, n: usize) -> Vec<Bar> {
        // Fixed seed: replays are deterministic.
        let mut rng = StdRng::seed_from_u64(42);
        let tf_seconds = timeframe.seconds();
        let base_time = Utc::now().timestamp() / tf_seconds * tf_seconds - n as i64 * tf_seconds;

        let mut price = 1.10000f64;
        let mut bars = Vec::with_capacity(n);
        for i in 0..n {
            let change = (rng.gen::<f64>() - 0.5) * 0.001;
            let open = price;
            let close = price + change;
            let high = open.max(close) + rng.gen::<f64>() * 0.0002;
            let low = open.min(close) - rng.gen::<f64>() * 0.0002;
            let volume = rng.gen_range(100.0..1000.0f64).floor();

            bars.push(Bar {
                symbol: symbol.to_string(),
                time: base_time + i as i64 * tf_seconds,
                open: round5(open),
                high: round5(high),
                low: round5(low),
                close: round5(close),
                volume,
            });
            price = close;
        }

        if let Some(last) = bars.last() {
            self.last_prices
                .write()
                .insert(symbol.to_string(), last.close);
        }
        bars
    }
}

fn round5(v: f64) -> f64 {
    (v * 1e5).round() / 1e5
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> ConnectorResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!("mock connector ready");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        info!("mock connector closed");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_account(&self) -> AccountInfo {
        let balance = *self.balance.read();
        let positions = self.positions.read();
        let floating: f64 = positions.values().map(|p| p.pnl).sum();
        let equity = balance + floating;
        let margin: f64 = positions.values().map(|p| p.volume * MARGIN_PER_LOT).sum();
        AccountInfo {
            balance,
            equity,
            margin,
            free_margin: equity - margin,
            margin_level: if margin > 0.0 {
                equity / margin * 100.0
            } else {
                0.0
            },
            currency: "USD".to_string(),
        }
    }

    async fn get_positions(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions.read().get(symbol).cloned()
    }

    async fn get_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.read().get(symbol).copied()
    }

    async fn subscribe_bars(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        bars: mpsc::Sender<Bar>,
    ) -> ConnectorResult<()> {
        for symbol in symbols {
            self.senders.write().insert(symbol.clone(), bars.clone());
            debug!(%symbol, %timeframe, "mock subscription");
        }
        Ok(())
    }

    async fn unsubscribe_bars(&self, symbols: &[String]) {
        for symbol in symbols {
            self.senders.write().remove(symbol);
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
        let price = self
            .last_prices
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(1.10000);
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);

        self.positions.write().insert(
            symbol.to_string(),
            Position {
                ticket,
                symbol: symbol.to_string(),
                direction,
                volume,
                open_price: price,
                current_price: price,
                pnl: 0.0,
                sl,
                tp,
                open_time: Utc::now().timestamp(),
                comment: comment.to_string(),
            },
        );

        debug!(%symbol, direction, volume, price, ticket, "mock order opened");
        let mut result = OrderResult::ok_ticket(ticket);
        result.price = Some(price);
        result
    }

    async fn close_order(&self, ticket: i64) -> OrderResult {
        let entry = {
            let positions = self.positions.read();
            positions
                .iter()
                .find(|(_, p)| p.ticket == ticket)
                .map(|(s, p)| (s.clone(), p.clone()))
        };
        let Some((symbol, pos)) = entry else {
            return OrderResult::failed(format!("ticket {ticket} not found"));
        };

        let close_price = self
            .last_prices
            .read()
            .get(&symbol)
            .copied()
            .unwrap_or(pos.current_price);

        self.closed_orders.write().push(ClosedOrder {
            ticket,
            symbol: symbol.clone(),
            direction: pos.direction,
            volume: pos.volume,
            price: close_price,
            pnl: pos.pnl,
            close_time: Utc::now().timestamp(),
        });

        *self.balance.write() += pos.pnl;
        self.positions.write().remove(&symbol);

        debug!(ticket, pnl = pos.pnl, "mock order closed");
        let mut result = OrderResult::ok_ticket(ticket);
        result.price = Some(close_price);
        result
    }

    async fn modify_order(&self, ticket: i64, sl: f64, tp: f64) -> OrderResult {
        let mut positions = self.positions.write();
        for pos in positions.values_mut() {
            if pos.ticket == ticket {
                pos.sl = sl;
                pos.tp = tp;
                return OrderResult::ok_ticket(ticket);
            }
        }
        OrderResult::failed(format!("ticket {ticket} not found"))
    }

    async fn get_history(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: usize,
    ) -> ConnectorResult<Vec<Bar>> {
        if let Some(data) = self.bars_data.read().get(symbol) {
            let start = data.len().saturating_sub(bars);
            let result = data[start..].to_vec();
            if let Some(last) = result.last() {
                self.last_prices
                    .write()
                    .insert(symbol.to_string(), last.close);
            }
            return Ok(result);
        }
        Ok(self.generate_random_bars(symbol, timeframe, bars))
    }

    async fn get_symbol_info(&self, symbol: &str) -> Option<SymbolDescriptor> {
        let (digits, pip_value, spread_points) = match symbol {
            "EURUSD" => (5, 10.0, 7.0),
            "GBPUSD" => (5, 10.0, 10.0),
            "USDJPY" => (3, 6.7, 8.0),
            _ => (5, 10.0, 10.0),
        };
        Some(SymbolDescriptor {
            name: symbol.to_string(),
            id: 0,
            digits,
            point: 10f64.powi(-digits),
            lot_size: 100_000.0,
            min_volume: 0.01,
            max_volume: 100.0,
            step_volume: 0.01,
            spread_points: Some(spread_points),
            pip_value: Some(pip_value),
        })
    }

    async fn get_order_history(&self, since: DateTime<Utc>) -> Vec<DealRecord> {
        let since_ts = since.timestamp();
        self.closed_orders
            .read()
            .iter()
            .filter(|o| o.close_time >= since_ts)
            .map(|o| DealRecord {
                id: o.ticket,
                order_id: o.ticket,
                position_id: o.ticket,
                symbol: o.symbol.clone(),
                volume: o.volume,
                direction: o.direction,
                price: o.price,
                pnl: o.pnl,
                commission: 0.0,
                timestamp: o.close_time as f64,
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_and_account_defaults() {
        let mock = MockConnector::new(10_000.0);
        mock.connect().await.unwrap();
        assert!(mock.is_connected());

        let account = mock.get_account().await;
        assert!((account.balance - 10_000.0).abs() < f64::EPSILON);
        assert!((account.free_margin - 10_000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn order_lifecycle_updates_balance() {
        let mock = MockConnector::new(10_000.0);
        mock.connect().await.unwrap();
        mock.set_price("EURUSD", 1.10000);

        let open = mock
            .open_order("EURUSD", 1, 0.01, 1.09, 0.0, "O|2.0|0|1|1|10000|0.0|0.00")
            .await;
        assert!(open.success);
        let ticket = open.ticket.unwrap();

        // Price moves 10 pips in our favour.
        mock.set_price("EURUSD", 1.10100);
        let pos = mock.get_position("EURUSD").await.unwrap();
        assert!((pos.pnl - 1.0).abs() < 1e-6, "pnl = {}", pos.pnl);

        let close = mock.close_order(ticket).await;
        assert!(close.success);
        assert!(mock.get_positions().await.is_empty());

        let account = mock.get_account().await;
        assert!((account.balance - 10_001.0).abs() < 1e-6);

        let deals = mock.get_order_history(Utc::now() - chrono::Duration::hours(1)).await;
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].position_id, ticket);
    }

    #[tokio::test]
    async fn close_unknown_ticket_fails() {
        let mock = MockConnector::new(10_000.0);
        assert!(!mock.close_order(999).await.success);
    }

    #[tokio::test]
    async fn generated_history_is_deterministic_and_valid() {
        let mock = MockConnector::new(10_000.0);
        let a = mock.get_history("EURUSD", Timeframe::M15, 100).await.unwrap();
        let b = mock.get_history("EURUSD", Timeframe::M15, 100).await.unwrap();

        assert_eq!(a.len(), 100);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.close, y.close);
        }
        for bar in &a {
            assert!(bar.low <= bar.open.min(bar.close));
            assert!(bar.high >= bar.open.max(bar.close));
            assert_eq!(bar.time % Timeframe::M15.seconds(), 0);
        }
    }

    #[tokio::test]
    async fn loaded_bars_are_replayed_from_the_tail() {
        let mock = MockConnector::new(10_000.0);
        let bars: Vec<Bar> = (0..10)
            .map(|i| Bar {
                symbol: "EURUSD".into(),
                time: i * 900,
                open: 1.1,
                high: 1.1,
                low: 1.1,
                close: 1.1 + i as f64 * 0.001,
                volume: 1.0,
            })
            .collect();
        mock.load_bars("EURUSD", bars);

        let history = mock.get_history("EURUSD", Timeframe::M15, 3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].time, 7 * 900);
    }

    #[tokio::test]
    async fn emit_bar_reaches_subscriber() {
        let mock = MockConnector::new(10_000.0);
        let (tx, mut rx) = mpsc::channel(4);
        mock.subscribe_bars(&["EURUSD".to_string()], Timeframe::M15, tx)
            .await
            .unwrap();

        mock.emit_bar(Bar {
            symbol: "EURUSD".into(),
            time: 900,
            open: 1.1,
            high: 1.1,
            low: 1.1,
            close: 1.1,
            volume: 0.0,
        })
        .await;

        let bar = rx.recv().await.unwrap();
        assert_eq!(bar.time, 900);
        assert_eq!(mock.get_price("EURUSD").await, Some(1.1));
    }
}
