// =============================================================================
// Bar detector — synthesises closed fixed-period bars from spot ticks
// =============================================================================
//
// The broker has no "bar closed" event. This module watches tick
// timestamps: when a tick lands in a later period than the pending bar,
// the pending bar is finalised and delivered on the registered channel,
// and a fresh bar starts at the new period.
//
// Closure is tick-driven only. A symbol that stops ticking keeps its last
// bar pending until the next tick arrives; the health monitor reports the
// silence instead.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{Bar, Timeframe};

struct PendingBar {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

struct SymbolState {
    timeframe: Timeframe,
    /// -1 until the first tick is seen.
    last_bar_start: i64,
    pending: Option<PendingBar>,
    sender: mpsc::Sender<Bar>,
}

/// Per-symbol tick-to-bar state machine.
#[derive(Default)]
pub struct BarDetector {
    states: Mutex<HashMap<String, SymbolState>>,
}

impl BarDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol: closed bars go out on `sender`.
    pub fn register(&self, symbol: &str, timeframe: Timeframe, sender: mpsc::Sender<Bar>) {
        self.states.lock().insert(
            symbol.to_string(),
            SymbolState {
                timeframe,
                last_bar_start: -1,
                pending: None,
                sender,
            },
        );
    }

    /// Drop a symbol's state and callback.
    pub fn unregister(&self, symbol: &str) {
        self.states.lock().remove(symbol);
    }

    pub fn is_registered(&self, symbol: &str) -> bool {
        self.states.lock().contains_key(symbol)
    }

    /// Process one tick. Returns the finalised bar when the tick crossed a
    /// period boundary (the same bar is also delivered on the channel).
    pub async fn on_tick(
        &self,
        symbol: &str,
        tick_time: i64,
        bid: f64,
        ask: f64,
        volume: f64,
    ) -> Option<Bar> {
        let mid = (bid + ask) / 2.0;

        let (completed, sender) = {
            let mut states = self.states.lock();
            let state = states.get_mut(symbol)?;

            let tf_seconds = state.timeframe.seconds();
            let bar_start = (tick_time / tf_seconds) * tf_seconds;

            // First tick ever: initialise only.
            if state.last_bar_start == -1 {
                state.last_bar_start = bar_start;
                update_pending(state, bar_start, mid, volume);
                return None;
            }

            if bar_start > state.last_bar_start {
                let completed = state.pending.take().map(|p| Bar {
                    symbol: symbol.to_string(),
                    time: p.time,
                    open: p.open,
                    high: p.high,
                    low: p.low,
                    close: p.close,
                    volume: p.volume,
                });

                state.last_bar_start = bar_start;
                update_pending(state, bar_start, mid, volume);

                (completed, state.sender.clone())
            } else {
                update_pending(state, bar_start, mid, volume);
                return None;
            }
        };

        if let Some(bar) = completed {
            debug!(symbol = %bar.symbol, time = bar.time, close = bar.close, "bar closed");
            if sender.send(bar.clone()).await.is_err() {
                warn!(symbol, "bar channel closed — dropping bar");
            }
            return Some(bar);
        }
        None
    }

    /// Snapshot of the in-progress bar, for debugging.
    pub fn pending_bar(&self, symbol: &str) -> Option<Bar> {
        let states = self.states.lock();
        let state = states.get(symbol)?;
        state.pending.as_ref().map(|p| Bar {
            symbol: symbol.to_string(),
            time: p.time,
            open: p.open,
            high: p.high,
            low: p.low,
            close: p.close,
            volume: p.volume,
        })
    }
}

fn update_pending(state: &mut SymbolState, bar_time: i64, price: f64, volume: f64) {
    match &mut state.pending {
        None => {
            state.pending = Some(PendingBar {
                time: bar_time,
                open: price,
                high: price,
                low: price,
                close: price,
                volume,
            });
        }
        Some(bar) => {
            bar.high = bar.high.max(price);
            bar.low = bar.low.min(price);
            bar.close = price;
            bar.volume += volume;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (BarDetector, mpsc::Receiver<Bar>) {
        let detector = BarDetector::new();
        let (tx, rx) = mpsc::channel(16);
        detector.register("EURUSD", Timeframe::M1, tx);
        (detector, rx)
    }

    #[tokio::test]
    async fn first_tick_initialises_without_closing() {
        let (detector, _rx) = setup();
        let bar = detector.on_tick("EURUSD", 60, 1.0, 1.0002, 0.0).await;
        assert!(bar.is_none());

        let pending = detector.pending_bar("EURUSD").unwrap();
        assert_eq!(pending.time, 60);
        assert!((pending.open - 1.0001).abs() < 1e-12);
    }

    #[tokio::test]
    async fn same_period_updates_ohlc() {
        let (detector, _rx) = setup();
        detector.on_tick("EURUSD", 60, 1.0000, 1.0002, 0.0).await;
        detector.on_tick("EURUSD", 70, 1.0010, 1.0012, 1.0).await;
        detector.on_tick("EURUSD", 80, 0.9990, 0.9992, 2.0).await;

        let p = detector.pending_bar("EURUSD").unwrap();
        assert!((p.open - 1.0001).abs() < 1e-12);
        assert!((p.high - 1.0011).abs() < 1e-12);
        assert!((p.low - 0.9991).abs() < 1e-12);
        assert!((p.close - 0.9991).abs() < 1e-12);
        assert!((p.volume - 3.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn period_change_finalises_bar() {
        let (detector, mut rx) = setup();
        detector.on_tick("EURUSD", 60, 1.0000, 1.0002, 0.0).await;
        detector.on_tick("EURUSD", 90, 1.0004, 1.0006, 0.0).await;

        // Crosses into the next minute.
        let closed = detector
            .on_tick("EURUSD", 120, 1.0008, 1.0010, 0.0)
            .await
            .expect("bar should close");
        assert_eq!(closed.time, 60);
        assert!((closed.close - 1.0005).abs() < 1e-12);
        assert!(closed.low <= closed.open.min(closed.close));
        assert!(closed.high >= closed.open.max(closed.close));

        // Same bar arrives on the channel.
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.time, 60);

        // New pending bar starts at the new boundary with the tick's mid.
        let p = detector.pending_bar("EURUSD").unwrap();
        assert_eq!(p.time, 120);
        assert!((p.open - 1.0009).abs() < 1e-12);
    }

    #[tokio::test]
    async fn unregistered_symbol_is_ignored() {
        let (detector, _rx) = setup();
        let bar = detector.on_tick("GBPUSD", 60, 1.0, 1.0, 0.0).await;
        assert!(bar.is_none());
        assert!(!detector.is_registered("GBPUSD"));
    }

    #[tokio::test]
    async fn bar_time_aligned_to_timeframe() {
        let detector = BarDetector::new();
        let (tx, _rx) = mpsc::channel(4);
        detector.register("EURUSD", Timeframe::M15, tx);

        detector.on_tick("EURUSD", 1001, 1.0, 1.0, 0.0).await;
        let p = detector.pending_bar("EURUSD").unwrap();
        assert_eq!(p.time, 900);
        assert_eq!(p.time % 900, 0);
    }
}
