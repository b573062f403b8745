// =============================================================================
// Trade logger — durable trade records on top of the store client
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::StoreClient;
use crate::paper::account::PaperTrade;

pub struct TradeLogger {
    store: Arc<StoreClient>,
    session_id: RwLock<String>,
}

impl TradeLogger {
    pub fn new(store: Arc<StoreClient>) -> Self {
        Self {
            store,
            session_id: RwLock::new(String::new()),
        }
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.write() = session_id.to_string();
    }

    /// Record a closed paper trade.
    pub async fn log_paper_trade(&self, trade: &PaperTrade) {
        let session_id = self.session_id.read().clone();
        self.store
            .insert(
                "trades",
                serde_json::json!({
                    "session_id": session_id,
                    "trade_id": Uuid::new_v4().to_string(),
                    "symbol": trade.symbol,
                    "direction": trade.direction,
                    "intensity": trade.intensity,
                    "volume": trade.volume,
                    "entry_price": trade.entry_price,
                    "exit_price": trade.exit_price,
                    "pnl": trade.pnl,
                    "pnl_pips": trade.pnl_pips,
                    "commission": trade.commission,
                    "hmm_state": trade.regime_state,
                    "is_paper": true,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
            .await;
    }
}
