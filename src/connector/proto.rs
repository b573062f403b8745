// =============================================================================
// Broker wire messages — protobuf envelope and Open API payload subset
// =============================================================================
//
// Every frame on the wire carries one `ProtoMessage` envelope: a numeric
// payload type, the encoded payload body, and an optional client message id
// used to correlate requests with responses. Prices and volumes are
// integers scaled by the symbol's digits / lot conversion factor — the
// adapter owns all scaling, nothing here reinterprets units.
// =============================================================================

use prost::Message;

use crate::error::ConnectorError;

// ---------------------------------------------------------------------------
// Payload type tags
// ---------------------------------------------------------------------------

#[allow(dead_code)]
pub mod payload_type {
    pub const PING_REQ: u32 = 52;
    pub const PING_RES: u32 = 53;

    pub const APPLICATION_AUTH_REQ: u32 = 2100;
    pub const APPLICATION_AUTH_RES: u32 = 2101;
    pub const ACCOUNT_AUTH_REQ: u32 = 2102;
    pub const ACCOUNT_AUTH_RES: u32 = 2103;
    pub const VERSION_REQ: u32 = 2104;
    pub const VERSION_RES: u32 = 2105;
    pub const NEW_ORDER_REQ: u32 = 2106;
    pub const AMEND_POSITION_SLTP_REQ: u32 = 2110;
    pub const CLOSE_POSITION_REQ: u32 = 2111;
    pub const SYMBOLS_LIST_REQ: u32 = 2114;
    pub const SYMBOLS_LIST_RES: u32 = 2115;
    pub const SYMBOL_BY_ID_REQ: u32 = 2116;
    pub const SYMBOL_BY_ID_RES: u32 = 2117;
    pub const TRADER_REQ: u32 = 2121;
    pub const TRADER_RES: u32 = 2122;
    pub const RECONCILE_REQ: u32 = 2124;
    pub const RECONCILE_RES: u32 = 2125;
    pub const EXECUTION_EVENT: u32 = 2126;
    pub const SUBSCRIBE_SPOTS_REQ: u32 = 2127;
    pub const SUBSCRIBE_SPOTS_RES: u32 = 2128;
    pub const SPOT_EVENT: u32 = 2131;
    pub const DEAL_LIST_REQ: u32 = 2133;
    pub const DEAL_LIST_RES: u32 = 2134;
    pub const GET_TRENDBARS_REQ: u32 = 2137;
    pub const GET_TRENDBARS_RES: u32 = 2138;
    pub const ERROR_RES: u32 = 2142;
}

/// Position status carried in execution events. CLOSED removes the cached
/// position; everything else upserts.
pub const POSITION_STATUS_CLOSED: i32 = 2;

/// Trade sides on the wire.
pub const TRADE_SIDE_BUY: i32 = 1;
pub const TRADE_SIDE_SELL: i32 = 2;

/// Market order type.
pub const ORDER_TYPE_MARKET: i32 = 1;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct ProtoMessage {
    #[prost(uint32, tag = "1")]
    pub payload_type: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(string, optional, tag = "3")]
    pub client_msg_id: Option<String>,
}

impl ProtoMessage {
    pub fn new(payload_type: u32, payload: Vec<u8>, client_msg_id: Option<String>) -> Self {
        Self {
            payload_type,
            payload,
            client_msg_id,
        }
    }

    pub fn decode_frame(data: &[u8]) -> Result<Self, ConnectorError> {
        Self::decode(data).map_err(|e| ConnectorError::Protocol(format!("envelope decode: {e}")))
    }
}

/// Decode a payload body, mapping prost errors into the connector taxonomy.
pub fn decode_payload<M: Message + Default>(payload: &[u8]) -> Result<M, ConnectorError> {
    M::decode(payload).map_err(|e| ConnectorError::Protocol(format!("payload decode: {e}")))
}

// ---------------------------------------------------------------------------
// Auth & liveness
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct ApplicationAuthReq {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub client_secret: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AccountAuthReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(string, tag = "2")]
    pub access_token: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingReq {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct SymbolsListReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct LightSymbol {
    #[prost(int64, tag = "1")]
    pub symbol_id: i64,
    #[prost(string, tag = "2")]
    pub symbol_name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolsListRes {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub symbol: Vec<LightSymbol>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolByIdReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, tag = "2")]
    pub symbol_id: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FullSymbol {
    #[prost(int64, tag = "1")]
    pub symbol_id: i64,
    #[prost(int32, tag = "2")]
    pub digits: i32,
    #[prost(int32, tag = "3")]
    pub pip_position: i32,
    /// Volume units per 1.0 lot; 0 means the broker default (100 000).
    #[prost(int64, tag = "4")]
    pub lot_size: i64,
    /// Volumes in hundredths of a lot.
    #[prost(int64, tag = "5")]
    pub min_volume: i64,
    #[prost(int64, tag = "6")]
    pub max_volume: i64,
    #[prost(int64, tag = "7")]
    pub step_volume: i64,
    /// Current spread in points, when published.
    #[prost(int64, optional, tag = "8")]
    pub spread_points: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SymbolByIdRes {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub symbol: Vec<FullSymbol>,
}

// ---------------------------------------------------------------------------
// Trader / reconcile
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct TraderReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct Trader {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    /// Balance in cents of the account currency.
    #[prost(int64, tag = "2")]
    pub balance: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TraderRes {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(message, optional, tag = "2")]
    pub trader: Option<Trader>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReconcileReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct TradeData {
    #[prost(int64, tag = "1")]
    pub symbol_id: i64,
    /// Volume in hundred-thousandths of a lot (broker units).
    #[prost(int64, tag = "2")]
    pub volume: i64,
    #[prost(int32, tag = "3")]
    pub trade_side: i32,
    #[prost(int64, optional, tag = "4")]
    pub open_timestamp: Option<i64>,
    #[prost(string, optional, tag = "5")]
    pub comment: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct WirePosition {
    #[prost(int64, tag = "1")]
    pub position_id: i64,
    #[prost(message, optional, tag = "2")]
    pub trade_data: Option<TradeData>,
    #[prost(int32, tag = "3")]
    pub position_status: i32,
    /// Entry price as an integer scaled by 10^digits.
    #[prost(int64, optional, tag = "4")]
    pub price: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub stop_loss: Option<i64>,
    #[prost(int64, optional, tag = "6")]
    pub take_profit: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ReconcileRes {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub position: Vec<WirePosition>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct WireOrder {
    #[prost(int64, tag = "1")]
    pub order_id: i64,
    #[prost(int32, tag = "2")]
    pub order_status: i32,
    #[prost(int64, optional, tag = "3")]
    pub executed_volume: Option<i64>,
    #[prost(double, optional, tag = "4")]
    pub execution_price: Option<f64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ExecutionEvent {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int32, tag = "2")]
    pub execution_type: i32,
    #[prost(message, optional, tag = "3")]
    pub position: Option<WirePosition>,
    #[prost(message, optional, tag = "4")]
    pub order: Option<WireOrder>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NewOrderReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "2")]
    pub symbol_id: i64,
    #[prost(int32, tag = "3")]
    pub order_type: i32,
    #[prost(int32, tag = "4")]
    pub trade_side: i32,
    #[prost(int64, tag = "5")]
    pub volume: i64,
    /// Absolute prices — never monetary amounts.
    #[prost(double, optional, tag = "6")]
    pub stop_loss: Option<f64>,
    #[prost(double, optional, tag = "7")]
    pub take_profit: Option<f64>,
    #[prost(string, optional, tag = "8")]
    pub comment: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClosePositionReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "2")]
    pub position_id: i64,
    #[prost(int64, tag = "3")]
    pub volume: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct AmendPositionSltpReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "2")]
    pub position_id: i64,
    #[prost(double, optional, tag = "3")]
    pub stop_loss: Option<f64>,
    #[prost(double, optional, tag = "4")]
    pub take_profit: Option<f64>,
}

// ---------------------------------------------------------------------------
// Spots & history
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeSpotsReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, repeated, tag = "2")]
    pub symbol_id: Vec<i64>,
    #[prost(bool, optional, tag = "3")]
    pub subscribe_to_spot_timestamp: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SpotEvent {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "2")]
    pub symbol_id: i64,
    /// Prices as integers scaled by 10^digits; absent when unchanged.
    #[prost(uint64, optional, tag = "3")]
    pub bid: Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub ask: Option<u64>,
    /// Milliseconds UTC, when subscribed with timestamps.
    #[prost(int64, optional, tag = "5")]
    pub timestamp: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetTrendbarsReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "2")]
    pub from_timestamp: i64,
    #[prost(int64, tag = "3")]
    pub to_timestamp: i64,
    #[prost(int32, tag = "4")]
    pub period: i32,
    #[prost(int64, tag = "5")]
    pub symbol_id: i64,
}

/// Trendbar compression: `low` is absolute in integer units of 10^digits;
/// open/high/close are stored as non-negative deltas from `low`.
#[derive(Clone, PartialEq, Message)]
pub struct Trendbar {
    #[prost(int64, tag = "1")]
    pub volume: i64,
    #[prost(int64, optional, tag = "3")]
    pub low: Option<i64>,
    #[prost(uint64, optional, tag = "4")]
    pub delta_open: Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub delta_close: Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub delta_high: Option<u64>,
    #[prost(uint32, optional, tag = "7")]
    pub utc_timestamp_in_minutes: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetTrendbarsRes {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub trendbar: Vec<Trendbar>,
}

// ---------------------------------------------------------------------------
// Deals
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct DealListReq {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(int64, tag = "2")]
    pub from_timestamp: i64,
    #[prost(int64, tag = "3")]
    pub to_timestamp: i64,
    #[prost(int32, optional, tag = "4")]
    pub max_rows: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClosePositionDetail {
    #[prost(int64, tag = "1")]
    pub entry_price: i64,
    /// Gross profit in cents.
    #[prost(int64, optional, tag = "2")]
    pub gross_profit: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Deal {
    #[prost(int64, tag = "1")]
    pub deal_id: i64,
    #[prost(int64, tag = "2")]
    pub order_id: i64,
    #[prost(int64, tag = "3")]
    pub position_id: i64,
    #[prost(int64, tag = "4")]
    pub volume: i64,
    #[prost(int32, tag = "5")]
    pub trade_side: i32,
    #[prost(int64, tag = "6")]
    pub symbol_id: i64,
    #[prost(double, optional, tag = "7")]
    pub execution_price: Option<f64>,
    #[prost(int64, tag = "8")]
    pub execution_timestamp: i64,
    /// Commission in cents.
    #[prost(int64, optional, tag = "9")]
    pub commission: Option<i64>,
    #[prost(int32, tag = "10")]
    pub deal_status: i32,
    #[prost(message, optional, tag = "11")]
    pub close_position_detail: Option<ClosePositionDetail>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DealListRes {
    #[prost(int64, tag = "1")]
    pub ctid_trader_account_id: i64,
    #[prost(message, repeated, tag = "2")]
    pub deal: Vec<Deal>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Message)]
pub struct ErrorRes {
    #[prost(string, tag = "1")]
    pub error_code: String,
    #[prost(string, optional, tag = "2")]
    pub description: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip_with_correlation_id() {
        let inner = AccountAuthReq {
            ctid_trader_account_id: 42,
            access_token: "token".into(),
        };
        let env = ProtoMessage::new(
            payload_type::ACCOUNT_AUTH_REQ,
            inner.encode_to_vec(),
            Some("abc-123".into()),
        );

        let bytes = env.encode_to_vec();
        let decoded = ProtoMessage::decode_frame(&bytes).unwrap();
        assert_eq!(decoded.payload_type, payload_type::ACCOUNT_AUTH_REQ);
        assert_eq!(decoded.client_msg_id.as_deref(), Some("abc-123"));

        let body: AccountAuthReq = decode_payload(&decoded.payload).unwrap();
        assert_eq!(body.ctid_trader_account_id, 42);
        assert_eq!(body.access_token, "token");
    }

    #[test]
    fn envelope_without_correlation_id() {
        let env = ProtoMessage::new(payload_type::SPOT_EVENT, vec![], None);
        let decoded = ProtoMessage::decode_frame(&env.encode_to_vec()).unwrap();
        assert!(decoded.client_msg_id.is_none());
    }

    #[test]
    fn trendbar_optional_fields_default_to_none() {
        let tb = Trendbar {
            volume: 10,
            ..Default::default()
        };
        let decoded: Trendbar = decode_payload(&tb.encode_to_vec()).unwrap();
        assert_eq!(decoded.volume, 10);
        assert!(decoded.low.is_none());
        assert!(decoded.delta_open.is_none());
    }

    #[test]
    fn garbage_payload_is_protocol_error() {
        let res: Result<SpotEvent, _> = decode_payload(&[0xff, 0xff, 0xff, 0xff]);
        assert!(res.is_err());
    }
}
