// =============================================================================
// Shared types used across the Borealis trading runtime
// =============================================================================
//
// DTOs exchanged between the connector, predictor, executor and paper
// modules. No behaviour beyond derived properties — contracts only.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Runtime version stamped into order comments and telemetry.
pub const VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Position direction. Wire representation is the signed integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Short,
    Flat,
    Long,
}

impl Direction {
    pub fn value(self) -> i32 {
        match self {
            Self::Short => -1,
            Self::Flat => 0,
            Self::Long => 1,
        }
    }

    pub fn from_value(v: i32) -> Self {
        match v {
            1 => Self::Long,
            -1 => Self::Short,
            _ => Self::Flat,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Supported bar timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Parse a timeframe label such as "M15". Returns `None` for unknown
    /// labels.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "M1" => Some(Self::M1),
            "M5" => Some(Self::M5),
            "M15" => Some(Self::M15),
            "M30" => Some(Self::M30),
            "H1" => Some(Self::H1),
            "H4" => Some(Self::H4),
            "D1" => Some(Self::D1),
            _ => None,
        }
    }

    /// Width of one bar in seconds.
    pub fn seconds(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1800,
            Self::H1 => 3600,
            Self::H4 => 14400,
            Self::D1 => 86400,
        }
    }

    /// Broker trendbar period code for history requests.
    pub fn period_code(self) -> i32 {
        match self {
            Self::M1 => 1,
            Self::M5 => 5,
            Self::M15 => 7,
            Self::M30 => 8,
            Self::H1 => 9,
            Self::H4 => 10,
            Self::D1 => 12,
        }
    }

    /// Approximate bars per year (forex, ~252 trading days, ~20 h/day).
    /// Used for Sharpe annualisation in the paper shadow.
    pub fn bars_per_year(self) -> u32 {
        match self {
            Self::M1 => 252 * 20 * 60,
            Self::M5 => 252 * 20 * 12,
            Self::M15 => 252 * 20 * 4,
            Self::M30 => 252 * 20 * 2,
            Self::H1 => 252 * 20,
            Self::H4 => 252 * 5,
            Self::D1 => 252,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Action space
// ---------------------------------------------------------------------------

/// The seven policy actions. Index 0 stays out of the market; 1-3 are LONG
/// with rising intensity, 4-6 SHORT. WAIT is an action, not a position
/// state — do not confuse it with FLAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Wait,
    LongWeak,
    LongModerate,
    LongStrong,
    ShortWeak,
    ShortModerate,
    ShortStrong,
}

impl Action {
    /// Decode a policy output index. Unknown indices map to WAIT.
    pub fn from_index(idx: usize) -> Self {
        match idx {
            1 => Self::LongWeak,
            2 => Self::LongModerate,
            3 => Self::LongStrong,
            4 => Self::ShortWeak,
            5 => Self::ShortModerate,
            6 => Self::ShortStrong,
            _ => Self::Wait,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Wait => 0,
            Self::LongWeak => 1,
            Self::LongModerate => 2,
            Self::LongStrong => 3,
            Self::ShortWeak => 4,
            Self::ShortModerate => 5,
            Self::ShortStrong => 6,
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Self::Wait => Direction::Flat,
            Self::LongWeak | Self::LongModerate | Self::LongStrong => Direction::Long,
            Self::ShortWeak | Self::ShortModerate | Self::ShortStrong => Direction::Short,
        }
    }

    /// 0 (WAIT), 1 (weak), 2 (moderate) or 3 (strong).
    pub fn intensity(self) -> u8 {
        match self {
            Self::Wait => 0,
            Self::LongWeak | Self::ShortWeak => 1,
            Self::LongModerate | Self::ShortModerate => 2,
            Self::LongStrong | Self::ShortStrong => 3,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Wait => "WAIT",
            Self::LongWeak => "LONG_WEAK",
            Self::LongModerate => "LONG_MODERATE",
            Self::LongStrong => "LONG_STRONG",
            Self::ShortWeak => "SHORT_WEAK",
            Self::ShortModerate => "SHORT_MODERATE",
            Self::ShortStrong => "SHORT_STRONG",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Immutable OHLCV bar aligned to a timeframe boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    /// Unix timestamp (seconds, UTC), multiple of the timeframe width.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

/// A single bid/ask quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub time: i64,
    pub bid: f64,
    pub ask: f64,
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Signal emitted by the predictor once per closed bar after warmup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub action: Action,
    /// -1, 0, 1 — redundant with `action` but kept flat for telemetry.
    pub direction: i32,
    /// 0..=3.
    pub intensity: u8,
    /// Regime classifier state, 0..n_states.
    pub regime_state: usize,
    /// Floating PnL of the virtual twin at emission time.
    pub virtual_pnl: f64,
    /// Wall-clock emission timestamp (seconds).
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// Account & positions
// ---------------------------------------------------------------------------

/// Account snapshot from the broker adapter cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    pub free_margin: f64,
    pub margin_level: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// An open position at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: i64,
    pub symbol: String,
    /// 1 = LONG, -1 = SHORT.
    pub direction: i32,
    pub volume: f64,
    pub open_price: f64,
    pub current_price: f64,
    pub pnl: f64,
    #[serde(default)]
    pub sl: f64,
    #[serde(default)]
    pub tp: f64,
    #[serde(default)]
    pub open_time: i64,
    #[serde(default)]
    pub comment: String,
}

/// Result of an order operation at the wire level.
#[derive(Debug, Clone, Default)]
pub struct OrderResult {
    pub success: bool,
    pub ticket: Option<i64>,
    pub price: Option<f64>,
    pub error: String,
}

impl OrderResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_ticket(ticket: i64) -> Self {
        Self {
            success: true,
            ticket: Some(ticket),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Default::default()
        }
    }
}

/// Asynchronous order status update from the execution event stream.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub id: String,
    pub status: String,
    pub filled_quantity: f64,
    pub average_price: f64,
}

/// Immutable symbol metadata fetched once from the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolDescriptor {
    pub name: String,
    pub id: i64,
    pub digits: i32,
    /// 10^(-digits).
    pub point: f64,
    /// Volume units per 1.0 lot (commonly 100 000 for forex).
    pub lot_size: f64,
    pub min_volume: f64,
    pub max_volume: f64,
    pub step_volume: f64,
    /// Current spread in points, when the broker exposes it.
    #[serde(default)]
    pub spread_points: Option<f64>,
    /// Pip value per 1.0 lot in account currency, when the broker exposes it.
    #[serde(default)]
    pub pip_value: Option<f64>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_table_decodes_all_seven_indices() {
        let expect = [
            (0usize, 0i32, 0u8),
            (1, 1, 1),
            (2, 1, 2),
            (3, 1, 3),
            (4, -1, 1),
            (5, -1, 2),
            (6, -1, 3),
        ];
        for (idx, dir, intensity) in expect {
            let a = Action::from_index(idx);
            assert_eq!(a.direction().value(), dir, "idx {idx}");
            assert_eq!(a.intensity(), intensity, "idx {idx}");
            assert_eq!(a.index(), idx);
        }
    }

    #[test]
    fn invalid_action_index_is_wait() {
        assert_eq!(Action::from_index(7), Action::Wait);
        assert_eq!(Action::from_index(99), Action::Wait);
    }

    #[test]
    fn wait_implies_zero_intensity() {
        assert_eq!(Action::Wait.intensity(), 0);
        assert_eq!(Action::Wait.direction(), Direction::Flat);
    }

    #[test]
    fn timeframe_roundtrip_and_widths() {
        for label in ["M1", "M5", "M15", "M30", "H1", "H4", "D1"] {
            let tf = Timeframe::parse(label).unwrap();
            assert_eq!(tf.to_string(), label);
        }
        assert_eq!(Timeframe::M15.seconds(), 900);
        assert_eq!(Timeframe::M15.period_code(), 7);
        assert_eq!(Timeframe::M15.bars_per_year(), 20160);
        assert!(Timeframe::parse("M2").is_none());
    }

    #[test]
    fn direction_value_roundtrip() {
        for v in [-1, 0, 1] {
            assert_eq!(Direction::from_value(v).value(), v);
        }
    }
}
