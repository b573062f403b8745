// =============================================================================
// Price converter — monetary SL/TP to absolute price levels
// =============================================================================
//
// The broker interprets stopLoss/takeProfit as absolute prices. Symbol
// configs express risk in account currency, so each order first converts:
//
//   pip_value_total = pip_value_per_lot × volume
//   distance_pips   = usd ÷ pip_value_total
//   distance_price  = distance_pips × point_size × 10
//
// The × 10 encodes the one-pip-equals-ten-points convention shared by
// 5-digit and 3-digit pricing. A zero monetary amount means "no stop/take"
// and maps to price 0.
// =============================================================================

use tracing::{debug, warn};

use crate::types::SymbolDescriptor;

/// Static pip-value fallback (per 1.0 lot, USD account) for when the
/// broker does not publish one. Crosses are approximations.
fn static_pip_value(symbol: &str) -> Option<f64> {
    let value = match symbol {
        "EURUSD" | "GBPUSD" | "AUDUSD" | "NZDUSD" => 10.0,
        "USDJPY" => 6.7,
        "USDCHF" => 10.5,
        "USDCAD" => 7.3,
        "EURJPY" | "GBPJPY" | "AUDJPY" | "NZDJPY" | "CADJPY" => 6.7,
        "EURGBP" => 12.5,
        "AUDCAD" | "EURCAD" | "GBPCAD" => 7.3,
        "AUDNZD" => 6.2,
        "EURAUD" | "GBPAUD" => 6.5,
        "EURCHF" | "GBPCHF" => 10.5,
        _ => return None,
    };
    Some(value)
}

#[derive(Debug, Clone, Copy)]
pub struct SymbolPricing {
    pub point: f64,
    pub digits: i32,
    pub pip_value_per_lot: f64,
}

impl SymbolPricing {
    /// Resolve pricing for a symbol. Preference order: broker descriptor,
    /// static table, base/quote estimate.
    pub fn resolve(
        symbol: &str,
        descriptor: Option<&SymbolDescriptor>,
        current_price: f64,
    ) -> Self {
        let (point, digits) = match descriptor {
            Some(d) => (d.point, d.digits),
            None => {
                if symbol.contains("JPY") {
                    (0.001, 3)
                } else {
                    (0.00001, 5)
                }
            }
        };

        let pip_value_per_lot = descriptor
            .and_then(|d| d.pip_value)
            .or_else(|| static_pip_value(symbol))
            .unwrap_or_else(|| estimate_pip_value(symbol, current_price));

        Self {
            point,
            digits,
            pip_value_per_lot,
        }
    }
}

/// Last-resort pip value for a USD account:
/// XXX/USD → 10, USD/XXX → 10 / rate, crosses → 10.
fn estimate_pip_value(symbol: &str, current_price: f64) -> f64 {
    if symbol.len() < 6 {
        warn!(%symbol, "unrecognised symbol — assuming pip value 10.0");
        return 10.0;
    }

    let base = &symbol[..3];
    let quote = &symbol[3..6];

    if quote == "USD" {
        10.0
    } else if base == "USD" {
        if current_price > 0.0 {
            10.0 / current_price
        } else {
            10.0
        }
    } else {
        debug!(%symbol, "cross pair without pip value — using 10.0 estimate");
        10.0
    }
}

/// Convert a monetary amount into a price distance for the given volume.
/// Returns 0 when the conversion is impossible.
pub fn usd_to_price_distance(usd: f64, volume: f64, pricing: &SymbolPricing) -> f64 {
    if usd <= 0.0 || volume <= 0.0 || pricing.pip_value_per_lot <= 0.0 {
        return 0.0;
    }

    let pip_value_total = pricing.pip_value_per_lot * volume;
    let distance_pips = usd / pip_value_total;

    // 1 pip = 10 points in both 5-digit and 3-digit pricing.
    distance_pips * pricing.point * 10.0
}

/// Absolute stop-loss price. LONG stops sit below the current price.
pub fn usd_to_sl_price(
    direction: i32,
    sl_usd: f64,
    volume: f64,
    current_price: f64,
    pricing: &SymbolPricing,
) -> f64 {
    if sl_usd <= 0.0 {
        return 0.0;
    }
    let distance = usd_to_price_distance(sl_usd, volume, pricing);
    if distance <= 0.0 {
        return 0.0;
    }

    let price = if direction == 1 {
        current_price - distance
    } else {
        current_price + distance
    };
    round_to_digits(price, pricing.digits)
}

/// Absolute take-profit price — the stop-loss mirror.
pub fn usd_to_tp_price(
    direction: i32,
    tp_usd: f64,
    volume: f64,
    current_price: f64,
    pricing: &SymbolPricing,
) -> f64 {
    if tp_usd <= 0.0 {
        return 0.0;
    }
    let distance = usd_to_price_distance(tp_usd, volume, pricing);
    if distance <= 0.0 {
        return 0.0;
    }

    let price = if direction == 1 {
        current_price + distance
    } else {
        current_price - distance
    };
    round_to_digits(price, pricing.digits)
}

fn round_to_digits(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}
