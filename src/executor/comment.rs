// =============================================================================
// Order comment codec
// =============================================================================
//
// Compact pipe-separated audit trail attached to every order:
//
//   O|{version}|{regime_state}|{action_index}|{intensity}|{balance}|{dd%}|{vpnl}
//
// The broker caps comments at 100 characters; build truncates, parse
// rejects anything that does not carry all eight fields.
// =============================================================================

use crate::types::VERSION;

pub const MAX_LENGTH: usize = 100;

/// Fields carried in an order comment.
#[derive(Debug, Clone, PartialEq)]
pub struct CommentFields {
    pub version: String,
    pub regime_state: usize,
    pub action_index: usize,
    pub intensity: u8,
    /// Whole account-currency units.
    pub balance: i64,
    /// One decimal place.
    pub drawdown_pct: f64,
    /// Two decimal places.
    pub virtual_pnl: f64,
}

pub fn build(
    regime_state: usize,
    action_index: usize,
    intensity: u8,
    balance: f64,
    drawdown_pct: f64,
    virtual_pnl: f64,
) -> String {
    let mut comment = format!(
        "O|{VERSION}|{regime_state}|{action_index}|{intensity}|{}|{:.1}|{:.2}",
        balance as i64, drawdown_pct, virtual_pnl
    );
    comment.truncate(MAX_LENGTH);
    comment
}

/// Parse a structured comment. Returns `None` for anything that is not a
/// complete well-formed comment.
pub fn parse(comment: &str) -> Option<CommentFields> {
    if !comment.starts_with("O|") {
        return None;
    }

    let parts: Vec<&str> = comment.split('|').collect();
    if parts.len() < 8 {
        return None;
    }

    Some(CommentFields {
        version: parts[1].to_string(),
        regime_state: parts[2].parse().ok()?,
        action_index: parts[3].parse().ok()?,
        intensity: parts[4].parse().ok()?,
        balance: parts[5].parse().ok()?,
        drawdown_pct: parts[6].parse().ok()?,
        virtual_pnl: parts[7].parse().ok()?,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_then_parse_roundtrips() {
        let comment = build(3, 2, 2, 10_432.7, 1.25, -12.345);
        let fields = parse(&comment).unwrap();

        assert_eq!(fields.version, VERSION);
        assert_eq!(fields.regime_state, 3);
        assert_eq!(fields.action_index, 2);
        assert_eq!(fields.intensity, 2);
        assert_eq!(fields.balance, 10_432);
        assert!((fields.drawdown_pct - 1.2).abs() < 1e-9, "dd truncated to 1dp");
        assert!((fields.virtual_pnl - (-12.35)).abs() < 1e-9, "pnl rounded to 2dp");
    }

    #[test]
    fn comment_fits_broker_limit() {
        let comment = build(4, 6, 3, 99_999_999.0, 99.9, -99_999.99);
        assert!(comment.len() <= MAX_LENGTH);
    }

    #[test]
    fn parse_rejects_foreign_comments() {
        assert!(parse("").is_none());
        assert!(parse("manual order").is_none());
        assert!(parse("O|2.0|1|2").is_none());
        assert!(parse("O|2.0|x|2|1|100|0.0|0.00").is_none());
    }
}
