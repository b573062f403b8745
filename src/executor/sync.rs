// =============================================================================
// Sync logic — decision table and edge-triggered open gate
// =============================================================================
//
// Compares the predictor's signal with the real broker position and decides
// what to do. Opens are additionally gated on a signal TRANSITION (direction
// or intensity changed), so a restarted runtime does not jump into the
// middle of a move it never signalled. The first live non-WAIT signal after
// warmup passes unconditionally: warmup already aligned the model, and the
// first live bar is effectively the offline→live transition.
// =============================================================================

use serde::Serialize;

use crate::types::{Position, Signal};

/// Outcome of comparing signal vs. real position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Noop,
    Close,
    Open,
    CloseAndOpen,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Noop => "NOOP",
            Self::Close => "CLOSE",
            Self::Open => "OPEN",
            Self::CloseAndOpen => "CLOSE_AND_OPEN",
        };
        write!(f, "{s}")
    }
}

/// The full decision table:
///
/// | real \ signal | WAIT  | LONG           | SHORT          |
/// |---------------|-------|----------------|----------------|
/// | FLAT          | NOOP  | OPEN           | OPEN           |
/// | LONG          | CLOSE | NOOP           | CLOSE_AND_OPEN |
/// | SHORT         | CLOSE | CLOSE_AND_OPEN | NOOP           |
pub fn decide(signal: &Signal, real_position: Option<&Position>) -> Decision {
    let signal_dir = signal.direction;
    let real_dir = real_position.map(|p| p.direction).unwrap_or(0);

    if real_dir == 0 && signal_dir == 0 {
        return Decision::Noop;
    }

    if real_dir == 0 && signal_dir != 0 {
        return Decision::Open;
    }

    if real_dir == signal_dir {
        return Decision::Noop;
    }

    if signal_dir == 0 && real_dir != 0 {
        return Decision::Close;
    }

    Decision::CloseAndOpen
}

/// Per-symbol edge state. `should_open` must be called for every decision —
/// NOOP and CLOSE also advance the last-signal memory.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub last_signal_dir: i32,
    pub last_signal_intensity: u8,
    pub waiting_sync: bool,
    /// The first non-WAIT signal after startup/warmup always opens.
    pub first_live: bool,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_signal_dir: 0,
            last_signal_intensity: 0,
            waiting_sync: false,
            first_live: true,
        }
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate the edge rule for this signal/decision pair and advance the
    /// state. Returns true when an OPEN (or the open half of
    /// CLOSE_AND_OPEN) should actually go out.
    pub fn should_open(&mut self, signal: &Signal, decision: Decision) -> bool {
        let current_dir = signal.direction;
        let current_intensity = signal.intensity;

        // Decisions with no open half just record the signal.
        if matches!(decision, Decision::Noop | Decision::Close) {
            if current_dir == 0 {
                self.first_live = false;
            }
            self.last_signal_dir = current_dir;
            self.last_signal_intensity = current_intensity;
            self.waiting_sync = false;
            return false;
        }

        let is_transition = current_dir != self.last_signal_dir
            || current_intensity != self.last_signal_intensity;

        if self.first_live && current_dir != 0 {
            self.first_live = false;
            self.last_signal_dir = current_dir;
            self.last_signal_intensity = current_intensity;
            self.waiting_sync = false;
            return true;
        }

        if is_transition && current_dir != 0 {
            self.last_signal_dir = current_dir;
            self.last_signal_intensity = current_intensity;
            self.waiting_sync = false;
            return true;
        }

        // Same signal repeated mid-trend: hold until an edge fires.
        self.last_signal_dir = current_dir;
        self.last_signal_intensity = current_intensity;
        self.waiting_sync = true;
        false
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    fn signal(direction: i32, intensity: u8) -> Signal {
        let action = match (direction, intensity) {
            (0, _) => Action::Wait,
            (1, 1) => Action::LongWeak,
            (1, 2) => Action::LongModerate,
            (1, _) => Action::LongStrong,
            (_, 1) => Action::ShortWeak,
            (_, 2) => Action::ShortModerate,
            _ => Action::ShortStrong,
        };
        Signal {
            symbol: "EURUSD".into(),
            action,
            direction,
            intensity,
            regime_state: 0,
            virtual_pnl: 0.0,
            timestamp: 0.0,
        }
    }

    fn position(direction: i32) -> Position {
        Position {
            ticket: 1,
            symbol: "EURUSD".into(),
            direction,
            volume: 0.01,
            open_price: 1.1,
            current_price: 1.1,
            pnl: 0.0,
            sl: 0.0,
            tp: 0.0,
            open_time: 0,
            comment: String::new(),
        }
    }

    #[test]
    fn decision_table_all_nine_cells() {
        let cases = [
            (0, 0, Decision::Noop),
            (0, 1, Decision::Open),
            (0, -1, Decision::Open),
            (1, 0, Decision::Close),
            (1, 1, Decision::Noop),
            (1, -1, Decision::CloseAndOpen),
            (-1, 0, Decision::Close),
            (-1, 1, Decision::CloseAndOpen),
            (-1, -1, Decision::Noop),
        ];
        for (real_dir, signal_dir, expected) in cases {
            let pos = (real_dir != 0).then(|| position(real_dir));
            let sig = signal(signal_dir, if signal_dir == 0 { 0 } else { 1 });
            assert_eq!(
                decide(&sig, pos.as_ref()),
                expected,
                "real={real_dir} signal={signal_dir}"
            );
        }
    }

    #[test]
    fn first_live_signal_always_opens() {
        let mut state = SyncState::new();
        let sig = signal(1, 1);
        assert!(state.should_open(&sig, Decision::Open));
        assert!(!state.first_live);
    }

    #[test]
    fn repeated_identical_signal_opens_once() {
        let mut state = SyncState::new();
        let sig = signal(1, 1);
        assert!(state.should_open(&sig, Decision::Open));
        assert!(!state.should_open(&sig, Decision::Open));
        assert!(state.waiting_sync);
    }

    #[test]
    fn wait_between_signals_rearms_the_edge() {
        let mut state = SyncState::new();
        let long = signal(1, 1);

        assert!(state.should_open(&long, Decision::Open));
        // WAIT passes through (close/noop path records direction 0).
        state.should_open(&signal(0, 0), Decision::Close);
        // Same LONG again is now a transition from WAIT.
        assert!(state.should_open(&long, Decision::Open));
    }

    #[test]
    fn intensity_change_fires_the_edge() {
        let mut state = SyncState::new();
        assert!(state.should_open(&signal(1, 1), Decision::Open));
        assert!(state.should_open(&signal(1, 3), Decision::Open));
    }

    #[test]
    fn noop_consumes_first_live_only_on_wait() {
        let mut state = SyncState::new();
        // A WAIT NOOP clears first_live.
        state.should_open(&signal(0, 0), Decision::Noop);
        assert!(!state.first_live);

        // Now the first LONG is only honoured because it is a transition.
        assert!(state.should_open(&signal(1, 1), Decision::Open));
        assert!(!state.should_open(&signal(1, 1), Decision::Open));
    }

    #[test]
    fn reset_restores_first_live() {
        let mut state = SyncState::new();
        state.should_open(&signal(1, 1), Decision::Open);
        state.reset();
        assert!(state.first_live);
        assert_eq!(state.last_signal_dir, 0);
    }
}
