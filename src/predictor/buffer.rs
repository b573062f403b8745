// =============================================================================
// Bar buffer — fixed-capacity FIFO window feeding the feature calculator
// =============================================================================

use std::collections::VecDeque;

use crate::types::Bar;

/// Sliding window of the most recent bars. When full, appending evicts the
/// oldest bar. The predictor only runs once the window reports ready.
#[derive(Debug)]
pub struct BarBuffer {
    maxlen: usize,
    buffer: VecDeque<Bar>,
}

impl BarBuffer {
    pub fn new(maxlen: usize) -> Self {
        Self {
            maxlen,
            buffer: VecDeque::with_capacity(maxlen),
        }
    }

    pub fn push(&mut self, bar: Bar) {
        if self.buffer.len() == self.maxlen {
            self.buffer.pop_front();
        }
        self.buffer.push_back(bar);
    }

    pub fn extend(&mut self, bars: impl IntoIterator<Item = Bar>) {
        for bar in bars {
            self.push(bar);
        }
    }

    /// True once the window holds `maxlen` bars.
    pub fn is_ready(&self) -> bool {
        self.buffer.len() >= self.maxlen
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn maxlen(&self) -> usize {
        self.maxlen
    }

    pub fn last(&self) -> Option<&Bar> {
        self.buffer.back()
    }

    /// Oldest-first contiguous view for feature computation.
    pub fn as_slice(&self) -> Vec<&Bar> {
        self.buffer.iter().collect()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(time: i64, close: f64) -> Bar {
        Bar {
            symbol: "EURUSD".into(),
            time,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn fifo_eviction_at_capacity() {
        let mut buf = BarBuffer::new(3);
        for i in 0..5 {
            buf.push(bar(i * 60, 1.0 + i as f64));
        }
        assert_eq!(buf.len(), 3);
        let bars = buf.as_slice();
        assert_eq!(bars[0].time, 120);
        assert_eq!(bars[2].time, 240);
    }

    #[test]
    fn ready_only_when_full() {
        let mut buf = BarBuffer::new(3);
        assert!(!buf.is_ready());
        buf.push(bar(0, 1.0));
        buf.push(bar(60, 1.0));
        assert!(!buf.is_ready());
        buf.push(bar(120, 1.0));
        assert!(buf.is_ready());
    }

    #[test]
    fn last_returns_newest() {
        let mut buf = BarBuffer::new(3);
        buf.extend([bar(0, 1.0), bar(60, 2.0)]);
        assert_eq!(buf.last().unwrap().time, 60);
    }
}
