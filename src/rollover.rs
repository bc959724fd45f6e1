// Copyright (c) 2025 ManuGH
// Licensed under the PolyForm Noncommercial License 1.0.0
// Since v2.0.0, this software is restricted to non-commercial use only.

//! Stage 4 — TimestampRollover: extends 33-bit PTS/DTS values to a
//! monotonic 64-bit timeline, tracking 33-bit wraparound.

const MAX_33_BIT: u64 = 1 << 33;
const HALF_33_BIT: u64 = 1 << 32;

#[derive(Debug, Default, Clone, Copy)]
pub struct RolloverState {
    last_raw: Option<u64>,
    offset: u64,
}

impl RolloverState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extends one raw 33-bit timestamp to a monotonic value, bumping the
    /// rollover offset whenever the raw value appears to have wrapped
    /// around 2^33 relative to the previous raw value seen.
    pub fn extend(&mut self, raw: u64) -> u64 {
        if let Some(last) = self.last_raw {
            if raw + HALF_33_BIT < last {
                self.offset += MAX_33_BIT;
            }
        }
        self.last_raw = Some(raw);
        raw + self.offset
    }

    /// Signals a timeline discontinuity: the next raw value should not be
    /// compared against the previous one for rollover detection, but the
    /// accumulated offset (and thus overall monotonicity across the
    /// discontinuity) is preserved.
    pub fn discontinuity(&mut self) {
        self.last_raw = None;
    }

    /// Full reset: both the last-seen raw value and the accumulated
    /// rollover offset are cleared.
    pub fn reset(&mut self) {
        self.last_raw = None;
        self.offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_monotonically_without_wrap() {
        let mut r = RolloverState::new();
        assert_eq!(r.extend(1000), 1000);
        assert_eq!(r.extend(2000), 2000);
    }

    #[test]
    fn detects_wraparound() {
        let mut r = RolloverState::new();
        let near_max = MAX_33_BIT - 100;
        assert_eq!(r.extend(near_max), near_max);
        // wrapped value, small raw but should land far ahead on the timeline
        let wrapped = r.extend(50);
        assert_eq!(wrapped, MAX_33_BIT + 50);
    }

    #[test]
    fn discontinuity_preserves_offset_but_resets_comparison() {
        let mut r = RolloverState::new();
        let near_max = MAX_33_BIT - 100;
        r.extend(near_max);
        r.extend(50); // wraps, offset becomes MAX_33_BIT
        r.discontinuity();
        // no wrap comparison now, but offset persists
        assert_eq!(r.extend(10), MAX_33_BIT + 10);
    }

    #[test]
    fn reset_clears_offset() {
        let mut r = RolloverState::new();
        let near_max = MAX_33_BIT - 100;
        r.extend(near_max);
        r.extend(50);
        r.reset();
        assert_eq!(r.extend(10), 10);
    }
}
