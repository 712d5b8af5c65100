//! Turns raw cumulative counter readings into non-negative usage deltas.

use crate::domain::Sample;

/// Pulses attributed to the interval ending at `current`.
///
/// A lone first reading contributes nothing. A reading lower than its
/// predecessor means the counter restarted from zero, so the whole reading is
/// the delta. Historical aggregates depend on this exact policy.
pub fn delta(previous: Option<i64>, current: i64) -> i64 {
    match previous {
        None => 0,
        Some(prev) if current >= prev => current.saturating_sub(prev),
        Some(_) => current.max(0),
    }
}

/// Walks a sample sequence, remembering the previous count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconstructor {
    previous: Option<i64>,
}

impl Reconstructor {
    pub fn new(carry_in: Option<i64>) -> Self {
        Self { previous: carry_in }
    }

    pub fn push(&mut self, count: i64) -> i64 {
        let d = delta(self.previous, count);
        self.previous = Some(count);
        d
    }
}

/// Total usage over `samples`, which must already be in store order.
pub fn total(carry_in: Option<i64>, samples: &[Sample]) -> i64 {
    let mut walk = Reconstructor::new(carry_in);
    samples
        .iter()
        .fold(0i64, |acc, s| acc.saturating_add(walk.push(s.count)))
        .max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_contributes_nothing() {
        assert_eq!(delta(None, 100), 0);
        assert_eq!(total(None, &[Sample::new(0, 100)]), 0);
    }

    #[test]
    fn monotonic_readings_use_difference() {
        assert_eq!(delta(Some(100), 130), 30);
        assert_eq!(delta(Some(100), 100), 0);
    }

    #[test]
    fn lower_reading_counts_as_reset() {
        assert_eq!(delta(Some(100), 80), 80);
        assert_eq!(delta(Some(100), 0), 0);
    }

    #[test]
    fn delta_is_never_negative() {
        let counts = [5, -3, 7, 7, 2, i64::MAX, -1, 0, i64::MIN, 4];
        let mut prev = None;
        for c in counts {
            assert!(delta(prev, c) >= 0, "delta({prev:?}, {c}) went negative");
            prev = Some(c);
        }
    }

    #[test]
    fn reset_sequence_accumulates_each_reading() {
        let samples = [Sample::new(0, 100), Sample::new(10, 80), Sample::new(20, 30)];
        assert_eq!(total(None, &samples), 110);
    }

    #[test]
    fn carry_in_seeds_the_first_delta() {
        let samples = [Sample::new(10, 105), Sample::new(20, 110)];
        assert_eq!(total(Some(100), &samples), 10);
        assert_eq!(total(None, &samples), 5);
    }
}
