// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Sequence number gap detection.
//!
//! Notification messages carry a `u32` sequence number that starts at 1,
//! increases by one per message and wraps from `u32::MAX` back to 1. Zero
//! is reserved and means "no value seen yet".
//!
//! The distance between two sequence numbers is measured on that ring in
//! whichever direction is shorter. A number ahead of the expected one means
//! messages were dropped; a number behind the last one means a late,
//! out-of-order arrival.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Maximum number of missing values listed in a [`SequenceCheck`].
pub const MISSING_REPORT_LIMIT: usize = 1024;

/// Number of distinct sequence numbers (0 is excluded).
const RING: u64 = u32::MAX as u64;

/// Outcome of validating one sequence number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceCheck {
    /// `true` if no gap was found.
    pub ok: bool,
    /// `true` if the gap means messages were lost, `false` for a late arrival.
    pub dropped: bool,
    /// The missing values in ring order, at most [`MISSING_REPORT_LIMIT`].
    pub missing: Vec<u32>,
    /// Total number of missing values, including those not listed.
    pub missing_count: u64,
}

impl SequenceCheck {
    fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }
}

/// Returns the successor of a sequence number, skipping 0.
#[inline]
pub const fn next(value: u32) -> u32 {
    if value == u32::MAX {
        1
    } else {
        value + 1
    }
}

/// Validates `current` against `last_seen` and stores `current`.
///
/// `last_seen` is updated unconditionally so later calls measure progress
/// from the latest observed value.
///
/// ```
/// use opcpub_engine::sequence::validate;
///
/// let mut last = 2;
/// let check = validate(5, &mut last);
/// assert!(!check.ok);
/// assert_eq!(check.missing, vec![3, 4]);
/// assert_eq!(last, 5);
/// ```
pub fn validate(current: u32, last_seen: &mut u32) -> SequenceCheck {
    let previous = std::mem::replace(last_seen, current);

    // Duplicates are allowed: different change classes may share a number.
    if current == previous || previous == 0 || current == 0 || current == next(previous) {
        return SequenceCheck::ok();
    }

    let forward = (position(current) + RING - position(previous)) % RING;
    let backward = RING - forward;

    if forward <= backward {
        SequenceCheck {
            ok: false,
            dropped: true,
            missing: run(next(previous), current),
            missing_count: forward - 1,
        }
    } else {
        SequenceCheck {
            ok: false,
            dropped: false,
            missing: run(next(current), previous),
            missing_count: backward - 1,
        }
    }
}

#[inline]
fn position(value: u32) -> u64 {
    u64::from(value) - 1
}

/// Values from `start` up to `end` exclusive, following the ring.
fn run(start: u32, end: u32) -> Vec<u32> {
    let mut values = Vec::new();
    let mut value = start;
    while value != end && values.len() < MISSING_REPORT_LIMIT {
        values.push(value);
        value = next(value);
    }
    values
}

// =============================================================================
// SequenceTracker
// =============================================================================

/// Tracks the sequence numbers of one notification stream.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seen: Mutex<u32>,
    gaps: AtomicU64,
    missing: AtomicU64,
    out_of_order: AtomicU64,
}

impl SequenceTracker {
    /// Creates a tracker that has seen nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates the next observed sequence number.
    pub fn observe(&self, sequence_number: u32, stream: &str) -> SequenceCheck {
        let check = validate(sequence_number, &mut self.last_seen.lock());
        if !check.ok {
            if check.dropped {
                self.gaps.fetch_add(1, Ordering::Relaxed);
                self.missing.fetch_add(check.missing_count, Ordering::Relaxed);
                tracing::warn!(
                    stream = stream,
                    sequence_number,
                    missing = check.missing_count,
                    first_missing = check.missing.first().copied(),
                    "Sequence gap detected, notifications were lost"
                );
            } else {
                self.out_of_order.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    stream = stream,
                    sequence_number,
                    "Out-of-order notification"
                );
            }
        }
        check
    }

    /// Forgets the last seen value, e.g. after the subscription was recreated.
    pub fn reset(&self) {
        *self.last_seen.lock() = 0;
    }

    /// Number of detected gaps.
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Number of notifications lost across all gaps.
    pub fn missing(&self) -> u64 {
        self.missing.load(Ordering::Relaxed)
    }

    /// Number of late arrivals.
    pub fn out_of_order(&self) -> u64 {
        self.out_of_order.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successor_no_gap() {
        let mut last = 1;
        let check = validate(2, &mut last);
        assert!(check.ok);
        assert!(check.missing.is_empty());
        assert_eq!(last, 2);
    }

    #[test]
    fn test_forward_gap() {
        let mut last = 2;
        let check = validate(5, &mut last);
        assert!(!check.ok);
        assert!(check.dropped);
        assert_eq!(check.missing, vec![3, 4]);
        assert_eq!(check.missing_count, 2);
        assert_eq!(last, 5);
    }

    #[test]
    fn test_wraparound_successor_skips_zero() {
        let mut last = u32::MAX;
        assert!(validate(1, &mut last).ok);
        assert_eq!(last, 1);
        assert_eq!(next(u32::MAX), 1);
    }

    #[test]
    fn test_gap_across_wrap() {
        let mut last = u32::MAX - 1;
        let check = validate(2, &mut last);
        assert!(check.dropped);
        assert_eq!(check.missing, vec![u32::MAX, 1]);
    }

    #[test]
    fn test_duplicate_allowed() {
        let mut last = 3;
        let check = validate(3, &mut last);
        assert!(check.ok);
        assert!(check.missing.is_empty());
    }

    #[test]
    fn test_out_of_order_is_not_dropped() {
        let mut last = 10;
        let check = validate(7, &mut last);
        assert!(!check.ok);
        assert!(!check.dropped);
        assert_eq!(check.missing, vec![8, 9]);
        // lastSeen still moves to the observed value
        assert_eq!(last, 7);
    }

    #[test]
    fn test_unused_last_seen_accepts_anything() {
        let mut last = 0;
        assert!(validate(12345, &mut last).ok);
        assert_eq!(last, 12345);
    }

    #[test]
    fn test_large_gap_list_is_capped() {
        let mut last = 1;
        let check = validate(100_000, &mut last);
        assert!(check.dropped);
        assert_eq!(check.missing.len(), MISSING_REPORT_LIMIT);
        assert_eq!(check.missing_count, 99_998);
    }

    #[test]
    fn test_tracker_counts() {
        let tracker = SequenceTracker::new();
        for n in [1, 2, 5, 4, 4] {
            tracker.observe(n, "sub-1");
        }
        assert_eq!(tracker.gaps(), 1);
        assert_eq!(tracker.missing(), 2);
        assert_eq!(tracker.out_of_order(), 1);

        tracker.reset();
        assert!(tracker.observe(900, "sub-1").ok);
    }
}
