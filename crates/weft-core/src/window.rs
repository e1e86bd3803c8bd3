//! Sliding 64-bit replay window over monotonically increasing bundle ids.
//!
//! Bit 0 of the mask corresponds to the highest accepted id (`head`); bit k
//! to `head - k`. Ids more than 63 below the head are treated as already
//! seen.

/// Width of the window in bits.
pub const WINDOW_BITS: u64 = 64;

/// A contiguous inclusive range of received ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqRange {
    /// Lowest id in the range
    pub from: u64,
    /// Highest id in the range
    pub to: u64,
}

/// 64-bit receive window.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    head: u64,
    mask: u64,
}

impl ReplayWindow {
    /// Create an empty window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest accepted id (0 before anything arrived).
    #[must_use]
    pub fn head(&self) -> u64 {
        self.head
    }

    /// Whether `id` counts as already received. Id 0 is always "seen";
    /// ids older than the window's reach are treated as seen.
    #[must_use]
    pub fn has_received(&self, id: u64) -> bool {
        if id == 0 {
            return true;
        }
        if id > self.head {
            return false;
        }
        let diff = self.head - id;
        if diff >= WINDOW_BITS {
            return true;
        }
        (self.mask >> diff) & 1 == 1
    }

    /// Mark `id` as received, shifting the window forward when `id` exceeds
    /// the head.
    pub fn mark_received(&mut self, id: u64) {
        if id == 0 {
            return;
        }
        if id > self.head {
            let diff = id - self.head;
            if diff >= WINDOW_BITS {
                self.mask = 1;
            } else {
                self.mask <<= diff;
                self.mask |= 1;
            }
            self.head = id;
        } else {
            let diff = self.head - id;
            if diff < WINDOW_BITS {
                self.mask |= 1u64 << diff;
            }
        }
    }

    /// Force the head without window semantics (non-windowed nonce
    /// tracking).
    pub fn force_head(&mut self, id: u64) {
        self.head = id;
        self.mask = 1;
    }

    /// Reset to empty.
    pub fn reset(&mut self) {
        self.head = 0;
        self.mask = 0;
    }

    /// Contiguous received ranges, highest first, for SACK emission.
    #[must_use]
    pub fn received_ranges(&self) -> Vec<SeqRange> {
        let mut ranges = Vec::new();
        if self.head == 0 {
            return ranges;
        }
        let mut current = SeqRange {
            from: self.head,
            to: self.head,
        };
        let mut in_range = true;
        for k in 1..WINDOW_BITS {
            let Some(id) = self.head.checked_sub(k) else {
                break;
            };
            if id == 0 {
                break;
            }
            let have = (self.mask >> k) & 1 == 1;
            if have {
                if in_range {
                    current.from = id;
                } else {
                    in_range = true;
                    current = SeqRange { from: id, to: id };
                }
            } else if in_range {
                ranges.push(current);
                in_range = false;
            }
        }
        if in_range {
            ranges.push(current);
        }
        ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_accept() {
        let mut w = ReplayWindow::new();
        for id in 1..=10 {
            assert!(!w.has_received(id));
            w.mark_received(id);
            assert!(w.has_received(id));
        }
        assert_eq!(w.head(), 10);
    }

    #[test]
    fn test_id_zero_always_seen() {
        let w = ReplayWindow::new();
        assert!(w.has_received(0));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut w = ReplayWindow::new();
        w.mark_received(10);
        assert!(!w.has_received(5));
        w.mark_received(5);
        assert!(w.has_received(5));
        assert_eq!(w.head(), 10);
    }

    #[test]
    fn test_too_old_treated_as_seen() {
        let mut w = ReplayWindow::new();
        w.mark_received(100);
        // 100 - 64 = 36 is the oldest trackable id
        assert!(w.has_received(36));
        assert!(!w.has_received(37));
        assert!(w.has_received(1));
    }

    #[test]
    fn test_large_jump_resets_mask() {
        let mut w = ReplayWindow::new();
        for id in 1..=5 {
            w.mark_received(id);
        }
        w.mark_received(1000);
        assert_eq!(w.head(), 1000);
        assert!(w.has_received(1000));
        assert!(!w.has_received(999));
        assert!(w.has_received(5)); // far below the window: treated as seen
    }

    #[test]
    fn test_received_ranges_with_holes() {
        let mut w = ReplayWindow::new();
        for id in [1u64, 2, 3, 5, 6, 8, 9, 10] {
            w.mark_received(id);
        }
        let ranges = w.received_ranges();
        assert_eq!(
            ranges,
            vec![
                SeqRange { from: 8, to: 10 },
                SeqRange { from: 5, to: 6 },
                SeqRange { from: 1, to: 3 },
            ]
        );
    }

    #[test]
    fn test_received_ranges_empty() {
        assert!(ReplayWindow::new().received_ranges().is_empty());
    }

    #[test]
    fn test_received_ranges_single_head() {
        let mut w = ReplayWindow::new();
        w.mark_received(42);
        assert_eq!(w.received_ranges(), vec![SeqRange { from: 42, to: 42 }]);
    }

    #[test]
    fn test_force_head() {
        let mut w = ReplayWindow::new();
        w.force_head(7);
        assert_eq!(w.head(), 7);
        w.force_head(8);
        assert_eq!(w.head(), 8);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn prop_window_agrees_with_set_model(
                ids in prop::collection::vec(1u64..200, 1..64)
            ) {
                let mut w = ReplayWindow::new();
                let mut seen = BTreeSet::new();
                for &id in &ids {
                    let fresh = !w.has_received(id);
                    let head = w.head();
                    if fresh {
                        // Fresh ids are genuinely unseen and within reach.
                        prop_assert!(!seen.contains(&id) || head.saturating_sub(id) >= WINDOW_BITS);
                        w.mark_received(id);
                        seen.insert(id);
                        prop_assert!(w.has_received(id));
                    } else {
                        // Seen ids are either recorded or below the window.
                        prop_assert!(seen.contains(&id) || head.saturating_sub(id) >= WINDOW_BITS);
                    }
                }
            }

            #[test]
            fn prop_ranges_cover_exactly_recorded_ids(
                ids in prop::collection::btree_set(1u64..64, 1..32)
            ) {
                let mut w = ReplayWindow::new();
                for &id in &ids {
                    w.mark_received(id);
                }
                let mut covered = BTreeSet::new();
                for range in w.received_ranges() {
                    for id in range.from..=range.to {
                        covered.insert(id);
                    }
                }
                // All marked ids are within 63 of the max, so coverage is exact.
                prop_assert_eq!(covered, ids);
            }
        }
    }
}
