//! Out-of-order receive buffer.

use std::collections::BTreeMap;

/// Byte ranges received beyond the next expected offset.
///
/// Ranges are kept disjoint and non-adjacent: inserting a range that touches
/// existing ones merges them.
#[derive(Debug, Clone, Default)]
pub struct Reassembly {
    /// start -> end (exclusive)
    ranges: BTreeMap<u64, u64>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `[start, end)` as received.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut start = start;
        let mut end = end;

        // Merge with a range that starts before and reaches `start`.
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        // Absorb ranges starting inside the new one.
        let absorbed: Vec<u64> = self.ranges.range(start..=end).map(|(&s, _)| s).collect();
        for s in absorbed {
            if let Some(e) = self.ranges.remove(&s) {
                end = end.max(e);
            }
        }
        self.ranges.insert(start, end);
    }

    /// Consume ranges contiguous with `next` and return the new next
    /// expected offset.
    pub fn advance(&mut self, next: u64) -> u64 {
        let mut next = next;
        while let Some((&s, &e)) = self.ranges.iter().next() {
            if s > next {
                break;
            }
            self.ranges.remove(&s);
            next = next.max(e);
        }
        next
    }

    /// Bytes held out of order.
    pub fn buffered_bytes(&self) -> u64 {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_fill() {
        let mut r = Reassembly::new();
        r.insert(11, 21);
        r.insert(31, 41);
        assert_eq!(r.buffered_bytes(), 20);

        // Nothing contiguous with 1
        assert_eq!(r.advance(1), 1);

        // Filling the first hole releases the first range only
        assert_eq!(r.advance(11), 21);
        assert_eq!(r.buffered_bytes(), 10);
        assert_eq!(r.advance(31), 41);
        assert!(r.is_empty());
    }

    #[test]
    fn test_merge_overlapping_and_adjacent() {
        let mut r = Reassembly::new();
        r.insert(10, 20);
        r.insert(20, 30);
        r.insert(15, 25);
        r.insert(40, 50);
        r.insert(5, 45);
        assert_eq!(r.buffered_bytes(), 45);
        assert_eq!(r.advance(5), 50);
    }

    #[test]
    fn test_advance_skips_stale_ranges() {
        let mut r = Reassembly::new();
        r.insert(10, 20);
        assert_eq!(r.advance(30), 30);
        assert!(r.is_empty());
    }
}
