//! Priority queue of pending texture loads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::coord::TileCoordinate;

/// Stale heap entries tolerated before the heap is compacted.
const STALE_SLACK: usize = 64;

#[derive(Clone, Copy, Debug)]
struct QueueEntry {
    coord: TileCoordinate,
    priority: f64,
    /// Insertion sequence; also tells live entries from stale ones.
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // `BinaryHeap` is a max-heap: the lowest priority value (then the oldest
    // entry) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending loads ordered by ascending priority value (lower = more urgent).
///
/// Each coordinate is queued at most once. Removal and re-prioritization
/// leave stale heap entries behind that are skipped on pop.
#[derive(Default)]
pub struct LoadQueue {
    heap: BinaryHeap<QueueEntry>,
    /// Live sequence number per queued coordinate.
    live: FxHashMap<TileCoordinate, u64>,
    next_seq: u64,
}

impl LoadQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `coord`. Returns `false` if it is already queued.
    pub fn push(&mut self, coord: TileCoordinate, priority: f64) -> bool {
        if self.live.contains_key(&coord) {
            return false;
        }
        self.insert(coord, priority);
        true
    }

    /// Remove and return the most urgent coordinate.
    pub fn pop(&mut self) -> Option<TileCoordinate> {
        while let Some(entry) = self.heap.pop() {
            if self.live.get(&entry.coord) == Some(&entry.seq) {
                self.live.remove(&entry.coord);
                return Some(entry.coord);
            }
        }
        None
    }

    /// Drop `coord` from the queue. Returns `true` if it was queued.
    pub fn remove(&mut self, coord: &TileCoordinate) -> bool {
        let removed = self.live.remove(coord).is_some();
        if self.live.is_empty() {
            self.heap.clear();
        } else if self.heap.len() > 2 * self.live.len() + STALE_SLACK {
            let live = &self.live;
            self.heap.retain(|entry| live.get(&entry.coord) == Some(&entry.seq));
        }
        removed
    }

    /// Whether `coord` is queued.
    pub fn contains(&self, coord: &TileCoordinate) -> bool {
        self.live.contains_key(coord)
    }

    /// Number of queued coordinates.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Drop every queued coordinate.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Recompute every queued priority with `priority_of` and rebuild the heap.
    ///
    /// Relative insertion order is kept for equal priorities.
    pub fn reprioritize(&mut self, mut priority_of: impl FnMut(&TileCoordinate) -> f64) {
        let mut live: Vec<(TileCoordinate, u64)> =
            self.live.iter().map(|(coord, seq)| (*coord, *seq)).collect();
        live.sort_unstable_by_key(|(_, seq)| *seq);

        self.heap.clear();
        self.live.clear();
        for (coord, _) in live {
            let priority = priority_of(&coord);
            self.insert(coord, priority);
        }
    }

    fn insert(&mut self, coord: TileCoordinate, priority: f64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(coord, seq);
        self.heap.push(QueueEntry {
            coord,
            priority,
            seq,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord(column: u32) -> TileCoordinate {
        TileCoordinate::new(4, column, 0).unwrap()
    }

    #[test]
    fn test_pops_lowest_priority_first() {
        let mut queue = LoadQueue::new();
        queue.push(coord(0), 30.0);
        queue.push(coord(1), 10.0);
        queue.push(coord(2), 20.0);

        assert_eq!(queue.pop(), Some(coord(1)));
        assert_eq!(queue.pop(), Some(coord(2)));
        assert_eq!(queue.pop(), Some(coord(0)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let mut queue = LoadQueue::new();
        for c in 0..5 {
            queue.push(coord(c), 1.0);
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(order, (0..5).map(coord).collect::<Vec<_>>());
    }

    #[test]
    fn test_duplicate_push_rejected() {
        let mut queue = LoadQueue::new();
        assert!(queue.push(coord(0), 5.0));
        assert!(!queue.push(coord(0), 1.0));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_removed_entry_is_skipped() {
        let mut queue = LoadQueue::new();
        queue.push(coord(0), 1.0);
        queue.push(coord(1), 2.0);
        assert!(queue.remove(&coord(0)));
        assert!(!queue.remove(&coord(0)));
        assert!(!queue.contains(&coord(0)));
        assert_eq!(queue.pop(), Some(coord(1)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_after_remove() {
        let mut queue = LoadQueue::new();
        queue.push(coord(0), 1.0);
        queue.push(coord(1), 2.0);
        queue.remove(&coord(0));
        assert!(queue.push(coord(0), 3.0));
        assert_eq!(queue.pop(), Some(coord(1)));
        assert_eq!(queue.pop(), Some(coord(0)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_reprioritize_reorders() {
        let mut queue = LoadQueue::new();
        queue.push(coord(0), 1.0);
        queue.push(coord(1), 2.0);
        queue.push(coord(2), 3.0);

        queue.reprioritize(|c| -f64::from(c.column()));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop(), Some(coord(2)));
        assert_eq!(queue.pop(), Some(coord(1)));
        assert_eq!(queue.pop(), Some(coord(0)));
    }

    #[test]
    fn test_nan_priority_does_not_panic() {
        let mut queue = LoadQueue::new();
        queue.push(coord(0), f64::NAN);
        queue.push(coord(1), 1.0);
        assert_eq!(queue.len(), 2);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_some());
    }
}
