//! Per-flow byte accounting for the current window.
//!
//! Writers add under a short critical section; the scheduler swaps the whole
//! map out in one step, so every add lands in exactly one window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::domain::FlowKey;

#[derive(Debug, Default)]
pub struct FlowAggregator {
    flows: Mutex<HashMap<FlowKey, u64>>,
}

impl FlowAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `length` bytes for the flow `source -> destination`.
    pub fn add(&self, source: &str, destination: &str, length: u64) {
        let key = FlowKey::new(source, destination);
        let mut flows = self.lock();
        let total = flows.entry(key).or_insert(0);
        *total = total.saturating_add(length);
    }

    /// Take everything accumulated so far and start a fresh window.
    pub fn drain_all(&self) -> HashMap<FlowKey, u64> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of distinct flows in the current window.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A writer panicking mid-add leaves at worst one counter short; the map
    // itself is still usable.
    fn lock(&self) -> MutexGuard<'_, HashMap<FlowKey, u64>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn adds_for_one_key_sum_up() {
        let agg = FlowAggregator::new();
        let lengths = [60u64, 1500, 0, 40, 9000];
        for len in lengths {
            agg.add("10.0.0.1", "10.0.0.2", len);
        }

        let drained = agg.drain_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(
            drained[&FlowKey::new("10.0.0.1", "10.0.0.2")],
            lengths.iter().sum::<u64>()
        );
    }

    #[test]
    fn direction_is_part_of_the_key() {
        let agg = FlowAggregator::new();
        agg.add("a", "b", 10);
        agg.add("b", "a", 20);

        let drained = agg.drain_all();
        assert_eq!(drained[&FlowKey::new("a", "b")], 10);
        assert_eq!(drained[&FlowKey::new("b", "a")], 20);
    }

    #[test]
    fn drain_resets_the_window() {
        let agg = FlowAggregator::new();
        agg.add("a", "b", 100);
        agg.add("c", "d", 200);

        assert_eq!(agg.drain_all().len(), 2);
        assert!(agg.is_empty());
        assert!(agg.drain_all().is_empty());

        agg.add("a", "b", 5);
        assert_eq!(agg.drain_all()[&FlowKey::new("a", "b")], 5);
    }

    #[test]
    fn concurrent_adds_lose_nothing() {
        let agg = Arc::new(FlowAggregator::new());
        let threads = 8;
        let per_thread = 10_000u64;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        agg.add("src", "dst", 3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = agg.drain_all();
        assert_eq!(drained[&FlowKey::new("src", "dst")], threads * per_thread * 3);
    }

    #[test]
    fn drains_racing_adds_count_every_byte_once() {
        let agg = Arc::new(FlowAggregator::new());
        let writers = 4;
        let per_writer = 20_000u64;

        let handles: Vec<_> = (0..writers)
            .map(|w| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    let dst = format!("dst-{}", w % 2);
                    for _ in 0..per_writer {
                        agg.add("src", &dst, 1);
                    }
                })
            })
            .collect();

        let mut seen = 0u64;
        while handles.iter().any(|h| !h.is_finished()) {
            seen += agg.drain_all().values().sum::<u64>();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        seen += agg.drain_all().values().sum::<u64>();

        assert_eq!(seen, writers * per_writer);
    }
}
