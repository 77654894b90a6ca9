/*
 * Copyright 2026 The Tiller Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An earliest-deadline-first weighted scheduler.
///
/// Each entry is queued with a virtual finish time of
/// `current_time + 1 / weight`; picking an entry advances the virtual clock
/// to its deadline. Over many picks each entry is selected in proportion to
/// its weight. Entries inserted with equal deadlines resolve in insertion
/// order, which keeps selection deterministic for tests.
#[derive(Debug)]
pub struct EdfScheduler<T> {
    heap: BinaryHeap<Entry<T>>,
    current_time: f64,
    inserted: u64,
}

#[derive(Debug)]
struct Entry<T> {
    deadline: f64,
    order: u64,
    weight: f64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline wins.
        // Weights are finite and positive, so deadlines are never NaN.
        other
            .deadline
            .partial_cmp(&self.deadline)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.order.cmp(&self.order))
    }
}

impl<T> Default for EdfScheduler<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            current_time: 0.0,
            inserted: 0,
        }
    }
}

impl<T> EdfScheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queues `item` with the given positive weight.
    pub fn add(&mut self, weight: f64, item: T) {
        debug_assert!(weight > 0.0, "scheduler weights must be positive");
        let deadline = self.current_time + 1.0 / weight;
        self.inserted += 1;
        self.heap.push(Entry {
            deadline,
            order: self.inserted,
            weight,
            item,
        });
    }

    /// Removes and returns the entry with the earliest virtual finish time
    /// along with its weight, advancing the virtual clock. Callers re-add
    /// the entry to keep it in rotation.
    pub fn pick(&mut self) -> Option<(f64, T)> {
        let entry = self.heap.pop()?;
        self.current_time = entry.deadline;
        Some((entry.weight, entry.item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn pick_counts(weights: &[(u32, f64)], picks: usize) -> HashMap<u32, usize> {
        let mut scheduler = EdfScheduler::new();
        for &(item, weight) in weights {
            scheduler.add(weight, item);
        }

        let mut counts = HashMap::new();
        for _ in 0..picks {
            let (weight, item) = scheduler.pick().unwrap();
            *counts.entry(item).or_insert(0) += 1;
            scheduler.add(weight, item);
        }
        counts
    }

    #[test]
    fn empty_scheduler_picks_nothing() {
        assert!(EdfScheduler::<u32>::new().pick().is_none());
    }

    #[test]
    fn proportional_selection() {
        let counts = pick_counts(&[(0, 1.0), (1, 2.0)], 600);
        let zero = counts[&0] as f64;
        let one = counts[&1] as f64;
        assert!((zero - 200.0).abs() <= 2.0, "locality 0 picked {zero} times");
        assert!((one - 400.0).abs() <= 2.0, "locality 1 picked {one} times");
    }

    #[test]
    fn skewed_weights() {
        // Effective weights 1*(1/5) and 2*(1/1): ratio 1:10.
        let counts = pick_counts(&[(0, 0.2), (1, 2.0)], 600);
        let zero = counts[&0] as f64;
        let one = counts[&1] as f64;
        assert!((zero - 55.0).abs() <= 5.0, "locality 0 picked {zero} times");
        assert!((one - 545.0).abs() <= 5.0, "locality 1 picked {one} times");
    }

    #[test]
    fn equal_weights_round_robin() {
        let mut scheduler = EdfScheduler::new();
        scheduler.add(1.0, "a");
        scheduler.add(1.0, "b");

        let (w, first) = scheduler.pick().unwrap();
        scheduler.add(w, first);
        let (w, second) = scheduler.pick().unwrap();
        scheduler.add(w, second);

        assert_eq!((first, second), ("a", "b"));
    }
}
