//! Bounded history of probe executions
//!
//! Keeps the rendered trace of the most recent runs. Entries are returned in
//! insertion order, oldest first; once the capacity is reached the oldest
//! entry is evicted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Trace of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    /// Monotonically increasing id, starting at 0
    pub id: u64,
    pub module: String,
    pub target: String,
    /// Captured logs, measurements and module configuration
    pub debug_output: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct HistoryInner {
    next_id: u64,
    results: VecDeque<HistoryEntry>,
}

/// Fixed-capacity FIFO of [`HistoryEntry`]
#[derive(Debug)]
pub struct ResultHistory {
    max_results: usize,
    inner: Mutex<HistoryInner>,
}

impl ResultHistory {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results,
            inner: Mutex::new(HistoryInner {
                next_id: 0,
                results: VecDeque::with_capacity(max_results),
            }),
        }
    }

    /// Record a run, evicting the oldest entries beyond capacity
    ///
    /// # Returns
    ///
    /// Id assigned to the entry
    pub fn add(&self, module: &str, target: &str, debug_output: String, success: bool) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        inner.results.push_back(HistoryEntry {
            id,
            module: module.to_string(),
            target: target.to_string(),
            debug_output,
            success,
            timestamp: Utc::now(),
        });
        while inner.results.len() > self.max_results {
            inner.results.pop_front();
        }
        id
    }

    /// All retained entries, oldest first
    pub fn list(&self) -> Vec<HistoryEntry> {
        self.inner.lock().results.iter().cloned().collect()
    }

    /// The `n` most recent entries, oldest first
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let inner = self.inner.lock();
        let skip = inner.results.len().saturating_sub(n);
        inner.results.iter().skip(skip).cloned().collect()
    }

    /// Entry with the given id, if still retained
    pub fn get(&self, id: u64) -> Option<HistoryEntry> {
        self.inner
            .lock()
            .results
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn targets(entries: &[HistoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.target.as_str()).collect()
    }

    #[test]
    fn test_fifo_eviction() {
        let history = ResultHistory::new(3);
        for target in ["a", "b", "c", "d"] {
            history.add("icmp_qos", target, String::new(), true);
        }

        let entries = history.list();
        assert_eq!(targets(&entries), vec!["b", "c", "d"]);
        assert_eq!(entries[0].id, 1);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn test_recent_is_insertion_ordered() {
        let history = ResultHistory::new(10);
        for target in ["a", "b", "c"] {
            history.add("icmp_qos", target, String::new(), false);
        }

        assert_eq!(targets(&history.recent(2)), vec!["b", "c"]);
        assert_eq!(targets(&history.recent(10)), vec!["a", "b", "c"]);
        assert!(history.recent(0).is_empty());
    }

    #[test]
    fn test_get_by_id() {
        let history = ResultHistory::new(1);
        let first = history.add("m", "a", "trace a".to_string(), true);
        assert_eq!(history.get(first).unwrap().debug_output, "trace a");

        let second = history.add("m", "b", "trace b".to_string(), false);
        assert!(history.get(first).is_none());
        let entry = history.get(second).unwrap();
        assert_eq!(entry.target, "b");
        assert!(!entry.success);
    }

    #[test]
    fn test_zero_capacity_retains_nothing() {
        let history = ResultHistory::new(0);
        history.add("m", "a", String::new(), true);
        assert!(history.is_empty());
    }

    #[test]
    fn test_concurrent_adds() {
        let history = Arc::new(ResultHistory::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let history = Arc::clone(&history);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        history.add("m", &format!("{}-{}", worker, i), String::new(), true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let entries = history.list();
        assert_eq!(entries.len(), 400);
        assert!(entries.windows(2).all(|pair| pair[0].id < pair[1].id));
    }
}
