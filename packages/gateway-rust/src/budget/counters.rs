//! Bounded set of named observability counters.
//!
//! Only `max_counters` distinct names are tracked at once. When the table is
//! full, a newcomer may rotate out the least important tracked counter; what
//! does not fit is folded into a per-priority overflow total so no increment
//! is silently lost.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

/// Importance of a counter. Ordered `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl CounterPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CounterPriority::Low => "low",
            CounterPriority::Normal => "normal",
            CounterPriority::High => "high",
            CounterPriority::Critical => "critical",
        }
    }
}

impl fmt::Display for CounterPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an increment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterAdmission {
    /// Counted under its own name.
    Tracked,
    /// Counted under its own name after `evicted` was rotated out.
    Rotated { evicted: String },
    /// Folded into the overflow total for its priority.
    Aggregated,
}

#[derive(Debug, Clone, Copy)]
struct TrackedCounter {
    priority: CounterPriority,
    value: u64,
}

#[derive(Debug, Default)]
struct CounterTable {
    tracked: HashMap<String, TrackedCounter>,
    overflow: BTreeMap<CounterPriority, u64>,
}

/// Point-in-time copy of the counter table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub tracked: BTreeMap<String, u64>,
    pub overflow: BTreeMap<CounterPriority, u64>,
}

pub struct CounterBudget {
    max_counters: usize,
    table: Mutex<CounterTable>,
}

impl CounterBudget {
    #[must_use]
    pub fn new(max_counters: usize) -> Self {
        Self {
            max_counters: max_counters.max(1),
            table: Mutex::new(CounterTable::default()),
        }
    }

    /// Adds `delta` to counter `name`, admitting it if there is room.
    ///
    /// When the table is full, the tracked counter with the lowest priority
    /// (ties: smallest value) is rotated out if its priority is strictly
    /// below `priority`; its value moves to the overflow total. Otherwise the
    /// increment itself goes to overflow.
    pub fn increment(&self, name: &str, priority: CounterPriority, delta: u64) -> CounterAdmission {
        let admission = {
            let mut table = self.table.lock();

            if let Some(counter) = table.tracked.get_mut(name) {
                counter.value = counter.value.saturating_add(delta);
                CounterAdmission::Tracked
            } else if table.tracked.len() < self.max_counters {
                table
                    .tracked
                    .insert(name.to_string(), TrackedCounter { priority, value: delta });
                CounterAdmission::Tracked
            } else {
                let victim = table
                    .tracked
                    .iter()
                    .min_by_key(|(_, c)| (c.priority, c.value))
                    .filter(|(_, c)| c.priority < priority)
                    .map(|(victim, _)| victim.clone());

                match victim {
                    Some(evicted) => {
                        if let Some(old) = table.tracked.remove(&evicted) {
                            *table.overflow.entry(old.priority).or_insert(0) += old.value;
                        }
                        table
                            .tracked
                            .insert(name.to_string(), TrackedCounter { priority, value: delta });
                        CounterAdmission::Rotated { evicted }
                    }
                    None => {
                        *table.overflow.entry(priority).or_insert(0) += delta;
                        CounterAdmission::Aggregated
                    }
                }
            }
        };

        match &admission {
            CounterAdmission::Tracked => {
                metrics::counter!(name.to_string()).increment(delta);
            }
            CounterAdmission::Rotated { evicted } => {
                tracing::debug!(counter = name, evicted = %evicted, "counter rotated in");
                metrics::counter!(name.to_string()).increment(delta);
            }
            CounterAdmission::Aggregated => {
                metrics::counter!("capgate.counters.overflow", "priority" => priority.as_str())
                    .increment(delta);
            }
        }
        admission
    }

    /// Number of distinct counters currently tracked.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.table.lock().tracked.len()
    }

    #[must_use]
    pub fn max_counters(&self) -> usize {
        self.max_counters
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<u64> {
        self.table.lock().tracked.get(name).map(|c| c.value)
    }

    #[must_use]
    pub fn overflow(&self, priority: CounterPriority) -> u64 {
        self.table.lock().overflow.get(&priority).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let table = self.table.lock();
        CounterSnapshot {
            tracked: table
                .tracked
                .iter()
                .map(|(name, c)| (name.clone(), c.value))
                .collect(),
            overflow: table.overflow.clone(),
        }
    }

    /// Forgets every counter and overflow total.
    pub fn reset(&self) {
        let mut table = self.table.lock();
        table.tracked.clear();
        table.overflow.clear();
    }
}

impl fmt::Debug for CounterBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterBudget")
            .field("max_counters", &self.max_counters)
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_until_full() {
        let budget = CounterBudget::new(2);
        assert_eq!(budget.increment("a", CounterPriority::Normal, 1), CounterAdmission::Tracked);
        assert_eq!(budget.increment("b", CounterPriority::Normal, 1), CounterAdmission::Tracked);
        assert_eq!(budget.increment("a", CounterPriority::Normal, 4), CounterAdmission::Tracked);
        assert_eq!(budget.value("a"), Some(5));
        assert_eq!(budget.active_count(), 2);
    }

    #[test]
    fn equal_priority_newcomer_is_aggregated() {
        let budget = CounterBudget::new(1);
        budget.increment("a", CounterPriority::Normal, 1);
        assert_eq!(
            budget.increment("b", CounterPriority::Normal, 7),
            CounterAdmission::Aggregated
        );
        assert_eq!(budget.value("b"), None);
        assert_eq!(budget.overflow(CounterPriority::Normal), 7);
    }

    #[test]
    fn higher_priority_rotates_lowest_out() {
        let budget = CounterBudget::new(3);
        budget.increment("low-big", CounterPriority::Low, 50);
        budget.increment("low-small", CounterPriority::Low, 2);
        budget.increment("high", CounterPriority::High, 1);

        let admission = budget.increment("critical", CounterPriority::Critical, 1);
        assert_eq!(
            admission,
            CounterAdmission::Rotated {
                evicted: "low-small".to_string()
            }
        );
        assert_eq!(budget.overflow(CounterPriority::Low), 2);
        assert_eq!(budget.value("critical"), Some(1));
        assert_eq!(budget.active_count(), 3);
    }

    #[test]
    fn never_exceeds_ceiling() {
        let budget = CounterBudget::new(4);
        for i in 0..50 {
            let priority = match i % 4 {
                0 => CounterPriority::Low,
                1 => CounterPriority::Normal,
                2 => CounterPriority::High,
                _ => CounterPriority::Critical,
            };
            budget.increment(&format!("c{i}"), priority, 1);
            assert!(budget.active_count() <= 4);
        }
        let snap = budget.snapshot();
        let total: u64 = snap.tracked.values().sum::<u64>() + snap.overflow.values().sum::<u64>();
        assert_eq!(total, 50);
    }

    #[test]
    fn reset_clears_everything() {
        let budget = CounterBudget::new(1);
        budget.increment("a", CounterPriority::Low, 1);
        budget.increment("b", CounterPriority::Low, 1);
        budget.reset();
        assert_eq!(budget.active_count(), 0);
        assert_eq!(budget.snapshot(), CounterSnapshot::default());
    }
}
