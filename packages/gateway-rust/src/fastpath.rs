//! Fast-path registry: call-frequency tracking and direct dispatch.
//!
//! Every dispatch is counted in a fixed rolling window per operation. An
//! operation that reaches the promotion threshold within one window becomes
//! hot; a hot operation whose finished window fell below the demotion
//! threshold goes cold again. Hot operations are served through a direct
//! function that skips the result cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use capgate_core::{Arguments, OperationKey, Value};
use dashmap::DashMap;

use crate::config::HotnessConfig;

/// Dispatches a hot operation straight to its pinned module.
pub type DirectFn = Arc<dyn Fn(&Arguments) -> anyhow::Result<Value> + Send + Sync>;

/// Effect of one recorded call on an operation's hotness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotnessChange {
    Unchanged,
    Promoted,
    Demoted,
}

#[derive(Debug, Clone, Copy)]
struct HotnessCounter {
    window_start: u64,
    call_count: u32,
    hot: bool,
}

impl HotnessCounter {
    /// Moves the window forward to contain `now`. Returns the call count of
    /// the window that just finished, or `None` if `now` is still inside the
    /// current window. A gap of two or more windows finishes with zero calls.
    fn roll(&mut self, now: u64, window_ms: u64) -> Option<u32> {
        let window_ms = window_ms.max(1);
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed < window_ms {
            return None;
        }
        let finished = if elapsed >= window_ms.saturating_mul(2) {
            0
        } else {
            self.call_count
        };
        self.window_start += (elapsed / window_ms) * window_ms;
        self.call_count = 0;
        Some(finished)
    }
}

pub struct FastPathRegistry {
    config: HotnessConfig,
    counters: DashMap<OperationKey, HotnessCounter>,
    direct: ArcSwap<HashMap<OperationKey, DirectFn>>,
}

impl FastPathRegistry {
    #[must_use]
    pub fn new(config: HotnessConfig) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            direct: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Counts one dispatch of `key` at `now`.
    pub fn record_call(&self, key: &OperationKey, now: u64) -> HotnessChange {
        if !self.config.enabled {
            return HotnessChange::Unchanged;
        }

        let change = {
            let mut counter = self
                .counters
                .entry(key.clone())
                .or_insert(HotnessCounter {
                    window_start: now,
                    call_count: 0,
                    hot: false,
                });
            let was_hot = counter.hot;

            if let Some(finished) = counter.roll(now, self.config.window_ms) {
                if counter.hot && finished < self.config.demote_threshold {
                    counter.hot = false;
                }
            }
            counter.call_count = counter.call_count.saturating_add(1);
            if !counter.hot && counter.call_count >= self.config.promote_threshold {
                counter.hot = true;
            }

            match (was_hot, counter.hot) {
                (false, true) => HotnessChange::Promoted,
                (true, false) => HotnessChange::Demoted,
                _ => HotnessChange::Unchanged,
            }
        };

        match change {
            HotnessChange::Promoted => {
                tracing::debug!(key = %key, "operation promoted to fast path");
            }
            HotnessChange::Demoted => {
                self.remove_direct(key);
                tracing::debug!(key = %key, "operation demoted from fast path");
            }
            HotnessChange::Unchanged => {}
        }
        change
    }

    #[must_use]
    pub fn is_hot(&self, key: &OperationKey) -> bool {
        self.counters.get(key).is_some_and(|c| c.hot)
    }

    /// Calls counted in the current window.
    #[must_use]
    pub fn call_count(&self, key: &OperationKey) -> u32 {
        self.counters.get(key).map_or(0, |c| c.call_count)
    }

    /// Installs the direct function for a hot operation.
    pub fn register_fast_path(&self, key: OperationKey, direct: DirectFn) {
        self.direct.rcu(|table| {
            let mut next = HashMap::clone(table);
            next.insert(key.clone(), direct.clone());
            next
        });
    }

    /// The installed direct function, if any.
    #[must_use]
    pub fn direct(&self, key: &OperationKey) -> Option<DirectFn> {
        self.direct.load().get(key).cloned()
    }

    /// Rolls every window that has elapsed without traffic. Returns the
    /// operations demoted as a result. Cold counters whose window has
    /// passed are dropped.
    pub fn sweep(&self, now: u64) -> Vec<OperationKey> {
        let window_ms = self.config.window_ms;
        let demote_threshold = self.config.demote_threshold;
        let mut demoted = Vec::new();

        self.counters.retain(|key, counter| {
            let Some(finished) = counter.roll(now, window_ms) else {
                return true;
            };
            if counter.hot && finished < demote_threshold {
                counter.hot = false;
                demoted.push(key.clone());
            }
            counter.hot || counter.call_count > 0
        });

        for key in &demoted {
            self.remove_direct(key);
            tracing::debug!(key = %key, "idle operation demoted from fast path");
        }
        demoted
    }

    /// Hot operations, sorted.
    #[must_use]
    pub fn hot_keys(&self) -> Vec<OperationKey> {
        let mut keys: Vec<_> = self
            .counters
            .iter()
            .filter(|c| c.hot)
            .map(|c| c.key().clone())
            .collect();
        keys.sort();
        keys
    }

    fn remove_direct(&self, key: &OperationKey) {
        if !self.direct.load().contains_key(key) {
            return;
        }
        self.direct.rcu(|table| {
            let mut next = HashMap::clone(table);
            next.remove(key);
            next
        });
    }
}

impl fmt::Debug for FastPathRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FastPathRegistry")
            .field("tracked", &self.counters.len())
            .field("direct", &self.direct.load().len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use capgate_core::Interface;

    use super::*;

    const GET: OperationKey = OperationKey::new(Interface::Cache, "get");
    const SEND: OperationKey = OperationKey::new(Interface::Notify, "send");

    fn registry() -> FastPathRegistry {
        FastPathRegistry::new(HotnessConfig::default())
    }

    fn echo() -> DirectFn {
        Arc::new(|_args: &Arguments| Ok(Value::from("direct")))
    }

    #[test]
    fn promotes_on_threshold_call() {
        let fp = registry();
        for _ in 0..19 {
            assert_eq!(fp.record_call(&GET, 0), HotnessChange::Unchanged);
        }
        assert!(!fp.is_hot(&GET));
        assert_eq!(fp.record_call(&GET, 0), HotnessChange::Promoted);
        assert!(fp.is_hot(&GET));
        assert_eq!(fp.record_call(&GET, 0), HotnessChange::Unchanged);
        assert!(!fp.is_hot(&SEND));
    }

    #[test]
    fn calls_spread_over_windows_do_not_promote() {
        let fp = registry();
        for i in 0..40 {
            fp.record_call(&GET, i * 4_000);
        }
        assert!(!fp.is_hot(&GET));
    }

    #[test]
    fn busy_window_keeps_key_hot() {
        let fp = registry();
        for _ in 0..20 {
            fp.record_call(&GET, 0);
        }
        assert_eq!(fp.record_call(&GET, 60_000), HotnessChange::Unchanged);
        assert!(fp.is_hot(&GET));
    }

    #[test]
    fn quiet_window_demotes() {
        let fp = registry();
        for _ in 0..20 {
            fp.record_call(&GET, 0);
        }
        // Finish the next window with 4 calls, under the demotion threshold.
        for _ in 0..4 {
            fp.record_call(&GET, 61_000);
        }
        assert_eq!(fp.record_call(&GET, 121_000), HotnessChange::Demoted);
        assert!(!fp.is_hot(&GET));
    }

    #[test]
    fn long_gap_demotes() {
        let fp = registry();
        for _ in 0..20 {
            fp.record_call(&GET, 0);
        }
        fp.register_fast_path(GET, echo());
        assert_eq!(fp.record_call(&GET, 500_000), HotnessChange::Demoted);
        assert!(fp.direct(&GET).is_none());
    }

    #[test]
    fn direct_function_round_trip() {
        let fp = registry();
        assert!(fp.direct(&GET).is_none());
        fp.register_fast_path(GET, echo());
        let f = fp.direct(&GET).unwrap();
        assert_eq!(f(&Arguments::new()).unwrap(), Value::from("direct"));
    }

    #[test]
    fn sweep_demotes_idle_hot_keys() {
        let fp = registry();
        for _ in 0..20 {
            fp.record_call(&GET, 0);
        }
        fp.record_call(&SEND, 0);
        fp.register_fast_path(GET, echo());

        assert!(fp.sweep(30_000).is_empty());
        assert_eq!(fp.sweep(120_000), vec![GET]);
        assert!(fp.hot_keys().is_empty());
        assert!(fp.direct(&GET).is_none());
        assert_eq!(fp.call_count(&SEND), 0);
    }

    #[test]
    fn disabled_registry_never_promotes() {
        let fp = FastPathRegistry::new(HotnessConfig {
            enabled: false,
            ..HotnessConfig::default()
        });
        for _ in 0..100 {
            assert_eq!(fp.record_call(&GET, 0), HotnessChange::Unchanged);
        }
        assert!(!fp.is_hot(&GET));
    }

    #[test]
    fn hot_keys_are_sorted() {
        let fp = registry();
        for _ in 0..20 {
            fp.record_call(&SEND, 0);
            fp.record_call(&GET, 0);
        }
        assert_eq!(fp.hot_keys(), vec![GET, SEND]);
    }
}
