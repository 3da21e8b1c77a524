//! Read-only status reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::budget::{BudgetState, BudgetUsage, CounterSnapshot};
use crate::cache::CacheStats;
use crate::loader::ModuleRecordSnapshot;
use crate::registry::ModuleCategory;
use crate::scheduler::{LifecycleState, ScheduleSnapshot, UnloadPolicy};

/// How invocations were served since startup.
#[derive(Debug, Default)]
pub struct PathCounters {
    fast_path: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    module_executions: AtomicU64,
    failures: AtomicU64,
    refused: AtomicU64,
}

/// Which counter in [`PathCounters`] to bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    FastPath,
    CacheHit,
    CacheMiss,
    ModuleExecution,
    Failure,
    Refused,
}

impl PathCounters {
    pub fn record(&self, path: ExecutionPath) {
        let counter = match path {
            ExecutionPath::FastPath => &self.fast_path,
            ExecutionPath::CacheHit => &self.cache_hits,
            ExecutionPath::CacheMiss => &self.cache_misses,
            ExecutionPath::ModuleExecution => &self.module_executions,
            ExecutionPath::Failure => &self.failures,
            ExecutionPath::Refused => &self.refused,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ExecutionPaths {
        ExecutionPaths {
            fast_path: self.fast_path.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            module_executions: self.module_executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPaths {
    pub fast_path: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub module_executions: u64,
    pub failures: u64,
    pub refused: u64,
}

/// One registered module as seen by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStatus {
    pub name: &'static str,
    pub category: ModuleCategory,
    pub lifecycle: LifecycleState,
    pub configured_policy: UnloadPolicy,
    pub effective_policy: UnloadPolicy,
    pub pinned: bool,
    pub loaded: bool,
    pub reference_count: u32,
    pub load_count: u64,
    pub last_use_time: Option<u64>,
}

impl ModuleStatus {
    /// Joins a schedule with the loader's record for the same module.
    #[must_use]
    pub fn new(
        schedule: ScheduleSnapshot,
        record: Option<&ModuleRecordSnapshot>,
        load_count: u64,
    ) -> Self {
        Self {
            name: schedule.name,
            category: schedule.category,
            lifecycle: schedule.lifecycle,
            configured_policy: schedule.configured_policy,
            effective_policy: schedule.effective_policy,
            pinned: schedule.pinned,
            loaded: record.is_some(),
            reference_count: record.map_or(0, |r| r.reference_count),
            load_count,
            last_use_time: record.map(|r| r.last_use_time),
        }
    }
}

/// Snapshot returned by [`Gateway::status`](crate::router::Gateway::status).
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub modules: Vec<ModuleStatus>,
    pub cache: CacheStats,
    pub budget: BudgetState,
    pub budget_usage: BudgetUsage,
    pub counters: CounterSnapshot,
    /// Hot operations, as `interface.operation`.
    pub fast_path: Vec<String>,
    pub paths: ExecutionPaths,
    pub memory_estimate_bytes: u64,
    pub unloads: u64,
    pub unload_failures: u64,
}

impl GatewayStatus {
    /// Names of resident modules.
    #[must_use]
    pub fn loaded_modules(&self) -> Vec<&'static str> {
        self.modules
            .iter()
            .filter(|m| m.loaded)
            .map(|m| m.name)
            .collect()
    }
}
