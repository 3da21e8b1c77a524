//! Unload scheduler: decides when an idle module leaves memory.
//!
//! Every registered module has a schedule entry from startup on. The
//! lifecycle is:
//!
//! ```text
//! Unloaded --acquire--> Resident --release(refs=0)--> Eligible | Scheduled
//!                          ^                               |
//!                          +----------- acquire -----------+
//!                                                          |
//!                                          due / pressure  v
//!                                                       Unloaded
//! ```
//!
//! Unloading is fail-open: when an attempt fails, the module stays
//! `Resident` and the failure is logged. Nothing here ever surfaces an
//! error to an invocation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::ResultCache;
use crate::error::{ConfigError, RegistryError, UnloadError};
use crate::loader::ModuleLoader;
use crate::registry::{ModuleCategory, OperationRegistry};

// ---------------------------------------------------------------------------
// Policies and states
// ---------------------------------------------------------------------------

/// When a module with no outstanding references may be unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UnloadPolicy {
    /// Stays resident for the life of the process.
    Never,
    /// Unloaded as soon as the last reference is released.
    Immediate,
    /// Unloaded once it has been idle for `idle_ms`.
    IdleTimeout { idle_ms: u64 },
    /// Unloaded only when the memory estimate crosses the threshold.
    MemoryPressure,
}

/// What happens to a module's cached results when the module unloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheDependencyPolicy {
    /// Entries outlive the module and keep answering until they expire.
    #[default]
    Orphan,
    /// Entries are dropped together with the module.
    Invalidate,
    /// The unload waits until the module's last live entry expires.
    Defer,
}

/// Residency state of one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleState {
    Resident,
    /// Idle and unloadable, waiting for memory pressure.
    Eligible,
    Scheduled { due_at: u64 },
    Unloaded,
}

struct ModuleSchedule {
    category: ModuleCategory,
    configured: UnloadPolicy,
    /// Hot operations owned by this module.
    pins: u32,
    state: LifecycleState,
}

impl ModuleSchedule {
    fn effective_policy(&self) -> UnloadPolicy {
        if self.pins > 0 {
            UnloadPolicy::Never
        } else {
            self.configured
        }
    }
}

/// Diagnostics view of one module's schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleSnapshot {
    pub name: &'static str,
    pub category: ModuleCategory,
    pub configured_policy: UnloadPolicy,
    pub effective_policy: UnloadPolicy,
    pub pinned: bool,
    pub lifecycle: LifecycleState,
}

enum Attempt {
    Unloaded,
    NotResident,
    /// Configured `Never`; the module stays resident.
    KeptResident,
    Deferred { until: u64 },
}

// ---------------------------------------------------------------------------
// UnloadScheduler
// ---------------------------------------------------------------------------

pub struct UnloadScheduler {
    schedules: DashMap<&'static str, ModuleSchedule>,
    dependency_policy: CacheDependencyPolicy,
    unloads: AtomicU64,
    failures: AtomicU64,
}

impl UnloadScheduler {
    /// Creates a schedule entry for every registered module, applying
    /// `overrides` on top of each descriptor's policy.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownModule` when an override names an unregistered module
    /// - `ConfigError::Registry` when an override would make a core module evictable
    pub fn new(
        registry: &OperationRegistry,
        overrides: &BTreeMap<String, UnloadPolicy>,
        dependency_policy: CacheDependencyPolicy,
    ) -> Result<Self, ConfigError> {
        for name in overrides.keys() {
            if registry.module(name).is_none() {
                return Err(ConfigError::UnknownModule(name.clone()));
            }
        }

        let schedules = DashMap::new();
        for descriptor in registry.modules() {
            let configured = overrides
                .get(descriptor.name)
                .copied()
                .unwrap_or(descriptor.policy);
            if descriptor.category == ModuleCategory::Core && configured != UnloadPolicy::Never {
                return Err(RegistryError::CoreModuleNotResident {
                    module: descriptor.name,
                    policy: configured,
                }
                .into());
            }
            schedules.insert(
                descriptor.name,
                ModuleSchedule {
                    category: descriptor.category,
                    configured,
                    pins: 0,
                    state: LifecycleState::Unloaded,
                },
            );
        }

        Ok(Self {
            schedules,
            dependency_policy,
            unloads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn dependency_policy(&self) -> CacheDependencyPolicy {
        self.dependency_policy
    }

    /// Configured policy, or `Never` while the module is pinned.
    #[must_use]
    pub fn effective_policy(&self, name: &str) -> Option<UnloadPolicy> {
        self.schedules.get(name).map(|s| s.effective_policy())
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.schedules.get(name).map(|s| s.state)
    }

    #[must_use]
    pub fn is_pinned(&self, name: &str) -> bool {
        self.schedules.get(name).is_some_and(|s| s.pins > 0)
    }

    /// Successful unloads since startup.
    #[must_use]
    pub fn unload_count(&self) -> u64 {
        self.unloads.load(Ordering::Relaxed)
    }

    /// Failed unload attempts since startup.
    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Marks `name` resident, cancelling any pending unload.
    pub fn on_acquire(&self, name: &str) {
        if let Some(mut schedule) = self.schedules.get_mut(name) {
            schedule.state = LifecycleState::Resident;
        }
    }

    /// Reacts to a release that left `remaining` references.
    ///
    /// `aggressive` treats idle timeouts as immediate; the router sets it
    /// while the budget is past its soft ceiling.
    pub fn on_release(
        &self,
        name: &str,
        remaining: u32,
        now: u64,
        aggressive: bool,
        loader: &ModuleLoader,
        cache: &ResultCache,
    ) {
        if remaining > 0 {
            return;
        }
        let due_now = {
            let Some(mut schedule) = self.schedules.get_mut(name) else {
                return;
            };
            let next = match schedule.effective_policy() {
                UnloadPolicy::Never => LifecycleState::Resident,
                UnloadPolicy::Immediate => LifecycleState::Scheduled { due_at: now },
                UnloadPolicy::IdleTimeout { .. } if aggressive => {
                    LifecycleState::Scheduled { due_at: now }
                }
                UnloadPolicy::IdleTimeout { idle_ms } => LifecycleState::Scheduled {
                    due_at: now.saturating_add(idle_ms),
                },
                UnloadPolicy::MemoryPressure => LifecycleState::Eligible,
            };
            schedule.state = next;
            (next == LifecycleState::Scheduled { due_at: now }).then_some(*schedule.key())
        };

        if let Some(name) = due_now {
            self.run_attempt(name, now, false, loader, cache);
        }
    }

    /// Processes every schedule whose due time has passed. Returns the
    /// number of modules unloaded.
    pub fn tick(&self, now: u64, loader: &ModuleLoader, cache: &ResultCache) -> usize {
        let due: Vec<&'static str> = self
            .schedules
            .iter()
            .filter(|s| matches!(s.state, LifecycleState::Scheduled { due_at } if due_at <= now))
            .map(|s| *s.key())
            .collect();

        due.into_iter()
            .filter(|name| self.run_attempt(*name, now, false, loader, cache))
            .count()
    }

    /// Unloads every idle, unpinned, non-core module regardless of its
    /// timer, after purging expired cache entries. Deferred cache
    /// dependencies are invalidated instead of waited on. Returns the
    /// names unloaded.
    pub fn relieve_memory_pressure(
        &self,
        now: u64,
        loader: &ModuleLoader,
        cache: &ResultCache,
    ) -> Vec<&'static str> {
        cache.purge_expired(now);
        let candidates: Vec<&'static str> = self
            .schedules
            .iter()
            .filter(|s| {
                s.category != ModuleCategory::Core
                    && s.pins == 0
                    && matches!(
                        s.state,
                        LifecycleState::Eligible | LifecycleState::Scheduled { .. }
                    )
            })
            .map(|s| *s.key())
            .collect();

        candidates
            .into_iter()
            .filter(|name| self.run_attempt(*name, now, true, loader, cache))
            .collect()
    }

    /// Explicitly unloads `name`, honoring pins and the cache dependency
    /// policy. Returns `Ok(false)` when there was nothing to unload, the
    /// module's configured policy is `Never`, or the unload was deferred.
    ///
    /// # Errors
    ///
    /// Returns the `UnloadError` that kept the module resident.
    pub fn unload(
        &self,
        name: &str,
        now: u64,
        loader: &ModuleLoader,
        cache: &ResultCache,
    ) -> Result<bool, UnloadError> {
        let Some(name) = self.schedules.get(name).map(|s| *s.key()) else {
            return Err(UnloadError::UnknownModule {
                module: name.to_string(),
            });
        };
        let result = self.attempt(name, now, false, loader, cache);
        self.settle(name, &result);
        match result {
            Ok(Attempt::Unloaded) => Ok(true),
            Ok(Attempt::NotResident | Attempt::KeptResident | Attempt::Deferred { .. }) => {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Pins `name` resident while one of its operations is hot.
    pub fn pin(&self, name: &str) {
        if let Some(mut schedule) = self.schedules.get_mut(name) {
            schedule.pins += 1;
            if matches!(
                schedule.state,
                LifecycleState::Eligible | LifecycleState::Scheduled { .. }
            ) {
                schedule.state = LifecycleState::Resident;
            }
            tracing::debug!(module = name, pins = schedule.pins, "module pinned");
        }
    }

    /// Drops one pin. Once the last pin is gone an idle resident module is
    /// re-evaluated under its configured policy.
    pub fn unpin(&self, name: &str, now: u64, loader: &ModuleLoader, cache: &ResultCache) {
        let unpinned = {
            let Some(mut schedule) = self.schedules.get_mut(name) else {
                return;
            };
            schedule.pins = schedule.pins.saturating_sub(1);
            tracing::debug!(module = name, pins = schedule.pins, "module unpinned");
            schedule.pins == 0
        };
        if unpinned && loader.is_loaded(name) {
            let refs = loader.reference_count(name);
            self.on_release(name, refs, now, false, loader, cache);
        }
    }

    /// Schedules in registry order.
    #[must_use]
    pub fn snapshot(&self, registry: &OperationRegistry) -> Vec<ScheduleSnapshot> {
        registry
            .modules()
            .filter_map(|d| {
                self.schedules.get(d.name).map(|s| ScheduleSnapshot {
                    name: d.name,
                    category: s.category,
                    configured_policy: s.configured,
                    effective_policy: s.effective_policy(),
                    pinned: s.pins > 0,
                    lifecycle: s.state,
                })
            })
            .collect()
    }

    // -- internals ----------------------------------------------------------

    /// Attempts an unload and records the outcome. Returns whether the
    /// module was unloaded.
    fn run_attempt(
        &self,
        name: &'static str,
        now: u64,
        force: bool,
        loader: &ModuleLoader,
        cache: &ResultCache,
    ) -> bool {
        let result = self.attempt(name, now, force, loader, cache);
        self.settle(name, &result);
        matches!(result, Ok(Attempt::Unloaded))
    }

    fn attempt(
        &self,
        name: &'static str,
        now: u64,
        force: bool,
        loader: &ModuleLoader,
        cache: &ResultCache,
    ) -> Result<Attempt, UnloadError> {
        if !loader.is_loaded(name) {
            return Ok(Attempt::NotResident);
        }
        match self.schedules.get(name).map(|s| (s.configured, s.pins)) {
            Some((UnloadPolicy::Never, _)) => return Ok(Attempt::KeptResident),
            Some((_, pins)) if pins > 0 => {
                return Err(UnloadError::Pinned {
                    module: name.to_string(),
                })
            }
            _ => {}
        }

        if self.dependency_policy == CacheDependencyPolicy::Defer && !force {
            if let Some(until) = cache.latest_expiry_for(name, now) {
                return Ok(Attempt::Deferred { until });
            }
        }

        if !loader.unload(name)? {
            return Ok(Attempt::NotResident);
        }

        let drop_entries = match self.dependency_policy {
            CacheDependencyPolicy::Orphan => false,
            CacheDependencyPolicy::Invalidate => true,
            CacheDependencyPolicy::Defer => force,
        };
        if drop_entries {
            let dropped = cache.invalidate_module(name);
            tracing::debug!(module = name, dropped, "dependent cache entries dropped");
        }
        Ok(Attempt::Unloaded)
    }

    fn settle(&self, name: &'static str, result: &Result<Attempt, UnloadError>) {
        let next = match result {
            Ok(Attempt::Unloaded) => {
                self.unloads.fetch_add(1, Ordering::Relaxed);
                tracing::info!(module = name, "module unloaded");
                LifecycleState::Unloaded
            }
            Ok(Attempt::NotResident) => LifecycleState::Unloaded,
            Ok(Attempt::KeptResident) => {
                tracing::debug!(module = name, "unload skipped; policy is never");
                LifecycleState::Resident
            }
            Ok(Attempt::Deferred { until }) => {
                tracing::debug!(module = name, until, "unload deferred on live cache entries");
                LifecycleState::Scheduled { due_at: *until }
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(module = name, error = %err, "unload failed; module stays resident");
                LifecycleState::Resident
            }
        };
        if let Some(mut schedule) = self.schedules.get_mut(name) {
            schedule.state = next;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
