//! The gateway: single entry point composing registry, loader, cache,
//! scheduler, fast path, and budget.
//!
//! One invocation runs in a fixed order:
//!
//! 1. due unloads are processed, idle hot operations are demoted once per
//!    hotness window, and every few calls memory is checked
//! 2. the key is resolved; unknown keys fail with `OperationNotFound`
//! 3. the budget is charged; refusal fails before any module work
//! 4. the call is counted for hotness; hot operations dispatch directly
//! 5. the result cache is consulted
//! 6. on a miss the owning module is acquired and executed, the result
//!    cached, and the module released back to the scheduler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use capgate_core::{
    Arguments, CapabilityModule, ClockSource, Fingerprint, OperationKey, SystemClock, Value,
};

use crate::budget::{BudgetGuard, CounterPriority};
use crate::cache::{CacheKey, ResultCache};
use crate::config::GatewayConfig;
use crate::diagnostics::{ExecutionPath, GatewayStatus, ModuleStatus, PathCounters};
use crate::error::{ConfigError, GatewayError, UnloadError};
use crate::fastpath::{DirectFn, FastPathRegistry, HotnessChange};
use crate::loader::ModuleLoader;
use crate::registry::{ModuleCategory, OperationRegistry, OperationSpec};
use crate::scheduler::UnloadScheduler;

/// What one explicit maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    pub unloaded: usize,
    pub demoted: Vec<OperationKey>,
    pub expired: usize,
}

/// Runtime context shared by every invocation in the process.
pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<OperationRegistry>,
    clock: Arc<dyn ClockSource>,
    loader: ModuleLoader,
    cache: ResultCache,
    scheduler: UnloadScheduler,
    fast_paths: FastPathRegistry,
    budget: BudgetGuard,
    paths: PathCounters,
    invocations_since_memory_check: AtomicU64,
    last_hotness_sweep: AtomicU64,
}

impl Gateway {
    /// Builds a gateway on the system clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configuration is inconsistent or its
    /// module policy overrides do not fit the registry.
    pub fn new(registry: OperationRegistry, config: GatewayConfig) -> Result<Self, ConfigError> {
        Self::with_clock(registry, config, Arc::new(SystemClock))
    }

    /// Builds a gateway on an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`Gateway::new`].
    pub fn with_clock(
        registry: OperationRegistry,
        config: GatewayConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry = Arc::new(registry);
        let scheduler = UnloadScheduler::new(
            &registry,
            &config.module_policies,
            config.cache.dependency_policy,
        )?;

        tracing::info!(
            operations = registry.len(),
            modules = registry.modules().count(),
            dependency_policy = ?config.cache.dependency_policy,
            "gateway initialized"
        );

        Ok(Self {
            loader: ModuleLoader::new(registry.clone(), clock.clone()),
            cache: ResultCache::new(config.cache.max_entries),
            fast_paths: FastPathRegistry::new(config.hotness.clone()),
            budget: BudgetGuard::new(config.budget.clone()),
            paths: PathCounters::default(),
            invocations_since_memory_check: AtomicU64::new(0),
            last_hotness_sweep: AtomicU64::new(clock.now()),
            scheduler,
            registry,
            clock,
            config,
        })
    }

    /// Runs one operation.
    ///
    /// # Errors
    ///
    /// - `OperationNotFound` for keys outside the registry
    /// - `BudgetExceeded` when the call would cross a hard ceiling
    /// - `ModuleLoad` when the owning module cannot be instantiated
    /// - `Execution` carrying the module's own error
    pub fn execute(&self, key: &OperationKey, args: &Arguments) -> Result<Value, GatewayError> {
        let now = self.clock.now();
        self.maintain(now);

        let Some(spec) = self.registry.operation(key) else {
            self.paths.record(ExecutionPath::Failure);
            return Err(GatewayError::OperationNotFound { key: key.clone() });
        };

        let warnings = match self.budget.record_invocation(spec.estimated_cost, now).into_result() {
            Ok(warnings) => warnings,
            Err(err) => {
                self.paths.record(ExecutionPath::Refused);
                self.count("capgate.invocations.refused", CounterPriority::High);
                return Err(err);
            }
        };
        let aggressive = !warnings.is_empty();
        self.count("capgate.invocations", CounterPriority::Critical);
        self.count(&format!("capgate.op.{key}"), CounterPriority::Low);

        let was_hot = self.fast_paths.is_hot(key);
        let change = self.fast_paths.record_call(key, now);
        match change {
            HotnessChange::Promoted => self.scheduler.pin(spec.module),
            HotnessChange::Demoted => {
                self.scheduler
                    .unpin(spec.module, now, &self.loader, &self.cache);
            }
            HotnessChange::Unchanged => {}
        }

        let result = if was_hot && change != HotnessChange::Demoted {
            self.dispatch_direct(spec, args)
        } else {
            self.dispatch(spec, args, now, aggressive)
        };

        if let Err(err) = &result {
            self.paths.record(ExecutionPath::Failure);
            self.count("capgate.errors", CounterPriority::High);
            tracing::debug!(key = %key, kind = err.kind(), error = %err, "invocation failed");
        }
        result
    }

    /// Cache, then module.
    fn dispatch(
        &self,
        spec: &OperationSpec,
        args: &Arguments,
        now: u64,
        aggressive: bool,
    ) -> Result<Value, GatewayError> {
        let cache_key = CacheKey::new(spec.key.clone(), Fingerprint::of(args));
        if spec.cacheable {
            if let Some(value) = self.cache.get(&cache_key, now) {
                self.paths.record(ExecutionPath::CacheHit);
                self.count("capgate.cache.hits", CounterPriority::High);
                tracing::trace!(key = %spec.key, fingerprint = %cache_key.fingerprint.short(), "cache hit");
                return Ok(value);
            }
            self.paths.record(ExecutionPath::CacheMiss);
            self.count("capgate.cache.misses", CounterPriority::High);
        }

        let module = self.loader.acquire(spec.module)?;
        self.scheduler.on_acquire(spec.module);
        self.paths.record(ExecutionPath::ModuleExecution);
        self.count("capgate.dispatch.module", CounterPriority::Normal);

        let result = module.call(&spec.key.operation, args);
        drop(module);

        if let (Ok(value), true) = (&result, spec.cacheable) {
            let ttl = spec.ttl.unwrap_or_else(|| self.config.cache.ttl_for(self.category_of(spec)));
            self.cache
                .set(cache_key, value.clone(), ttl, Some(spec.module), now);
        }

        self.release(spec.module, aggressive);

        result.map_err(|source| GatewayError::Execution {
            key: spec.key.clone(),
            source,
        })
    }

    /// Straight to the pinned module, installing the direct function on
    /// first use.
    fn dispatch_direct(&self, spec: &OperationSpec, args: &Arguments) -> Result<Value, GatewayError> {
        let direct = match self.fast_paths.direct(&spec.key) {
            Some(direct) => direct,
            None => self.install_direct(spec)?,
        };
        self.paths.record(ExecutionPath::FastPath);
        self.count("capgate.dispatch.fast_path", CounterPriority::Normal);

        direct(args).map_err(|source| GatewayError::Execution {
            key: spec.key.clone(),
            source,
        })
    }

    fn install_direct(&self, spec: &OperationSpec) -> Result<DirectFn, GatewayError> {
        let module: Arc<dyn CapabilityModule> = self.loader.acquire(spec.module)?;
        self.scheduler.on_acquire(spec.module);

        let operation = spec.key.operation.clone();
        let direct: DirectFn = Arc::new(move |args: &Arguments| module.call(&operation, args));
        self.fast_paths
            .register_fast_path(spec.key.clone(), direct.clone());
        tracing::debug!(key = %spec.key, module = spec.module, "fast path installed");

        self.release(spec.module, false);
        Ok(direct)
    }

    fn release(&self, module: &'static str, aggressive: bool) {
        if let Some(remaining) = self.loader.release(module) {
            self.scheduler.on_release(
                module,
                remaining,
                self.clock.now(),
                aggressive,
                &self.loader,
                &self.cache,
            );
        }
    }

    fn category_of(&self, spec: &OperationSpec) -> ModuleCategory {
        self.registry
            .module(spec.module)
            .map_or(ModuleCategory::Feature, |d| d.category)
    }

    fn count(&self, name: &str, priority: CounterPriority) {
        self.budget.counters().increment(name, priority, 1);
    }

    /// Per-invocation housekeeping: due unloads, a hotness sweep once per
    /// `hotness.window_ms`, and the memory check every
    /// `memory.check_every_invocations` calls.
    fn maintain(&self, now: u64) {
        self.scheduler.tick(now, &self.loader, &self.cache);
        let last_sweep = self.last_hotness_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last_sweep) >= self.config.hotness.window_ms
            && self
                .last_hotness_sweep
                .compare_exchange(last_sweep, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            self.demote_idle(now);
        }
        let seen = self
            .invocations_since_memory_check
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if seen % self.config.memory.check_every_invocations == 0 {
            self.relieve_if_over(now);
        }
    }

    /// Demotes hot operations whose window went quiet and releases their
    /// modules' pins.
    fn demote_idle(&self, now: u64) -> Vec<OperationKey> {
        let demoted = self.fast_paths.sweep(now);
        for key in &demoted {
            if let Some(spec) = self.registry.operation(key) {
                self.scheduler
                    .unpin(spec.module, now, &self.loader, &self.cache);
            }
        }
        demoted
    }

    fn relieve_if_over(&self, now: u64) -> Vec<&'static str> {
        let estimate = self.memory_estimate_bytes();
        if estimate <= self.config.memory.threshold_bytes {
            return Vec::new();
        }
        let unloaded = self
            .scheduler
            .relieve_memory_pressure(now, &self.loader, &self.cache);
        tracing::warn!(
            estimate,
            threshold = self.config.memory.threshold_bytes,
            unloaded = unloaded.len(),
            "memory pressure relieved"
        );
        unloaded
    }

    // -- maintenance and inspection -----------------------------------------

    /// Runs a full maintenance pass: due unloads, idle fast-path demotion,
    /// and expired cache entries.
    pub fn tick(&self) -> TickReport {
        let now = self.clock.now();
        self.last_hotness_sweep.store(now, Ordering::Relaxed);
        let demoted = self.demote_idle(now);
        let unloaded = self.scheduler.tick(now, &self.loader, &self.cache);
        let expired = self.cache.purge_expired(now);
        TickReport {
            unloaded,
            demoted,
            expired,
        }
    }

    /// Checks the memory estimate now and unloads idle modules if it is over
    /// the threshold. Returns the modules unloaded.
    pub fn check_memory_pressure(&self) -> Vec<&'static str> {
        self.relieve_if_over(self.clock.now())
    }

    /// Resident module footprints plus cached value sizes.
    #[must_use]
    pub fn memory_estimate_bytes(&self) -> u64 {
        let cache_bytes = u64::try_from(self.cache.estimated_bytes()).unwrap_or(u64::MAX);
        self.loader
            .resident_footprint_bytes()
            .saturating_add(cache_bytes)
    }

    /// Drops every cached result owned by `module`.
    pub fn invalidate_module(&self, module: &str) -> usize {
        let dropped = self.cache.invalidate_module(module);
        tracing::debug!(module, dropped, "module cache invalidated");
        dropped
    }

    /// Unloads `module` now if nothing holds it. `Ok(false)` when it was
    /// not loaded, its configured policy is `never`, or the unload was
    /// deferred on live cache entries.
    ///
    /// # Errors
    ///
    /// Returns the reason the module stayed resident.
    pub fn unload(&self, module: &str) -> Result<bool, UnloadError> {
        self.scheduler
            .unload(module, self.clock.now(), &self.loader, &self.cache)
    }

    #[must_use]
    pub fn is_loaded(&self, module: &str) -> bool {
        self.loader.is_loaded(module)
    }

    /// The cached result for this call, if live. Does not count as a lookup.
    #[must_use]
    pub fn cached(&self, key: &OperationKey, args: &Arguments) -> Option<Value> {
        let cache_key = CacheKey::new(key.clone(), Fingerprint::of(args));
        self.cache.peek(&cache_key, self.clock.now())
    }

    #[must_use]
    pub fn status(&self) -> GatewayStatus {
        let records = self.loader.snapshot();
        let modules = self
            .scheduler
            .snapshot(&self.registry)
            .into_iter()
            .map(|schedule| {
                let record = records.iter().find(|r| r.name == schedule.name);
                let load_count = self.loader.load_count(schedule.name);
                ModuleStatus::new(schedule, record, load_count)
            })
            .collect();

        GatewayStatus {
            modules,
            cache: self.cache.stats(),
            budget: self.budget.state(),
            budget_usage: self.budget.usage(),
            counters: self.budget.counters().snapshot(),
            fast_path: self
                .fast_paths
                .hot_keys()
                .iter()
                .map(ToString::to_string)
                .collect(),
            paths: self.paths.snapshot(),
            memory_estimate_bytes: self.memory_estimate_bytes(),
            unloads: self.scheduler.unload_count(),
            unload_failures: self.scheduler.failure_count(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    #[must_use]
    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    #[must_use]
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    #[must_use]
    pub fn scheduler(&self) -> &UnloadScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn fast_paths(&self) -> &FastPathRegistry {
        &self.fast_paths
    }

    #[must_use]
    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use capgate_core::{args, Interface, ManualClock};

    use super::*;
    use crate::registry::ModuleDescriptor;
    use crate::scheduler::{LifecycleState, UnloadPolicy};

    const ECHO: OperationKey = OperationKey::new(Interface::Validation, "echo");
    const FAIL: OperationKey = OperationKey::new(Interface::Validation, "fail");
    const PING: OperationKey = OperationKey::new(Interface::Http, "ping");
    const SEND: OperationKey = OperationKey::new(Interface::Notify, "send");

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicU32>,
    }

    impl CapabilityModule for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        fn call(&self, operation: &str, args: &Arguments) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match operation {
                "fail" => anyhow::bail!("rejected"),
                _ => Ok(args.get("v").cloned().unwrap_or(Value::Null)),
            }
        }
    }

    /// Answers calls but never shuts down cleanly.
    struct Stubborn;

    impl CapabilityModule for Stubborn {
        fn name(&self) -> &'static str {
            "notify"
        }

        fn call(&self, _operation: &str, _args: &Arguments) -> anyhow::Result<Value> {
            Ok(Value::from("sent"))
        }

        fn on_unload(&self) -> anyhow::Result<()> {
            anyhow::bail!("outbox not flushed")
        }
    }

    struct Fixture {
        gateway: Gateway,
        clock: ManualClock,
        calls: Arc<AtomicU32>,
    }

    fn fixture(config: GatewayConfig) -> Fixture {
        let calls = Arc::new(AtomicU32::new(0));
        let (c1, c2) = (calls.clone(), calls.clone());
        let registry = OperationRegistry::builder()
            .module(ModuleDescriptor::new(
                "validation",
                ModuleCategory::Core,
                move || {
                    Ok(Counting {
                        name: "validation",
                        calls: c1.clone(),
                    })
                },
            ))
            .module(ModuleDescriptor::new("http", ModuleCategory::Conditional, move || {
                Ok(Counting {
                    name: "http",
                    calls: c2.clone(),
                })
            }))
            .module(ModuleDescriptor::new("broken", ModuleCategory::Conditional, || {
                Err::<Counting, _>(anyhow::anyhow!("no credentials"))
            }))
            .module(ModuleDescriptor::new("notify", ModuleCategory::Conditional, || {
                Ok(Stubborn)
            }))
            .operation(OperationSpec::new(ECHO, "validation"))
            .operation(OperationSpec::new(FAIL, "validation"))
            .operation(OperationSpec::new(PING, "http").with_ttl(Duration::from_secs(10)))
            .operation(OperationSpec::new(
                OperationKey::new(Interface::Storage, "put"),
                "broken",
            ))
            .operation(OperationSpec::new(SEND, "notify"))
            .build()
            .unwrap();
        let clock = ManualClock::new(0);
        let gateway = Gateway::with_clock(registry, config, Arc::new(clock.clone())).unwrap();
        Fixture {
            gateway,
            clock,
            calls,
        }
    }

    fn v(n: i64) -> Arguments {
        args([("v", Value::Int(n))])
    }

    #[test]
    fn unknown_key_is_not_found() {
        let f = fixture(GatewayConfig::default());
        let err = f
            .gateway
            .execute(&OperationKey::new(Interface::Metrics, "nope"), &v(1))
            .unwrap_err();
        assert!(matches!(err, GatewayError::OperationNotFound { .. }));
        assert_eq!(f.gateway.budget().state().invocation_count, 0);
    }

    #[test]
    fn cache_hit_skips_module() {
        let f = fixture(GatewayConfig::default());
        assert_eq!(f.gateway.execute(&ECHO, &v(7)).unwrap(), Value::Int(7));
        assert_eq!(f.gateway.execute(&ECHO, &v(7)).unwrap(), Value::Int(7));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.gateway.execute(&ECHO, &v(8)).unwrap(), Value::Int(8));
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);

        let paths = f.gateway.status().paths;
        assert_eq!(paths.cache_hits, 1);
        assert_eq!(paths.cache_misses, 2);
    }

    #[test]
    fn ttl_override_expires_entry() {
        let f = fixture(GatewayConfig::default());
        f.gateway.execute(&PING, &v(1)).unwrap();
        assert!(f.gateway.cached(&PING, &v(1)).is_some());
        f.clock.advance(Duration::from_secs(10));
        assert!(f.gateway.cached(&PING, &v(1)).is_none());
        f.gateway.execute(&PING, &v(1)).unwrap();
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn execution_error_is_propagated_and_not_cached() {
        let f = fixture(GatewayConfig::default());
        let err = f.gateway.execute(&FAIL, &v(1)).unwrap_err();
        assert!(matches!(err, GatewayError::Execution { .. }));
        assert_eq!(err.into_module_error().unwrap().to_string(), "rejected");
        assert!(f.gateway.cached(&FAIL, &v(1)).is_none());
        assert_eq!(f.gateway.loader().reference_count("validation"), 0);
        assert_eq!(f.gateway.status().paths.failures, 1);
    }

    #[test]
    fn module_load_failure_leaves_registry_usable() {
        let f = fixture(GatewayConfig::default());
        let put = OperationKey::new(Interface::Storage, "put");
        let err = f.gateway.execute(&put, &v(1)).unwrap_err();
        assert!(matches!(err, GatewayError::ModuleLoad { .. }));
        assert!(!f.gateway.is_loaded("broken"));
        assert!(f.gateway.execute(&ECHO, &v(1)).is_ok());
    }

    #[test]
    fn conditional_module_unloads_after_call() {
        let f = fixture(GatewayConfig::default());
        f.gateway.execute(&PING, &v(1)).unwrap();
        assert!(!f.gateway.is_loaded("http"));
        // Orphaned entry keeps answering.
        assert_eq!(f.gateway.execute(&PING, &v(1)).unwrap(), Value::Int(1));
        assert!(!f.gateway.is_loaded("http"));
    }

    #[test]
    fn hot_operation_bypasses_cache() {
        let f = fixture(GatewayConfig::default());
        for _ in 0..20 {
            f.gateway.execute(&PING, &v(1)).unwrap();
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        assert!(f.gateway.fast_paths().is_hot(&PING));
        assert!(f.gateway.scheduler().is_pinned("http"));

        assert_eq!(f.gateway.execute(&PING, &v(1)).unwrap(), Value::Int(1));
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert!(f.gateway.is_loaded("http"));
        assert_eq!(f.gateway.status().paths.fast_path, 1);
        assert_eq!(f.gateway.status().fast_path, vec!["http.ping".to_string()]);
    }

    #[test]
    fn demotion_unpins_module() {
        let f = fixture(GatewayConfig::default());
        for _ in 0..21 {
            f.gateway.execute(&PING, &v(1)).unwrap();
        }
        f.clock.advance(Duration::from_secs(180));
        let report = f.gateway.tick();
        assert_eq!(report.demoted, vec![PING]);
        assert!(!f.gateway.scheduler().is_pinned("http"));
        assert!(!f.gateway.is_loaded("http"));
    }

    #[test]
    fn other_traffic_demotes_idle_hot_operation() {
        let f = fixture(GatewayConfig::default());
        for _ in 0..21 {
            f.gateway.execute(&PING, &v(1)).unwrap();
        }
        assert!(f.gateway.scheduler().is_pinned("http"));

        // Two full windows pass without a single ping and no explicit tick.
        f.clock.advance(Duration::from_secs(130));
        for n in 0..10 {
            f.gateway.execute(&ECHO, &v(n)).unwrap();
        }
        assert!(!f.gateway.fast_paths().is_hot(&PING));
        assert!(f.gateway.fast_paths().direct(&PING).is_none());
        assert!(!f.gateway.scheduler().is_pinned("http"));
        assert!(!f.gateway.is_loaded("http"));
        assert!(f.gateway.status().fast_path.is_empty());
    }

    #[test]
    fn hotness_sweep_runs_at_most_once_per_window() {
        let f = fixture(GatewayConfig::default());
        for _ in 0..21 {
            f.gateway.execute(&PING, &v(1)).unwrap();
        }
        // Inside the first window nothing is swept.
        f.clock.advance(Duration::from_secs(59));
        f.gateway.execute(&ECHO, &v(1)).unwrap();
        assert!(f.gateway.scheduler().is_pinned("http"));
        assert!(f.gateway.fast_paths().is_hot(&PING));
    }

    #[test]
    fn failing_unload_hook_does_not_fail_invocation() {
        let f = fixture(GatewayConfig::default());
        assert_eq!(f.gateway.execute(&SEND, &v(1)).unwrap(), Value::from("sent"));
        assert!(f.gateway.is_loaded("notify"));
        assert_eq!(
            f.gateway.scheduler().state("notify"),
            Some(LifecycleState::Resident)
        );
        let status = f.gateway.status();
        assert_eq!(status.unload_failures, 1);
        assert_eq!(status.unloads, 0);

        // The next miss reuses the resident instance.
        assert!(f.gateway.execute(&SEND, &v(2)).is_ok());
        assert_eq!(f.gateway.loader().load_count("notify"), 1);
        assert_eq!(f.gateway.status().unload_failures, 2);
    }

    #[test]
    fn never_policy_unload_reports_nothing_unloaded() {
        let f = fixture(GatewayConfig::default());
        f.gateway.execute(&ECHO, &v(1)).unwrap();
        assert!(!f.gateway.unload("validation").unwrap());
        assert!(f.gateway.is_loaded("validation"));
        assert_eq!(f.gateway.status().unload_failures, 0);
    }

    #[test]
    fn budget_refusal_runs_nothing() {
        let mut config = GatewayConfig::default();
        config.budget.max_invocations = 3;
        let f = fixture(config);
        for n in 0..3 {
            f.gateway.execute(&ECHO, &v(n)).unwrap();
        }
        let err = f.gateway.execute(&ECHO, &v(99)).unwrap_err();
        assert!(err.is_budget_exceeded());
        assert_eq!(f.calls.load(Ordering::SeqCst), 3);
        assert_eq!(f.gateway.fast_paths().call_count(&ECHO), 3);
        assert_eq!(f.gateway.status().paths.refused, 1);
    }

    #[test]
    fn soft_ceiling_unloads_idle_modules_aggressively() {
        let mut config = GatewayConfig::default();
        config.budget.max_invocations = 10;
        config.budget.soft_limit_percent = 10;
        config
            .module_policies
            .insert("http".into(), UnloadPolicy::IdleTimeout { idle_ms: 60_000 });
        let f = fixture(config);
        f.gateway.execute(&PING, &v(1)).unwrap();
        assert!(f.gateway.is_loaded("http"));
        f.gateway.execute(&PING, &v(2)).unwrap();
        assert!(!f.gateway.is_loaded("http"));
    }

    #[test]
    fn memory_pressure_unloads_eligible_modules() {
        let mut config = GatewayConfig::default();
        config.memory.threshold_bytes = 1;
        config.memory.check_every_invocations = 1_000;
        config
            .module_policies
            .insert("http".into(), UnloadPolicy::MemoryPressure);
        let f = fixture(config);
        f.gateway.execute(&PING, &v(1)).unwrap();
        assert!(f.gateway.is_loaded("http"));
        assert_eq!(f.gateway.check_memory_pressure(), vec!["http"]);
        assert!(!f.gateway.is_loaded("http"));
    }

    #[test]
    fn invalid_override_fails_construction() {
        let mut config = GatewayConfig::default();
        config
            .module_policies
            .insert("validation".into(), UnloadPolicy::Immediate);
        let registry = OperationRegistry::builder()
            .module(ModuleDescriptor::new("validation", ModuleCategory::Core, || {
                Ok(Counting {
                    name: "validation",
                    calls: Arc::new(AtomicU32::new(0)),
                })
            }))
            .build()
            .unwrap();
        assert!(Gateway::new(registry, config).is_err());
    }

    #[test]
    fn status_serializes() {
        let f = fixture(GatewayConfig::default());
        f.gateway.execute(&ECHO, &v(1)).unwrap();
        let status = f.gateway.status();
        assert_eq!(status.loaded_modules(), vec!["validation"]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["cache"]["entries"], 1);
        assert_eq!(json["budget"]["invocation_count"], 1);
    }

    #[test]
    fn gateway_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Gateway>();
    }
}
