//! End-to-end gateway behavior under simulated time.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capgate_core::{args, Arguments, CapabilityModule, Interface, ManualClock, OperationKey, Value};
use capgate_gateway::{
    CacheDependencyPolicy, Gateway, GatewayConfig, GatewayError, ModuleCategory,
    ModuleDescriptor, OperationRegistry, OperationSpec, UnloadPolicy,
};
use proptest::prelude::*;

const CACHE_GET: OperationKey = OperationKey::new(Interface::Cache, "get");
const NOTIFY_SEND: OperationKey = OperationKey::new(Interface::Notify, "send");
const HTTP_GET: OperationKey = OperationKey::new(Interface::Http, "get");
const CHECK: OperationKey = OperationKey::new(Interface::Validation, "check");

const POLICIES: [CacheDependencyPolicy; 3] = [
    CacheDependencyPolicy::Orphan,
    CacheDependencyPolicy::Invalidate,
    CacheDependencyPolicy::Defer,
];

/// Echoes its arguments back, tagged with the operation, and counts calls.
struct Echo {
    name: &'static str,
    calls: Arc<AtomicU32>,
}

impl CapabilityModule for Echo {
    fn name(&self) -> &'static str {
        self.name
    }

    fn call(&self, operation: &str, args: &Arguments) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = args.clone();
        out.insert("op".into(), Value::from(operation));
        Ok(Value::Map(out))
    }
}

struct Harness {
    gateway: Gateway,
    clock: ManualClock,
    calls: Arc<AtomicU32>,
}

impl Harness {
    fn new(policy: CacheDependencyPolicy) -> Self {
        Self::with_config(policy, |_| {})
    }

    fn with_config(policy: CacheDependencyPolicy, tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let calls = Arc::new(AtomicU32::new(0));
        let echo = |name: &'static str, category: ModuleCategory| {
            let calls = calls.clone();
            ModuleDescriptor::new(name, category, move || {
                Ok(Echo {
                    name,
                    calls: calls.clone(),
                })
            })
        };

        let registry = OperationRegistry::builder()
            .module(echo("cache", ModuleCategory::Core))
            .module(echo("validation", ModuleCategory::Core))
            .module(
                echo("notify", ModuleCategory::Feature)
                    .with_policy(UnloadPolicy::IdleTimeout { idle_ms: 30_000 }),
            )
            .module(echo("http", ModuleCategory::Conditional))
            .operation(OperationSpec::new(CACHE_GET, "cache"))
            .operation(OperationSpec::new(CHECK, "validation"))
            .operation(OperationSpec::new(NOTIFY_SEND, "notify"))
            .operation(OperationSpec::new(HTTP_GET, "http").with_ttl(Duration::from_secs(10)))
            .build()
            .unwrap();

        let mut config = GatewayConfig::default();
        config.cache.dependency_policy = policy;
        tweak(&mut config);

        let clock = ManualClock::new(1_000_000);
        let gateway = Gateway::with_clock(registry, config, Arc::new(clock.clone())).unwrap();
        Self {
            gateway,
            clock,
            calls,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn key_arg(n: i64) -> Arguments {
    args([("k", Value::Int(n))])
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[test]
fn cache_hit_never_executes_module() {
    for policy in POLICIES {
        let h = Harness::new(policy);
        let first = h.gateway.execute(&CHECK, &key_arg(1)).unwrap();
        for _ in 0..5 {
            assert_eq!(h.gateway.execute(&CHECK, &key_arg(1)).unwrap(), first);
        }
        assert_eq!(h.calls(), 1, "{policy:?}");
    }
}

#[test]
fn argument_order_does_not_split_cache() {
    let h = Harness::new(CacheDependencyPolicy::Orphan);
    let forward = args([("a", Value::Int(1)), ("b", Value::Int(2))]);
    let reverse = args([("b", Value::Int(2)), ("a", Value::Int(1))]);
    h.gateway.execute(&CHECK, &forward).unwrap();
    h.gateway.execute(&CHECK, &reverse).unwrap();
    assert_eq!(h.calls(), 1);
}

// ---------------------------------------------------------------------------
// Unload policies
// ---------------------------------------------------------------------------

#[test]
fn core_module_stays_loaded_for_a_thousand_calls() {
    for policy in POLICIES {
        let h = Harness::new(policy);
        for i in 0..1000 {
            h.gateway.execute(&CACHE_GET, &key_arg(i % 37)).unwrap();
            h.clock.advance(Duration::from_millis(700));
            assert!(h.gateway.is_loaded("cache"), "{policy:?} call {i}");
        }
        h.gateway.tick();
        assert!(h.gateway.is_loaded("cache"));
        assert_eq!(h.gateway.loader().load_count("cache"), 1);
    }
}

#[test]
fn immediate_policy_follows_dependency_policy() {
    for policy in POLICIES {
        let h = Harness::new(policy);
        h.gateway.execute(&HTTP_GET, &key_arg(1)).unwrap();

        match policy {
            CacheDependencyPolicy::Orphan => {
                assert!(!h.gateway.is_loaded("http"));
                assert!(h.gateway.cached(&HTTP_GET, &key_arg(1)).is_some());
            }
            CacheDependencyPolicy::Invalidate => {
                assert!(!h.gateway.is_loaded("http"));
                assert!(h.gateway.cached(&HTTP_GET, &key_arg(1)).is_none());
            }
            CacheDependencyPolicy::Defer => {
                assert!(h.gateway.is_loaded("http"));
                h.clock.advance(Duration::from_secs(10));
                h.gateway.tick();
                assert!(!h.gateway.is_loaded("http"));
            }
        }
    }
}

#[test]
fn notify_unloads_after_idle_timeout() {
    for policy in POLICIES {
        let h = Harness::new(policy);
        let msg = args([("to", Value::from("ops")), ("body", Value::from("disk full"))]);
        let sent = h.gateway.execute(&NOTIFY_SEND, &msg).unwrap();
        assert!(h.gateway.is_loaded("notify"));

        h.clock.advance(Duration::from_secs(29));
        h.gateway.tick();
        assert!(h.gateway.is_loaded("notify"), "{policy:?} unloaded early");

        h.clock.advance(Duration::from_secs(2));
        h.gateway.tick();

        match policy {
            CacheDependencyPolicy::Orphan => {
                assert!(!h.gateway.is_loaded("notify"));
                // The cached result still answers without reloading.
                assert_eq!(h.gateway.execute(&NOTIFY_SEND, &msg).unwrap(), sent);
                assert!(!h.gateway.is_loaded("notify"));
                assert_eq!(h.gateway.loader().load_count("notify"), 1);
            }
            CacheDependencyPolicy::Invalidate => {
                assert!(!h.gateway.is_loaded("notify"));
                assert!(h.gateway.cached(&NOTIFY_SEND, &msg).is_none());
            }
            CacheDependencyPolicy::Defer => {
                // Feature results live 30 minutes; the module waits for them.
                assert!(h.gateway.is_loaded("notify"));
                h.clock.advance(Duration::from_secs(30 * 60));
                h.gateway.tick();
                assert!(!h.gateway.is_loaded("notify"));
            }
        }
        assert_eq!(h.calls(), 1);
    }
}

#[test]
fn unload_is_idempotent() {
    for policy in POLICIES {
        let h = Harness::new(policy);
        h.gateway.execute(&NOTIFY_SEND, &key_arg(1)).unwrap();
        h.gateway.invalidate_module("notify");

        assert!(h.gateway.unload("notify").unwrap());
        assert!(!h.gateway.unload("notify").unwrap());
        assert!(!h.gateway.unload("notify").unwrap());
        assert!(!h.gateway.is_loaded("notify"));

        // And the module comes back on demand.
        h.gateway.execute(&NOTIFY_SEND, &key_arg(2)).unwrap();
        assert!(h.gateway.is_loaded("notify"));
        assert_eq!(h.gateway.loader().load_count("notify"), 2);
    }
}

// ---------------------------------------------------------------------------
// Fast path
// ---------------------------------------------------------------------------

#[test]
fn twentieth_call_promotes_and_twenty_first_bypasses_cache() {
    for policy in POLICIES {
        let h = Harness::new(policy);
        for _ in 0..20 {
            h.gateway.execute(&HTTP_GET, &key_arg(1)).unwrap();
        }
        assert!(h.gateway.fast_paths().is_hot(&HTTP_GET));
        // The promoting call pins the module, so its result outlives the
        // release under every dependency policy.
        assert!(h.gateway.cached(&HTTP_GET, &key_arg(1)).is_some());
        let before = h.calls();

        h.gateway.execute(&HTTP_GET, &key_arg(1)).unwrap();
        assert_eq!(h.calls(), before + 1, "{policy:?}: 21st call must reach the module");
        assert!(h.gateway.is_loaded("http"));
        assert_eq!(h.gateway.status().paths.fast_path, 1);
    }
}

#[test]
fn fast_path_matches_normal_path() {
    let hot = Harness::new(CacheDependencyPolicy::Orphan);
    for _ in 0..20 {
        hot.gateway.execute(&CHECK, &key_arg(0)).unwrap();
    }
    assert!(hot.gateway.fast_paths().is_hot(&CHECK));

    let cold = Harness::with_config(CacheDependencyPolicy::Orphan, |c| c.hotness.enabled = false);
    for n in 1..25 {
        let a = args([("k", Value::Int(n)), ("s", Value::from(format!("v{n}")))]);
        assert_eq!(
            hot.gateway.execute(&CHECK, &a).unwrap(),
            cold.gateway.execute(&CHECK, &a).unwrap()
        );
    }
    assert_eq!(hot.gateway.status().paths.fast_path, 24);
    assert_eq!(cold.gateway.status().paths.fast_path, 0);
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[test]
fn hundred_and_first_call_is_refused() {
    for policy in POLICIES {
        let h = Harness::with_config(policy, |c| c.budget.max_invocations = 100);
        for i in 0..100 {
            h.gateway.execute(&CHECK, &key_arg(i)).unwrap();
        }
        let before = h.calls();

        let err = h.gateway.execute(&CHECK, &key_arg(1000)).unwrap_err();
        assert!(err.is_budget_exceeded(), "{policy:?}");
        assert!(matches!(
            err,
            GatewayError::BudgetExceeded {
                projected: 101,
                limit: 100,
                ..
            }
        ));
        assert_eq!(h.calls(), before);
        assert_eq!(h.gateway.budget().state().invocation_count, 100);

        // Cached results are refused too; nothing is served past the ceiling.
        assert!(h.gateway.execute(&CHECK, &key_arg(1)).is_err());
    }
}

proptest! {
    #[test]
    fn budget_consumption_is_monotonic(ops in prop::collection::vec((0usize..4, 0i64..6), 1..150)) {
        let h = Harness::with_config(CacheDependencyPolicy::Orphan, |c| c.budget.max_invocations = 60);
        let keys = [CACHE_GET, CHECK, NOTIFY_SEND, HTTP_GET];
        let mut last = h.gateway.budget().state();

        for (k, arg) in ops {
            let outcome = h.gateway.execute(&keys[k], &key_arg(arg));
            let now = h.gateway.budget().state();
            prop_assert!(now.invocation_count >= last.invocation_count);
            prop_assert!(now.compute_units_consumed >= last.compute_units_consumed);
            prop_assert!(now.invocation_count <= 60);
            if let Err(err) = outcome {
                prop_assert!(err.is_budget_exceeded());
                prop_assert_eq!(now.invocation_count, last.invocation_count);
            }
            last = now;
            h.clock.advance(Duration::from_millis(250));
        }
    }
}
