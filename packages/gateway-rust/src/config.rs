//! Gateway configuration.
//!
//! Supplied once at process start and treated as immutable afterwards. Every
//! section has a `Default`, and the JSON form accepts any subset of fields:
//!
//! ```json
//! {
//!   "cache": { "dependency_policy": "invalidate" },
//!   "budget": { "max_invocations": 100 },
//!   "module_policies": { "notify": { "kind": "idle-timeout", "idle_ms": 30000 } }
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::registry::ModuleCategory;
use crate::scheduler::{CacheDependencyPolicy, UnloadPolicy};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub cache: CacheConfig,
    pub hotness: HotnessConfig,
    pub budget: BudgetConfig,
    pub memory: MemoryConfig,
    /// Per-module unload policy overrides, keyed by module name.
    pub module_policies: BTreeMap<String, UnloadPolicy>,
}

impl GatewayConfig {
    /// Parses a JSON document, filling unspecified fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed JSON and any error from
    /// [`GatewayConfig::validate`].
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field consistency.
    ///
    /// Module names in `module_policies` are checked later, against the
    /// registry, when the gateway is built.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.hotness;
        if h.window_ms == 0 {
            return Err(ConfigError::invalid("hotness.window_ms", "must be positive"));
        }
        if h.promote_threshold == 0 {
            return Err(ConfigError::invalid(
                "hotness.promote_threshold",
                "must be positive",
            ));
        }
        if h.demote_threshold > h.promote_threshold {
            return Err(ConfigError::invalid(
                "hotness.demote_threshold",
                "must not exceed promote_threshold",
            ));
        }

        let b = &self.budget;
        if b.soft_limit_percent == 0 || b.soft_limit_percent > 100 {
            return Err(ConfigError::invalid(
                "budget.soft_limit_percent",
                "must be within 1..=100",
            ));
        }
        if b.window_ms == 0 {
            return Err(ConfigError::invalid("budget.window_ms", "must be positive"));
        }
        if b.max_counters == 0 {
            return Err(ConfigError::invalid("budget.max_counters", "must be positive"));
        }

        if self.cache.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "must be positive"));
        }
        if self.memory.check_every_invocations == 0 {
            return Err(ConfigError::invalid(
                "memory.check_every_invocations",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL for operations owned by core modules.
    pub core_ttl_ms: u64,
    /// Default TTL for operations owned by feature modules.
    pub feature_ttl_ms: u64,
    /// Default TTL for operations owned by conditional modules.
    pub conditional_ttl_ms: u64,
    /// Maximum number of live entries.
    pub max_entries: usize,
    /// What happens to cache entries when their owning module unloads.
    pub dependency_policy: CacheDependencyPolicy,
}

impl CacheConfig {
    /// Default TTL for the given module category.
    #[must_use]
    pub fn ttl_for(&self, category: ModuleCategory) -> Duration {
        let ms = match category {
            ModuleCategory::Core => self.core_ttl_ms,
            ModuleCategory::Feature => self.feature_ttl_ms,
            ModuleCategory::Conditional => self.conditional_ttl_ms,
        };
        Duration::from_millis(ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            core_ttl_ms: 60_000,
            feature_ttl_ms: 30 * 60_000,
            conditional_ttl_ms: 5 * 60_000,
            max_entries: 4096,
            dependency_policy: CacheDependencyPolicy::default(),
        }
    }
}

/// Fast-path promotion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotnessConfig {
    /// Disables promotion entirely when false.
    pub enabled: bool,
    /// Length of the rolling window.
    pub window_ms: u64,
    /// Calls within one window that promote an operation.
    pub promote_threshold: u32,
    /// A hot operation whose finished window saw fewer calls than this is demoted.
    pub demote_threshold: u32,
}

impl Default for HotnessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            promote_threshold: 20,
            demote_threshold: 5,
        }
    }
}

/// Budget ceilings for one accounting window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Hard ceiling on invocations per window.
    pub max_invocations: u64,
    /// Hard ceiling on estimated compute units per window.
    pub max_compute_units: u64,
    /// Soft ceiling as a percentage of each hard ceiling.
    pub soft_limit_percent: u8,
    /// Accounting window length. Defaults to 30 days.
    pub window_ms: u64,
    /// Maximum number of distinct named observability counters.
    pub max_counters: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_invocations: 1_000_000,
            max_compute_units: 400_000,
            soft_limit_percent: 90,
            window_ms: 30 * 24 * 60 * 60 * 1000,
            max_counters: 16,
        }
    }
}

/// Memory-pressure valve settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Estimated resident bytes (module footprints plus cached values) above
    /// which all eligible modules are unloaded.
    pub threshold_bytes: u64,
    /// The estimate is taken once every this many invocations.
    pub check_every_invocations: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: 96 * 1024 * 1024,
            check_every_invocations: 16,
        }
    }
}
