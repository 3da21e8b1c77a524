//! Operation registry: the closed `(interface, operation) -> module` table.
//!
//! Built once at startup from an explicit list of module descriptors and
//! operation specs, then frozen. There is no runtime discovery: an operation
//! that was not registered here does not exist.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use capgate_core::{CapabilityModule, OperationKey};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::scheduler::UnloadPolicy;

// ---------------------------------------------------------------------------
// ModuleCategory
// ---------------------------------------------------------------------------

/// Residency class of a capability module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleCategory {
    /// Always resident once loaded. Must use [`UnloadPolicy::Never`].
    Core,
    /// Optional capability used regularly; results cached longest.
    Feature,
    /// Capability only some invocations need.
    Conditional,
}

impl ModuleCategory {
    /// Unload policy a module of this category gets unless told otherwise.
    #[must_use]
    pub fn default_policy(self) -> UnloadPolicy {
        match self {
            ModuleCategory::Core => UnloadPolicy::Never,
            ModuleCategory::Feature => UnloadPolicy::IdleTimeout { idle_ms: 5 * 60_000 },
            ModuleCategory::Conditional => UnloadPolicy::Immediate,
        }
    }
}

// ---------------------------------------------------------------------------
// ModuleDescriptor
// ---------------------------------------------------------------------------

/// Creates a fresh module instance. Invoked by the loader on first use and
/// again after every unload.
pub type ModuleFactory =
    Arc<dyn Fn() -> anyhow::Result<Arc<dyn CapabilityModule>> + Send + Sync>;

/// Static description of a loadable capability module.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub category: ModuleCategory,
    pub policy: UnloadPolicy,
    /// Estimated resident size of one instance, for the memory-pressure check.
    pub footprint_bytes: u64,
    pub factory: ModuleFactory,
}

impl ModuleDescriptor {
    /// Describes a module with its category's default policy.
    pub fn new<F, M>(name: &'static str, category: ModuleCategory, factory: F) -> Self
    where
        F: Fn() -> anyhow::Result<M> + Send + Sync + 'static,
        M: CapabilityModule + 'static,
    {
        Self {
            name,
            category,
            policy: category.default_policy(),
            footprint_bytes: 64 * 1024,
            factory: Arc::new(move || -> anyhow::Result<Arc<dyn CapabilityModule>> {
                Ok(Arc::new(factory()?))
            }),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UnloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_footprint(mut self, bytes: u64) -> Self {
        self.footprint_bytes = bytes;
        self
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("policy", &self.policy)
            .field("footprint_bytes", &self.footprint_bytes)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// OperationSpec
// ---------------------------------------------------------------------------

/// Static description of one operation and the module that owns it.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub key: OperationKey,
    pub module: &'static str,
    /// Whether successful results are stored in the result cache.
    pub cacheable: bool,
    /// Overrides the category default TTL.
    pub ttl: Option<Duration>,
    /// Compute units charged to the budget per invocation.
    pub estimated_cost: u64,
}

impl OperationSpec {
    #[must_use]
    pub fn new(key: OperationKey, module: &'static str) -> Self {
        Self {
            key,
            module,
            cacheable: true,
            ttl: None,
            estimated_cost: 1,
        }
    }

    #[must_use]
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_cost(mut self, units: u64) -> Self {
        self.estimated_cost = units;
        self
    }
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Frozen lookup table from operation keys to their owning modules.
#[derive(Debug)]
pub struct OperationRegistry {
    operations: HashMap<OperationKey, OperationSpec>,
    modules: HashMap<&'static str, ModuleDescriptor>,
    /// Registration order, for deterministic diagnostics.
    module_order: Vec<&'static str>,
}

impl OperationRegistry {
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Looks up an operation. `None` means the key is outside the namespace.
    #[must_use]
    pub fn operation(&self, key: &OperationKey) -> Option<&OperationSpec> {
        self.operations.get(key)
    }

    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.modules.get(name)
    }

    /// Module descriptors in registration order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.module_order.iter().filter_map(|name| self.modules.get(name))
    }

    /// Operations owned by `module`.
    pub fn operations_of<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a OperationSpec> {
        self.operations.values().filter(move |spec| spec.module == module)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Collects modules and operations, then validates them into an
/// [`OperationRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    modules: Vec<ModuleDescriptor>,
    operations: Vec<OperationSpec>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn module(mut self, descriptor: ModuleDescriptor) -> Self {
        self.modules.push(descriptor);
        self
    }

    #[must_use]
    pub fn operation(mut self, spec: OperationSpec) -> Self {
        self.operations.push(spec);
        self
    }

    /// Validates and freezes the table.
    ///
    /// # Errors
    ///
    /// - `DuplicateModule` / `DuplicateOperation` for repeated registrations
    /// - `UnknownModule` when an operation names a module that was not registered
    /// - `CoreModuleNotResident` when a core module has an evictable policy
    pub fn build(self) -> Result<OperationRegistry, RegistryError> {
        let mut modules = HashMap::with_capacity(self.modules.len());
        let mut module_order = Vec::with_capacity(self.modules.len());
        for descriptor in self.modules {
            if descriptor.category == ModuleCategory::Core && descriptor.policy != UnloadPolicy::Never
            {
                return Err(RegistryError::CoreModuleNotResident {
                    module: descriptor.name,
                    policy: descriptor.policy,
                });
            }
            let name = descriptor.name;
            if modules.insert(name, descriptor).is_some() {
                return Err(RegistryError::DuplicateModule(name));
            }
            module_order.push(name);
        }

        let mut operations = HashMap::with_capacity(self.operations.len());
        for spec in self.operations {
            if !modules.contains_key(spec.module) {
                return Err(RegistryError::UnknownModule {
                    key: spec.key,
                    module: spec.module,
                });
            }
            let key = spec.key.clone();
            if operations.insert(key.clone(), spec).is_some() {
                return Err(RegistryError::DuplicateOperation(key));
            }
        }

        Ok(OperationRegistry {
            operations,
            modules,
            module_order,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
