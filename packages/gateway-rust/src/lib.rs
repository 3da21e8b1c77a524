//! capgate gateway: lazy capability loading, result caching, unload
//! scheduling, fast-path dispatch, and budget enforcement behind a single
//! [`Gateway::execute`] entry point.

pub mod budget;
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fastpath;
pub mod invocation;
pub mod loader;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod telemetry;
pub mod worker;

pub use budget::{BudgetDecision, BudgetGuard, BudgetState, CounterBudget, CounterPriority};
pub use cache::{CacheKey, CacheStats, ResultCache};
pub use config::GatewayConfig;
pub use diagnostics::GatewayStatus;
pub use error::{ConfigError, GatewayError, RegistryError, RetryHint, UnloadError};
pub use fastpath::{DirectFn, FastPathRegistry, HotnessChange};
pub use invocation::{GatewayService, Invocation};
pub use loader::ModuleLoader;
pub use middleware::{build_gateway_pipeline, MetricsLayer};
pub use registry::{ModuleCategory, ModuleDescriptor, OperationRegistry, OperationSpec};
pub use router::{Gateway, TickReport};
pub use scheduler::{CacheDependencyPolicy, LifecycleState, UnloadPolicy, UnloadScheduler};
pub use worker::{spawn_maintenance, BackgroundWorker, MaintenanceTask};
