//! Error taxonomy.
//!
//! [`GatewayError`] is what `execute` callers see. [`UnloadError`] is internal:
//! the scheduler logs it and keeps the module resident. [`RegistryError`] and
//! [`ConfigError`] are construction-time problems.

use std::fmt;

use capgate_core::OperationKey;
use serde::Serialize;

use crate::scheduler::UnloadPolicy;

/// Budget dimension that refused an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    Invocations,
    ComputeUnits,
}

impl fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BudgetResource::Invocations => "invocations",
            BudgetResource::ComputeUnits => "compute units",
        })
    }
}

/// How a caller should react to a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Retrying the same call cannot succeed.
    Never,
    /// Retrying may succeed; ordinary transient failure.
    Immediately,
    /// The accounting window is exhausted; back off until it rolls over.
    Backoff,
}

/// Errors returned by [`Gateway::execute`](crate::router::Gateway::execute).
///
/// Every variant aborts only the single call it was returned from.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("operation not found: {key}")]
    OperationNotFound { key: OperationKey },
    #[error("failed to load module `{module}`: {source}")]
    ModuleLoad {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{key} failed: {source}")]
    Execution {
        key: OperationKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("budget exceeded: {resource} would reach {projected} of {limit}")]
    BudgetExceeded {
        resource: BudgetResource,
        projected: u64,
        limit: u64,
    },
}

impl GatewayError {
    /// `true` when the call was refused by the budget guard before any
    /// capability work began.
    #[must_use]
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, GatewayError::BudgetExceeded { .. })
    }

    #[must_use]
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            GatewayError::OperationNotFound { .. } => RetryHint::Never,
            GatewayError::ModuleLoad { .. } | GatewayError::Execution { .. } => {
                RetryHint::Immediately
            }
            GatewayError::BudgetExceeded { .. } => RetryHint::Backoff,
        }
    }

    /// Short stable label, used as a metrics/tracing field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::OperationNotFound { .. } => "operation_not_found",
            GatewayError::ModuleLoad { .. } => "module_load",
            GatewayError::Execution { .. } => "execution",
            GatewayError::BudgetExceeded { .. } => "budget_exceeded",
        }
    }

    /// For `Execution` errors, the module's own error, unchanged.
    #[must_use]
    pub fn into_module_error(self) -> Option<anyhow::Error> {
        match self {
            GatewayError::Execution { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Why an unload attempt did not happen. Never surfaced through `execute`.
#[derive(Debug, thiserror::Error)]
pub enum UnloadError {
    #[error("module `{module}` is in use ({references} references)")]
    InUse { module: String, references: u32 },
    #[error("module `{module}` is pinned resident")]
    Pinned { module: String },
    #[error("module `{module}` is not registered")]
    UnknownModule { module: String },
    #[error("unload hook for `{module}` failed: {source}")]
    Hook {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Problems building an [`OperationRegistry`](crate::registry::OperationRegistry).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("module `{0}` registered twice")]
    DuplicateModule(&'static str),
    #[error("operation {0} registered twice")]
    DuplicateOperation(OperationKey),
    #[error("operation {key} names unregistered module `{module}`")]
    UnknownModule {
        key: OperationKey,
        module: &'static str,
    },
    #[error("core module `{module}` must use the `never` unload policy, got {policy:?}")]
    CoreModuleNotResident {
        module: &'static str,
        policy: UnloadPolicy,
    },
}

/// Problems with a [`GatewayConfig`](crate::config::GatewayConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("invalid `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("unload policy configured for unknown module `{0}`")]
    UnknownModule(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { field, reason }
    }
}

#[cfg(test)]
mod tests {
    use capgate_core::Interface;

    use super::*;

    #[test]
    fn budget_exceeded_is_distinguishable() {
        let err = GatewayError::BudgetExceeded {
            resource: BudgetResource::Invocations,
            projected: 101,
            limit: 100,
        };
        assert!(err.is_budget_exceeded());
        assert_eq!(err.retry_hint(), RetryHint::Backoff);
        assert_eq!(err.to_string(), "budget exceeded: invocations would reach 101 of 100");

        let exec = GatewayError::Execution {
            key: OperationKey::new(Interface::Http, "get"),
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(!exec.is_budget_exceeded());
        assert_eq!(exec.retry_hint(), RetryHint::Immediately);
    }

    #[test]
    fn execution_error_keeps_module_error() {
        let err = GatewayError::Execution {
            key: OperationKey::new(Interface::Validation, "check"),
            source: anyhow::anyhow!("pattern rejected"),
        };
        assert_eq!(err.to_string(), "validation.check failed: pattern rejected");
        assert_eq!(err.kind(), "execution");
        let source = err.into_module_error().unwrap();
        assert_eq!(source.to_string(), "pattern rejected");
    }

    #[test]
    fn unknown_operation_never_retries() {
        let err = GatewayError::OperationNotFound {
            key: OperationKey::new(Interface::Cache, "nope"),
        };
        assert_eq!(err.retry_hint(), RetryHint::Never);
        assert_eq!(err.to_string(), "operation not found: cache.nope");
    }
}
