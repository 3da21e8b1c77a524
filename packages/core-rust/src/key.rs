//! Operation keys: the closed `(interface, operation)` namespace.
//!
//! Keys render as `"interface.operation"` (e.g. `"notify.send"`). Interface
//! names are kebab-case so that `Interface::SmartHome` renders as
//! `"smart-home"`.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Capability interfaces exposed through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interface {
    Cache,
    Logging,
    Validation,
    Metrics,
    Http,
    Notify,
    SmartHome,
    Storage,
}

impl Interface {
    /// All interfaces, in declaration order.
    pub const ALL: [Interface; 8] = [
        Interface::Cache,
        Interface::Logging,
        Interface::Validation,
        Interface::Metrics,
        Interface::Http,
        Interface::Notify,
        Interface::SmartHome,
        Interface::Storage,
    ];

    /// Returns the wire name of this interface.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Interface::Cache => "cache",
            Interface::Logging => "logging",
            Interface::Validation => "validation",
            Interface::Metrics => "metrics",
            Interface::Http => "http",
            Interface::Notify => "notify",
            Interface::SmartHome => "smart-home",
            Interface::Storage => "storage",
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from parsing an [`Interface`] or [`OperationKey`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseKeyError {
    #[error("unknown interface: {0}")]
    UnknownInterface(String),
    #[error("operation key must have the form `interface.operation`: {0}")]
    Malformed(String),
}

impl FromStr for Interface {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interface::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| ParseKeyError::UnknownInterface(s.to_string()))
    }
}

/// Identifies one capability operation.
///
/// Immutable once built and used as a map key by every gateway component.
/// Statically known keys borrow their operation name, so building one with
/// [`OperationKey::new`] does not allocate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub interface: Interface,
    pub operation: Cow<'static, str>,
}

impl OperationKey {
    /// Builds a key with a static operation name.
    #[must_use]
    pub const fn new(interface: Interface, operation: &'static str) -> Self {
        Self {
            interface,
            operation: Cow::Borrowed(operation),
        }
    }

    /// Builds a key from an owned operation name (e.g. parsed from input).
    #[must_use]
    pub fn owned(interface: Interface, operation: impl Into<String>) -> Self {
        Self {
            interface,
            operation: Cow::Owned(operation.into()),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.interface, self.operation)
    }
}

impl FromStr for OperationKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (interface, operation) = s
            .split_once('.')
            .filter(|(i, op)| !i.is_empty() && !op.is_empty())
            .ok_or_else(|| ParseKeyError::Malformed(s.to_string()))?;
        Ok(OperationKey::owned(interface.parse()?, operation))
    }
}
