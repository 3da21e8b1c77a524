//! Module loader: on-demand instantiation and reference counting.
//!
//! The loader never decides to unload anything. `release` only records that
//! a caller is done; whether the module should leave memory is the
//! [`UnloadScheduler`](crate::scheduler::UnloadScheduler)'s call, and it
//! performs the actual drop through [`ModuleLoader::unload`].

use std::sync::Arc;

use capgate_core::{CapabilityModule, ClockSource};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::{GatewayError, UnloadError};
use crate::registry::{ModuleCategory, OperationRegistry};

/// A resident module instance and its bookkeeping.
pub struct ModuleRecord {
    pub name: &'static str,
    /// Owned by the record; dropped when the record is removed.
    pub instance: Arc<dyn CapabilityModule>,
    pub category: ModuleCategory,
    pub load_time: u64,
    pub last_use_time: u64,
    pub reference_count: u32,
    pub footprint_bytes: u64,
}

/// Point-in-time copy of a [`ModuleRecord`] without the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRecordSnapshot {
    pub name: &'static str,
    pub category: ModuleCategory,
    pub load_time: u64,
    pub last_use_time: u64,
    pub reference_count: u32,
    pub footprint_bytes: u64,
    /// Times this module has been instantiated over the process lifetime.
    pub load_count: u64,
}

/// Loads modules through their registered factories and tracks residency.
pub struct ModuleLoader {
    registry: Arc<OperationRegistry>,
    clock: Arc<dyn ClockSource>,
    records: DashMap<&'static str, ModuleRecord>,
    /// Survives unloads so reloads are visible in diagnostics.
    load_counts: DashMap<&'static str, u64>,
}

impl ModuleLoader {
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            registry,
            clock,
            records: DashMap::new(),
            load_counts: DashMap::new(),
        }
    }

    /// Returns the resident instance of `name`, loading it first if needed,
    /// and takes one reference on it.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ModuleLoad` if the module is not registered or
    /// its factory fails. No record is created in that case.
    pub fn acquire(&self, name: &str) -> Result<Arc<dyn CapabilityModule>, GatewayError> {
        let now = self.clock.now();
        if let Some(mut record) = self.records.get_mut(name) {
            record.reference_count += 1;
            record.last_use_time = now;
            return Ok(record.instance.clone());
        }

        let descriptor = self.registry.module(name).ok_or_else(|| GatewayError::ModuleLoad {
            module: name.to_string(),
            source: anyhow::anyhow!("module is not registered"),
        })?;

        let instance = (descriptor.factory)().map_err(|source| GatewayError::ModuleLoad {
            module: name.to_string(),
            source,
        })?;
        if instance.name() != descriptor.name {
            return Err(GatewayError::ModuleLoad {
                module: name.to_string(),
                source: anyhow::anyhow!(
                    "factory produced module `{}` instead",
                    instance.name()
                ),
            });
        }

        *self.load_counts.entry(descriptor.name).or_insert(0) += 1;
        tracing::debug!(module = descriptor.name, "module loaded");

        let mut record = self
            .records
            .entry(descriptor.name)
            .or_insert_with(|| ModuleRecord {
                name: descriptor.name,
                instance,
                category: descriptor.category,
                load_time: now,
                last_use_time: now,
                reference_count: 0,
                footprint_bytes: descriptor.footprint_bytes,
            });
        record.reference_count += 1;
        Ok(record.instance.clone())
    }

    /// Drops one reference. Returns the remaining count, or `None` if the
    /// module is not resident. Never unloads.
    pub fn release(&self, name: &str) -> Option<u32> {
        let mut record = self.records.get_mut(name)?;
        record.reference_count = record.reference_count.saturating_sub(1);
        record.last_use_time = self.clock.now();
        Some(record.reference_count)
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Current reference count; 0 when not resident.
    #[must_use]
    pub fn reference_count(&self, name: &str) -> u32 {
        self.records.get(name).map_or(0, |r| r.reference_count)
    }

    #[must_use]
    pub fn load_count(&self, name: &str) -> u64 {
        self.load_counts.get(name).map_or(0, |c| *c)
    }

    /// Removes the resident instance of `name`.
    ///
    /// Returns `Ok(false)` when the module is not resident (a no-op). The
    /// module's `on_unload` hook runs first; if it fails, the record is kept.
    ///
    /// # Errors
    ///
    /// - `UnloadError::InUse` while references are outstanding
    /// - `UnloadError::Hook` when the module's unload hook fails
    pub fn unload(&self, name: &str) -> Result<bool, UnloadError> {
        let instance = {
            let Some(record) = self.records.get(name) else {
                return Ok(false);
            };
            if record.reference_count > 0 {
                return Err(UnloadError::InUse {
                    module: name.to_string(),
                    references: record.reference_count,
                });
            }
            record.instance.clone()
        };

        instance.on_unload().map_err(|source| UnloadError::Hook {
            module: name.to_string(),
            source,
        })?;

        let removed = self
            .records
            .remove_if(name, |_, record| record.reference_count == 0)
            .is_some();
        if removed {
            tracing::debug!(module = name, "module unloaded");
        }
        Ok(removed)
    }

    /// Sum of the footprints of all resident modules.
    #[must_use]
    pub fn resident_footprint_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.footprint_bytes).sum()
    }

    /// Names of resident modules.
    #[must_use]
    pub fn loaded(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.records.iter().map(|r| r.name).collect();
        names.sort_unstable();
        names
    }

    /// Snapshot of all resident records, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ModuleRecordSnapshot> {
        let mut out: Vec<_> = self
            .records
            .iter()
            .map(|r| ModuleRecordSnapshot {
                name: r.name,
                category: r.category,
                load_time: r.load_time,
                last_use_time: r.last_use_time,
                reference_count: r.reference_count,
                footprint_bytes: r.footprint_bytes,
                load_count: self.load_count(r.name),
            })
            .collect();
        out.sort_unstable_by_key(|r| r.name);
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
