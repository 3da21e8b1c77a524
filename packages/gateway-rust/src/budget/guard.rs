//! Invocation and compute-unit budget for one accounting window.

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::BudgetConfig;
use crate::error::{BudgetResource, GatewayError};

use super::counters::CounterBudget;

/// An invocation was admitted past a soft ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetWarning {
    pub resource: BudgetResource,
    pub used: u64,
    pub soft_limit: u64,
    pub hard_limit: u64,
}

/// An invocation was refused because it would cross a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetRefusal {
    pub resource: BudgetResource,
    pub projected: u64,
    pub limit: u64,
}

impl From<BudgetRefusal> for GatewayError {
    fn from(refusal: BudgetRefusal) -> Self {
        GatewayError::BudgetExceeded {
            resource: refusal.resource,
            projected: refusal.projected,
            limit: refusal.limit,
        }
    }
}

/// Outcome of [`BudgetGuard::record_invocation`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub warnings: Vec<BudgetWarning>,
    pub refusal: Option<BudgetRefusal>,
}

impl BudgetDecision {
    /// `Ok` with any warnings when allowed, the refusal as an error otherwise.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::BudgetExceeded` when the invocation was refused.
    pub fn into_result(self) -> Result<Vec<BudgetWarning>, GatewayError> {
        match self.refusal {
            Some(refusal) => Err(refusal.into()),
            None => Ok(self.warnings),
        }
    }
}

/// Consumption in the current window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BudgetState {
    pub invocation_count: u64,
    pub compute_units_consumed: u64,
    pub active_counter_count: usize,
}

/// Consumption as percentages of the hard ceilings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BudgetUsage {
    pub invocations_percent: f64,
    pub compute_units_percent: f64,
    pub counters_percent: f64,
    pub window_started_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Window {
    started_at: Option<u64>,
    invocations: u64,
    compute_units: u64,
    warned_invocations: bool,
    warned_compute: bool,
}

impl Window {
    /// Resets the counts if `now` falls outside the window. Returns true when
    /// a new window was started.
    fn roll(&mut self, now: u64, window_ms: u64) -> bool {
        let window_ms = window_ms.max(1);
        match self.started_at {
            None => {
                self.started_at = Some(now);
                false
            }
            Some(start) if now.saturating_sub(start) >= window_ms => {
                let window_start = start + ((now - start) / window_ms) * window_ms;
                *self = Window {
                    started_at: Some(window_start),
                    ..Window::default()
                };
                tracing::info!(window_start, "budget window rolled over");
                true
            }
            Some(_) => false,
        }
    }
}

/// Enforces the per-window invocation and compute ceilings.
#[derive(Debug)]
pub struct BudgetGuard {
    config: BudgetConfig,
    window: Mutex<Window>,
    counters: CounterBudget,
}

impl BudgetGuard {
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        let counters = CounterBudget::new(config.max_counters);
        Self {
            config,
            window: Mutex::new(Window::default()),
            counters,
        }
    }

    /// Charges one invocation costing `cost` compute units.
    ///
    /// Refused invocations charge nothing. Warnings are returned on every
    /// admitted invocation past a soft ceiling but logged once per window.
    pub fn record_invocation(&self, cost: u64, now: u64) -> BudgetDecision {
        let mut window = self.window.lock();
        if window.roll(now, self.config.window_ms) {
            self.counters.reset();
        }

        let projected_invocations = window.invocations.saturating_add(1);
        let projected_compute = window.compute_units.saturating_add(cost);

        let refusal = if projected_invocations > self.config.max_invocations {
            Some(BudgetRefusal {
                resource: BudgetResource::Invocations,
                projected: projected_invocations,
                limit: self.config.max_invocations,
            })
        } else if projected_compute > self.config.max_compute_units {
            Some(BudgetRefusal {
                resource: BudgetResource::ComputeUnits,
                projected: projected_compute,
                limit: self.config.max_compute_units,
            })
        } else {
            None
        };
        if let Some(refusal) = refusal {
            tracing::warn!(
                resource = %refusal.resource,
                projected = refusal.projected,
                limit = refusal.limit,
                "invocation refused by budget"
            );
            return BudgetDecision {
                allowed: false,
                warnings: Vec::new(),
                refusal: Some(refusal),
            };
        }

        window.invocations = projected_invocations;
        window.compute_units = projected_compute;

        let mut warnings = Vec::new();
        let soft_invocations = self.soft_limit(self.config.max_invocations);
        if window.invocations > soft_invocations {
            warnings.push(BudgetWarning {
                resource: BudgetResource::Invocations,
                used: window.invocations,
                soft_limit: soft_invocations,
                hard_limit: self.config.max_invocations,
            });
            if !window.warned_invocations {
                window.warned_invocations = true;
                tracing::warn!(
                    used = window.invocations,
                    soft_limit = soft_invocations,
                    "invocation budget past soft ceiling"
                );
            }
        }
        let soft_compute = self.soft_limit(self.config.max_compute_units);
        if window.compute_units > soft_compute {
            warnings.push(BudgetWarning {
                resource: BudgetResource::ComputeUnits,
                used: window.compute_units,
                soft_limit: soft_compute,
                hard_limit: self.config.max_compute_units,
            });
            if !window.warned_compute {
                window.warned_compute = true;
                tracing::warn!(
                    used = window.compute_units,
                    soft_limit = soft_compute,
                    "compute budget past soft ceiling"
                );
            }
        }

        BudgetDecision {
            allowed: true,
            warnings,
            refusal: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> BudgetState {
        let window = self.window.lock();
        BudgetState {
            invocation_count: window.invocations,
            compute_units_consumed: window.compute_units,
            active_counter_count: self.counters.active_count(),
        }
    }

    #[must_use]
    pub fn usage(&self) -> BudgetUsage {
        let state = self.state();
        let started_at = self.window.lock().started_at;
        let counters_used = u64::try_from(state.active_counter_count).unwrap_or(u64::MAX);
        let counters_max = u64::try_from(self.counters.max_counters()).unwrap_or(u64::MAX);
        BudgetUsage {
            invocations_percent: percent(state.invocation_count, self.config.max_invocations),
            compute_units_percent: percent(
                state.compute_units_consumed,
                self.config.max_compute_units,
            ),
            counters_percent: percent(counters_used, counters_max),
            window_started_at: started_at,
        }
    }

    /// The named-counter ceiling shared by the whole gateway.
    #[must_use]
    pub fn counters(&self) -> &CounterBudget {
        &self.counters
    }

    fn soft_limit(&self, hard: u64) -> u64 {
        let soft = u128::from(hard) * u128::from(self.config.soft_limit_percent) / 100;
        u64::try_from(soft).unwrap_or(hard)
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    used as f64 * 100.0 / limit as f64
}
