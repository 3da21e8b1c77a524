//! Budget guard: hard and soft ceilings on per-window consumption, plus a
//! fixed ceiling on distinct observability counters.

pub mod counters;
pub mod guard;

pub use counters::{CounterAdmission, CounterBudget, CounterPriority, CounterSnapshot};
pub use guard::{
    BudgetDecision, BudgetGuard, BudgetRefusal, BudgetState, BudgetUsage, BudgetWarning,
};
