mod ledger;
mod reconcile;
mod usage;

pub use ledger::{BalanceStatement, BalanceStore, EventKind, EventRef, StatementReason};
pub use reconcile::{Reconciler, Reconciliation, UserLocks};
pub use usage::{
    estimate_cost, flat_cost, weighted_cost, QuotaRateSource, QuotaRates, ResourceUsageSample,
    TaskCost, UsageSource,
};
