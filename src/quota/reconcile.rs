use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::ledger::{BalanceStatement, BalanceStore, EventRef, StatementReason};
use super::usage::{estimate_cost, QuotaRateSource, TaskCost, UsageSource};
use crate::error::{FlowError, Result};

/// Cost breakdown of one reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    pub total_cost: f64,
    pub cpu_cost: f64,
    pub memory_cost: f64,
    /// Tasks charged the flat rate
    pub fallback_count: usize,
    pub task_costs: Vec<(String, TaskCost)>,
    pub statement: BalanceStatement,
}

/// One lock per user, held across the balance read and write
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }
}

/// Charges a user for the compute consumed by a replay
///
/// Costs are priced before the balance is touched. The balance is then read
/// and written once under the user's lock, so concurrent replays for the
/// same user never lose a deduction.
pub struct Reconciler<'a> {
    usage: &'a dyn UsageSource,
    rates: &'a dyn QuotaRateSource,
    ledger: &'a dyn BalanceStore,
    locks: &'a UserLocks,
    min_samples: usize,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        usage: &'a dyn UsageSource,
        rates: &'a dyn QuotaRateSource,
        ledger: &'a dyn BalanceStore,
        locks: &'a UserLocks,
        min_samples: usize,
    ) -> Self {
        Self {
            usage,
            rates,
            ledger,
            locks,
            min_samples,
        }
    }

    pub async fn reconcile(
        &self,
        user_id: &str,
        event: EventRef,
        external_task_ids: &[String],
    ) -> Result<Reconciliation> {
        let rates = self.rates.get_quota_rates().await?;

        let mut task_costs = Vec::with_capacity(external_task_ids.len());
        for task_id in external_task_ids {
            let sample = self.usage.get_resource_usage(task_id).await?;
            let cost = estimate_cost(task_id, sample.as_ref(), &rates, self.min_samples);
            task_costs.push((task_id.clone(), cost));
        }

        let cpu_cost: f64 = task_costs.iter().map(|(_, c)| c.cpu).sum();
        let memory_cost: f64 = task_costs.iter().map(|(_, c)| c.memory).sum();
        let fallback_count = task_costs.iter().filter(|(_, c)| c.flat_rate).count();
        let total_cost = cpu_cost + memory_cost;

        let _guard = self.locks.acquire(user_id).await;
        let original_balance = self
            .ledger
            .get_user_balance(user_id)
            .await?
            .ok_or_else(|| FlowError::BalanceRecordNotFound(user_id.to_string()))?;
        let statement = BalanceStatement::new(
            user_id,
            original_balance,
            total_cost,
            StatementReason::AnalysisReplay,
            event,
        );
        // Balance before statement
        self.ledger.set_user_balance(user_id, statement.new_balance).await?;
        self.ledger.write_balance_statement(&statement).await?;

        tracing::info!(
            "Charged {} {:.4} for {} tasks ({} at flat rate), balance {:.4} -> {:.4}",
            user_id,
            total_cost,
            task_costs.len(),
            fallback_count,
            original_balance,
            statement.new_balance
        );

        Ok(Reconciliation {
            total_cost,
            cpu_cost,
            memory_cost,
            fallback_count,
            task_costs,
            statement,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::quota::{QuotaRates, ResourceUsageSample};
    use crate::store::{MemoryStore, StoreState};

    struct FixedUsage(HashMap<String, ResourceUsageSample>);

    #[async_trait]
    impl UsageSource for FixedUsage {
        async fn get_resource_usage(
            &self,
            external_task_id: &str,
        ) -> Result<Option<ResourceUsageSample>> {
            // Usage lives behind HTTP in production
            tokio::task::yield_now().await;
            Ok(self.0.get(external_task_id).cloned())
        }
    }

    fn usage() -> FixedUsage {
        FixedUsage(HashMap::from([(
            "ext-1".to_string(),
            ResourceUsageSample {
                cpu_samples: vec![2.0; 60],
                memory_samples: vec![4.0; 60],
            },
        )]))
    }

    fn store() -> MemoryStore {
        let rates = QuotaRates {
            cpu_quota: 0.5,
            memory_quota: 0.25,
        };
        let state = StoreState::default().with_balance("alice", 200.0).with_rates(rates);
        MemoryStore::from_state(state)
    }

    #[tokio::test]
    async fn test_mixed_weighted_and_flat_costs() {
        let store = store();
        let usage = usage();
        let locks = UserLocks::new();
        let reconciler = Reconciler::new(&usage, &store, &store, &locks, 60);

        let ids = vec!["ext-1".to_string(), "ext-2".to_string()];
        let result = reconciler
            .reconcile("alice", EventRef::analysis("a1"), &ids)
            .await
            .unwrap();

        // ext-1: 60 * 2.0 * 0.5 + 60 * 4.0 * 0.25, ext-2: flat 0.75
        assert_eq!(result.cpu_cost, 60.5);
        assert_eq!(result.memory_cost, 60.25);
        assert_eq!(result.total_cost, 120.75);
        assert_eq!(result.fallback_count, 1);
        assert_eq!(store.get_user_balance("alice").await.unwrap(), Some(79.25));

        let statements = store.statements().await;
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].cost, 120.75);
        assert_eq!(statements[0].reason, StatementReason::AnalysisReplay);
    }

    #[tokio::test]
    async fn test_missing_balance_writes_nothing() {
        let store = store();
        let usage = usage();
        let locks = UserLocks::new();
        let reconciler = Reconciler::new(&usage, &store, &store, &locks, 60);

        let err = reconciler
            .reconcile("bob", EventRef::analysis("a1"), &["ext-1".to_string()])
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::BalanceRecordNotFound(_)));
        assert!(store.statements().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_charges_for_one_user_both_land() {
        let store = store();
        let usage = usage();
        let locks = UserLocks::new();
        let reconciler = Reconciler::new(&usage, &store, &store, &locks, 60);

        // Unknown usage ids: each task costs the flat 0.75
        let first = ["ext-a".to_string()];
        let second = ["ext-b".to_string()];
        let (a, b) = tokio::join!(
            reconciler.reconcile("alice", EventRef::analysis("a1"), &first),
            reconciler.reconcile("alice", EventRef::analysis("a2"), &second),
        );
        a.unwrap();
        b.unwrap();

        assert_eq!(store.get_user_balance("alice").await.unwrap(), Some(198.5));
        let statements = store.statements().await;
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].original_balance, statements[0].new_balance);
    }

    #[tokio::test]
    async fn test_user_locks_are_per_user() {
        let locks = UserLocks::new();
        let _alice = locks.acquire("alice").await;
        let bob = tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire("bob"));
        assert!(bob.await.is_ok());
    }
}
