//! Analysis records and the service that replays them

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::FlowConfig;
use crate::dag::{DataResolver, DependencyExtractor, TaskRecord};
use crate::error::{FlowError, Result};
use crate::flow::{ReplayBinding, ReplayEngine, ReplayPlan, ReplayReport, TaskExecutor, TaskRun};
use crate::quota::{BalanceStore, EventRef, QuotaRateSource, Reconciler, UsageSource, UserLocks};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

/// Tasks a user switched off in the analysis editor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagEditMask {
    #[serde(default)]
    pub disabled_task_ids: BTreeSet<String>,
    #[serde(default)]
    pub cascade_disabled: bool,
}

impl DagEditMask {
    pub fn disable(mut self, task_id: impl Into<String>) -> Self {
        self.disabled_task_ids.insert(task_id.into());
        self
    }

    /// Union of both disabled sets; the cascade flag of `other` wins
    pub fn merged_with(&self, other: &DagEditMask) -> DagEditMask {
        DagEditMask {
            disabled_task_ids: self
                .disabled_task_ids
                .union(&other.disabled_task_ids)
                .cloned()
                .collect(),
            cascade_disabled: other.cascade_disabled,
        }
    }
}

/// A replay of one historical experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub experiment_id: String,
    #[serde(default)]
    pub status: AnalysisStatus,
    #[serde(default)]
    pub dag_edit: DagEditMask,
    #[serde(default)]
    pub failing_task_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub cost: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl Analysis {
    pub fn new(id: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            experiment_id: experiment_id.into(),
            status: AnalysisStatus::Pending,
            dag_edit: DagEditMask::default(),
            failing_task_id: None,
            message: None,
            cost: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_mask(mut self, mask: DagEditMask) -> Self {
        self.dag_edit = mask;
        self
    }

    fn mark_running(&mut self) {
        self.status = AnalysisStatus::Running;
        self.failing_task_id = None;
        self.message = None;
        self.cost = None;
        self.updated_at = Utc::now();
    }

    fn mark_success(&mut self, cost: f64) {
        self.status = AnalysisStatus::Success;
        self.cost = Some(cost);
        self.updated_at = Utc::now();
    }

    fn mark_failed(&mut self, err: &FlowError, cost: Option<f64>) {
        self.status = AnalysisStatus::Failed;
        self.failing_task_id = err.task_id().map(str::to_string);
        self.message = Some(err.to_string());
        self.cost = cost;
        self.updated_at = Utc::now();
    }
}

#[async_trait]
pub trait TaskRecordStore: Send + Sync {
    /// Every task record of an experiment, in historical execution order
    async fn list_task_records(&self, experiment_id: &str) -> Result<Vec<TaskRecord>>;
}

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn get_analysis(&self, analysis_id: &str) -> Result<Option<Analysis>>;

    async fn save_analysis(&self, analysis: &Analysis) -> Result<()>;
}

/// External systems an analysis replay talks to
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn TaskRecordStore>,
    pub analyses: Arc<dyn AnalysisStore>,
    pub resolver: Arc<dyn DataResolver>,
    pub executor: Arc<dyn TaskExecutor>,
    pub usage: Arc<dyn UsageSource>,
    pub balances: Arc<dyn BalanceStore>,
    pub rates: Arc<dyn QuotaRateSource>,
}

impl Collaborators {
    /// Wire a single record store and a single worker into every port
    pub fn new<S, W>(store: Arc<S>, worker: Arc<W>) -> Self
    where
        S: TaskRecordStore
            + AnalysisStore
            + DataResolver
            + BalanceStore
            + QuotaRateSource
            + 'static,
        W: TaskExecutor + UsageSource + 'static,
    {
        Self {
            records: store.clone(),
            analyses: store.clone(),
            resolver: store.clone(),
            balances: store.clone(),
            rates: store,
            executor: worker.clone(),
            usage: worker,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayRequest {
    pub analysis_id: String,
    pub user_id: String,
    #[serde(default)]
    pub dag_edit_mask: Option<DagEditMask>,
    #[serde(default)]
    pub outer_input: BTreeMap<String, Value>,
}

/// Terminal state of a replay as reported to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub analysis_id: String,
    pub status: AnalysisStatus,
    pub failing_task_id: Option<String>,
    pub message: Option<String>,
    pub cost: f64,
    pub fallback_count: usize,
    pub runs: Vec<TaskRun>,
    /// `"{old_experiment_id}_{old_task_id}"` → new execution id
    pub old_to_new_task_id: BTreeMap<String, String>,
}

/// Replays analyses end to end: extraction, execution, billing
pub struct AnalysisService {
    collaborators: Collaborators,
    config: FlowConfig,
    cancel: CancellationToken,
    ledger_locks: UserLocks,
}

impl AnalysisService {
    pub fn new(collaborators: Collaborators, config: FlowConfig) -> Self {
        Self {
            collaborators,
            config,
            cancel: CancellationToken::new(),
            ledger_locks: UserLocks::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Extract the dependency graph of an experiment and schedule it
    pub async fn plan_experiment(&self, experiment_id: &str) -> Result<ReplayPlan> {
        let records = self.collaborators.records.list_task_records(experiment_id).await?;
        let mut extractor = DependencyExtractor::new(self.collaborators.resolver.as_ref())
            .with_mode(self.config.extraction_mode);
        let dependencies = extractor.extract(experiment_id, &records).await?;
        tracing::debug!(
            "Extracted {} tasks for {} ({} resolver cache hits)",
            dependencies.tasks().len(),
            experiment_id,
            extractor.cache_hits()
        );
        ReplayPlan::new(dependencies)
    }

    pub async fn replay_analysis(&self, request: ReplayRequest) -> Result<ReplayOutcome> {
        let analyses = &self.collaborators.analyses;
        let mut analysis = analyses
            .get_analysis(&request.analysis_id)
            .await?
            .ok_or_else(|| FlowError::AnalysisNotFound(request.analysis_id.clone()))?;

        if let Some(mask) = &request.dag_edit_mask {
            analysis.dag_edit = analysis.dag_edit.merged_with(mask);
        }
        analysis.mark_running();
        analyses.save_analysis(&analysis).await?;
        tracing::info!(
            "Replaying analysis {} of experiment {}",
            analysis.id,
            analysis.experiment_id
        );

        let binding = ReplayBinding {
            analysis_id: analysis.id.clone(),
            outer_input: request.outer_input.clone(),
            disabled_task_ids: analysis.dag_edit.disabled_task_ids.clone(),
            cascade_disabled: analysis.dag_edit.cascade_disabled,
        };

        let report = match self
            .execute(&analysis.experiment_id, &request.user_id, &binding)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!("Analysis {} failed before execution: {}", analysis.id, err);
                analysis.mark_failed(&err, None);
                analyses.save_analysis(&analysis).await?;
                return Err(err);
            }
        };

        let charged: Vec<String> = report
            .charged_runs()
            .filter_map(|run| run.external_task_id.clone())
            .collect();
        let reconciler = Reconciler::new(
            self.collaborators.usage.as_ref(),
            self.collaborators.rates.as_ref(),
            self.collaborators.balances.as_ref(),
            &self.ledger_locks,
            self.config.min_usage_samples,
        );
        let reconciliation = match reconciler
            .reconcile(&request.user_id, EventRef::analysis(&analysis.id), &charged)
            .await
        {
            Ok(reconciliation) => reconciliation,
            Err(err) => {
                analysis.mark_failed(&err, None);
                analyses.save_analysis(&analysis).await?;
                return Err(err);
            }
        };

        match &report.halt {
            None => analysis.mark_success(reconciliation.total_cost),
            Some(err) => analysis.mark_failed(err, Some(reconciliation.total_cost)),
        }
        analyses.save_analysis(&analysis).await?;

        Ok(ReplayOutcome {
            analysis_id: analysis.id,
            status: analysis.status,
            failing_task_id: analysis.failing_task_id,
            message: analysis.message,
            cost: reconciliation.total_cost,
            fallback_count: reconciliation.fallback_count,
            old_to_new_task_id: report.context.old_to_new().clone(),
            runs: report.runs,
        })
    }

    /// Plan and check the balance record before the engine submits anything
    async fn execute(
        &self,
        experiment_id: &str,
        user_id: &str,
        binding: &ReplayBinding,
    ) -> Result<ReplayReport> {
        let plan = self.plan_experiment(experiment_id).await?;
        if self.collaborators.balances.get_user_balance(user_id).await?.is_none() {
            return Err(FlowError::BalanceRecordNotFound(user_id.to_string()));
        }
        let engine = ReplayEngine::new(self.collaborators.executor.clone(), self.config.clone())
            .with_cancellation(self.cancel.child_token());
        engine.run(&plan, binding).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_merge() {
        let stored = DagEditMask::default().disable("t1");
        let request = DagEditMask {
            disabled_task_ids: BTreeSet::from(["t2".to_string()]),
            cascade_disabled: true,
        };
        let merged = stored.merged_with(&request);
        assert_eq!(merged.disabled_task_ids.len(), 2);
        assert!(merged.cascade_disabled);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&AnalysisStatus::Failed).unwrap();
        assert_eq!(json, "\"FAILED\"");
    }

    #[test]
    fn test_mark_failed_keeps_task_id() {
        let mut analysis = Analysis::new("a1", "exp");
        let err = FlowError::TaskExecutionFailed {
            task_id: "new-1".to_string(),
            message: Some("boom".to_string()),
        };
        analysis.mark_failed(&err, Some(1.5));
        assert_eq!(analysis.status, AnalysisStatus::Failed);
        assert_eq!(analysis.failing_task_id.as_deref(), Some("new-1"));
        assert_eq!(analysis.cost, Some(1.5));
    }
}
