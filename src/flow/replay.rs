use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{ReplayBinding, ReplayContext};
use super::executor::TaskExecutor;
use super::poll::{Outcome, Poller};
use crate::config::FlowConfig;
use crate::dag::{DataKind, DependencyGraph, DependencySet, InputSource, MemoryRef, Params};
use crate::error::{FlowError, Result};

/// Extracted dependencies together with their schedule
pub struct ReplayPlan {
    dependencies: DependencySet,
    graph: DependencyGraph,
    waves: Vec<Vec<String>>,
}

impl ReplayPlan {
    /// Build the task graph and its waves; fails on cycles
    pub fn new(dependencies: DependencySet) -> Result<Self> {
        let graph = DependencyGraph::from_dependencies(&dependencies)?;
        let waves = graph.waves()?;
        Ok(Self {
            dependencies,
            graph,
            waves,
        })
    }

    pub fn dependencies(&self) -> &DependencySet {
        &self.dependencies
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn waves(&self) -> &[Vec<String>] {
        &self.waves
    }
}

/// Tasks that will actually run, wave by wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub waves: Vec<Vec<String>>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotSubmitted,
    Succeeded,
    Failed { message: Option<String> },
    TimedOut,
    Cancelled,
}

/// One task invocation within a replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    pub old_task_id: String,
    pub execution_id: String,
    pub tool_name: String,
    pub external_task_id: Option<String>,
    pub params: Params,
    pub state: RunState,
}

impl TaskRun {
    /// Runs the worker reported a terminal state for consumed compute
    pub fn is_charged(&self) -> bool {
        matches!(self.state, RunState::Succeeded | RunState::Failed { .. })
    }
}

/// Result of executing a replay plan
#[derive(Debug)]
pub struct ReplayReport {
    pub runs: Vec<TaskRun>,
    pub skipped: Vec<String>,
    pub context: ReplayContext,
    /// Error that stopped scheduling, `None` when every task succeeded
    pub halt: Option<FlowError>,
}

impl ReplayReport {
    pub fn is_success(&self) -> bool {
        self.halt.is_none()
    }

    pub fn charged_runs(&self) -> impl Iterator<Item = &TaskRun> {
        self.runs.iter().filter(|r| r.is_charged())
    }

    pub fn run_for(&self, old_task_id: &str) -> Option<&TaskRun> {
        self.runs.iter().find(|r| r.old_task_id == old_task_id)
    }
}

/// Replays an experiment's dependency graph against new input bindings
pub struct ReplayEngine {
    executor: Arc<dyn TaskExecutor>,
    config: FlowConfig,
    cancel: CancellationToken,
}

impl ReplayEngine {
    pub fn new(executor: Arc<dyn TaskExecutor>, config: FlowConfig) -> Self {
        Self {
            executor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the replay from submitting further tasks
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Decide which tasks run and check that every required input will be
    /// available, without touching any worker
    pub fn prepare(&self, plan: &ReplayPlan, binding: &ReplayBinding) -> Result<Schedule> {
        let deps = plan.dependencies();
        let mut runnable: HashSet<&str> = HashSet::new();
        let mut waves = vec![];
        let mut skipped = vec![];

        for wave in plan.waves() {
            let mut scheduled = vec![];

            'tasks: for task_id in wave {
                let enabled = deps.task(task_id).map(|t| t.enabled).unwrap_or(false);
                if !enabled || binding.is_disabled(task_id) {
                    skipped.push(task_id.clone());
                    continue;
                }

                for input in deps.bindings(task_id) {
                    let overridden = input
                        .node_id()
                        .is_some_and(|node_id| binding.outer_input.contains_key(node_id));
                    if overridden || !input.required {
                        continue;
                    }
                    let producer = match &input.source {
                        InputSource::Produced { producer, .. } => producer,
                        InputSource::External { value: None, .. } => {
                            return Err(FlowError::MissingRequiredInput {
                                task_id: task_id.clone(),
                                param: input.param.clone(),
                            });
                        }
                        _ => continue,
                    };
                    if runnable.contains(producer.as_str()) {
                        continue;
                    }
                    if binding.cascade_disabled {
                        tracing::info!(
                            "Skipping {}: input '{}' depends on skipped {}",
                            task_id,
                            input.param,
                            producer
                        );
                        skipped.push(task_id.clone());
                        continue 'tasks;
                    }
                    return Err(FlowError::MissingRequiredInput {
                        task_id: task_id.clone(),
                        param: input.param.clone(),
                    });
                }

                runnable.insert(task_id);
                scheduled.push(task_id.clone());
            }

            if !scheduled.is_empty() {
                waves.push(scheduled);
            }
        }

        Ok(Schedule { waves, skipped })
    }

    /// Execute the plan wave by wave
    ///
    /// Preparation errors are returned before anything is submitted. Once
    /// tasks run, the first execution error halts scheduling and is carried
    /// in the report alongside the runs that already happened.
    pub async fn run(&self, plan: &ReplayPlan, binding: &ReplayBinding) -> Result<ReplayReport> {
        let schedule = self.prepare(plan, binding)?;
        let mut context =
            ReplayContext::new(&binding.analysis_id, &plan.dependencies().experiment_id);
        let replay_deadline = self.config.replay_timeout.map(|t| Instant::now() + t);
        let mut runs = vec![];
        let mut halt = None;

        tracing::info!(
            "Replaying {} tasks in {} waves for analysis {} ({} skipped)",
            schedule.waves.iter().map(Vec::len).sum::<usize>(),
            schedule.waves.len(),
            binding.analysis_id,
            schedule.skipped.len()
        );

        'waves: for wave in &schedule.waves {
            if self.config.parallel_waves && wave.len() > 1 {
                let results = join_all(wave.iter().map(|task_id| {
                    self.execute_task(plan, binding, &context, task_id, replay_deadline)
                }))
                .await;

                for (run, error) in results {
                    if run.state == RunState::Succeeded {
                        context.record(&run.old_task_id, &run.execution_id);
                    }
                    runs.push(run);
                    if halt.is_none() {
                        halt = error;
                    }
                }
                if halt.is_some() {
                    break 'waves;
                }
            } else {
                for task_id in wave {
                    let (run, error) = self
                        .execute_task(plan, binding, &context, task_id, replay_deadline)
                        .await;
                    if run.state == RunState::Succeeded {
                        context.record(&run.old_task_id, &run.execution_id);
                    }
                    runs.push(run);
                    if error.is_some() {
                        halt = error;
                        break 'waves;
                    }
                }
            }
        }

        match &halt {
            Some(err) => tracing::warn!("Replay {} halted: {}", binding.analysis_id, err),
            None => tracing::info!(
                "Replay {} complete: {} tasks succeeded",
                binding.analysis_id,
                context.len()
            ),
        }

        Ok(ReplayReport {
            runs,
            skipped: schedule.skipped,
            context,
            halt,
        })
    }

    async fn execute_task(
        &self,
        plan: &ReplayPlan,
        binding: &ReplayBinding,
        context: &ReplayContext,
        task_id: &str,
        replay_deadline: Option<Instant>,
    ) -> (TaskRun, Option<FlowError>) {
        let tool_name = plan
            .dependencies()
            .task(task_id)
            .map(|t| t.tool_name.clone())
            .unwrap_or_default();
        let mut run = TaskRun {
            old_task_id: task_id.to_string(),
            execution_id: Uuid::new_v4().to_string(),
            tool_name,
            external_task_id: None,
            params: Params::new(),
            state: RunState::NotSubmitted,
        };

        if self.cancel.is_cancelled() {
            run.state = RunState::Cancelled;
            let err = FlowError::Cancelled { task_id: run.execution_id.clone() };
            return (run, Some(err));
        }
        if matches!(replay_deadline, Some(deadline) if Instant::now() >= deadline) {
            run.state = RunState::TimedOut;
            let err = FlowError::TaskTimeout {
                task_id: run.execution_id.clone(),
                waited_secs: 0,
            };
            return (run, Some(err));
        }

        run.params = match resolve_params(plan.dependencies(), binding, context, task_id) {
            Ok(params) => params,
            Err(err) => return (run, Some(err)),
        };

        let external_id = match self.executor.submit_task(&run.tool_name, &run.params).await {
            Ok(id) => id,
            Err(err) => {
                let err = match err {
                    e @ FlowError::ExternalSubmission { .. } => e,
                    other => FlowError::ExternalSubmission {
                        tool_name: run.tool_name.clone(),
                        message: other.to_string(),
                    },
                };
                return (run, Some(err));
            }
        };
        tracing::info!("Submitted {} ({}) as {}", task_id, run.tool_name, external_id);
        run.external_task_id = Some(external_id.clone());

        let task_deadline = self.config.task_timeout.map(|t| Instant::now() + t);
        let deadline = match (task_deadline, replay_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let poller = Poller::new(self.executor.as_ref(), self.config.poll_interval)
            .with_deadline(deadline)
            .with_cancellation(self.cancel.clone());

        match poller.wait(&run.execution_id, &external_id).await {
            Ok(Outcome::Success) => {
                tracing::info!("Task {} succeeded as {}", task_id, run.execution_id);
                run.state = RunState::Succeeded;
                (run, None)
            }
            Ok(Outcome::Failed { message }) => {
                let err = FlowError::TaskExecutionFailed {
                    task_id: run.execution_id.clone(),
                    message: message.clone(),
                };
                run.state = RunState::Failed { message };
                (run, Some(err))
            }
            Err(err) => {
                run.state = match &err {
                    FlowError::Cancelled { .. } => RunState::Cancelled,
                    FlowError::TaskTimeout { .. } => RunState::TimedOut,
                    _ => RunState::Failed { message: Some(err.to_string()) },
                };
                (run, Some(err))
            }
        }
    }
}

/// Resolve every declared input of `task_id` for submission
///
/// Precedence: `outer_input` for the bound node, then the producer's new
/// execution in this replay, then the historical value. Unset optional
/// inputs are omitted; an unset required input is `MissingRequiredInput`.
pub fn resolve_params(
    deps: &DependencySet,
    binding: &ReplayBinding,
    context: &ReplayContext,
    task_id: &str,
) -> Result<Params> {
    let mut params = Params::new();

    for input in deps.bindings(task_id) {
        if let Some(value) = input.node_id().and_then(|id| binding.outer_input.get(id)) {
            params.insert(input.param.clone(), value.clone());
            continue;
        }

        match &input.source {
            InputSource::External { value: Some(value), .. } => {
                params.insert(input.param.clone(), value.clone());
            }
            InputSource::External { value: None, .. } if input.required => {
                return Err(FlowError::MissingRequiredInput {
                    task_id: task_id.to_string(),
                    param: input.param.clone(),
                });
            }
            InputSource::External { value: None, .. } => {}
            InputSource::Unlinked { value } => {
                if !value.is_null() {
                    params.insert(input.param.clone(), value.clone());
                }
            }
            InputSource::Produced { node_id, producer } => match context.new_task_id(producer) {
                Some(new_id) => {
                    let (kind, output) = deps
                        .produced(node_id)
                        .map(|n| (n.kind, n.name.as_str()))
                        .unwrap_or((DataKind::Value, input.param.as_str()));
                    params.insert(
                        input.param.clone(),
                        output_reference(context.analysis_id(), new_id, kind, output),
                    );
                }
                None if input.required => {
                    return Err(FlowError::MissingRequiredInput {
                        task_id: task_id.to_string(),
                        param: input.param.clone(),
                    });
                }
                None => {}
            },
        }
    }

    Ok(params)
}

/// Reference to an output of a task executed in this replay
fn output_reference(analysis_id: &str, new_task_id: &str, kind: DataKind, output: &str) -> Value {
    match kind {
        DataKind::Memory => json!({
            "id": MemoryRef::compose(analysis_id, new_task_id),
            "is_memory": true,
        }),
        DataKind::File => json!({
            "task_id": new_task_id,
            "output": output,
            "is_file": true,
        }),
        DataKind::Value => json!({
            "task_id": new_task_id,
            "output": output,
        }),
    }
}
