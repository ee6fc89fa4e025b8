//! Shared fixtures for replay integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use datalab_flow::dag::{DataReference, Params, TaskRecord};
use datalab_flow::error::{FlowError, Result};
use datalab_flow::flow::{TaskExecutor, TaskState};
use datalab_flow::quota::{QuotaRates, ResourceUsageSample, UsageSource};
use datalab_flow::{AnalysisService, Collaborators, FlowConfig, MemoryStore, StoreState};

pub const EXP: &str = "exp";

#[derive(Debug, Clone)]
pub struct Submission {
    pub tool_name: String,
    pub external_id: String,
    pub params: Params,
}

/// Worker double driven by tool name
#[derive(Default)]
pub struct ScriptedExecutor {
    submissions: Mutex<Vec<Submission>>,
    polls: Mutex<HashMap<String, u32>>,
    /// Polls answered with `Pending` before the terminal state
    pending_polls: u32,
    failures: HashMap<String, Option<String>>,
    rejected: HashSet<String>,
    never_finish: HashSet<String>,
    usage: HashMap<String, ResourceUsageSample>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn failing(mut self, tool_name: &str, message: &str) -> Self {
        self.failures.insert(tool_name.to_string(), Some(message.to_string()));
        self
    }

    pub fn rejecting(mut self, tool_name: &str) -> Self {
        self.rejected.insert(tool_name.to_string());
        self
    }

    pub fn hanging(mut self, tool_name: &str) -> Self {
        self.never_finish.insert(tool_name.to_string());
        self
    }

    pub fn with_usage(mut self, tool_name: &str, sample: ResourceUsageSample) -> Self {
        self.usage.insert(tool_name.to_string(), sample);
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submitted_tools(&self) -> Vec<String> {
        self.submissions().into_iter().map(|s| s.tool_name).collect()
    }

    pub fn submission(&self, tool_name: &str) -> Option<Submission> {
        self.submissions().into_iter().find(|s| s.tool_name == tool_name)
    }

    fn tool_of(&self, external_id: &str) -> Option<String> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.external_id == external_id)
            .map(|s| s.tool_name.clone())
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn submit_task(&self, tool_name: &str, params: &Params) -> Result<String> {
        if self.rejected.contains(tool_name) {
            return Err(FlowError::ExternalSubmission {
                tool_name: tool_name.to_string(),
                message: "rejected".to_string(),
            });
        }
        let mut submissions = self.submissions.lock().unwrap();
        let external_id = format!("ext-{}", submissions.len() + 1);
        submissions.push(Submission {
            tool_name: tool_name.to_string(),
            external_id: external_id.clone(),
            params: params.clone(),
        });
        Ok(external_id)
    }

    async fn poll_task_status(&self, external_task_id: &str) -> Result<TaskState> {
        let tool = self.tool_of(external_task_id).unwrap_or_default();
        if self.never_finish.contains(&tool) {
            return Ok(TaskState::Pending);
        }

        let mut polls = self.polls.lock().unwrap();
        let count = polls.entry(external_task_id.to_string()).or_insert(0);
        *count += 1;
        if *count <= self.pending_polls {
            return Ok(TaskState::Pending);
        }

        Ok(match self.failures.get(&tool) {
            Some(message) => TaskState::Failed {
                message: message.clone(),
            },
            None => TaskState::Success,
        })
    }
}

#[async_trait]
impl UsageSource for ScriptedExecutor {
    async fn get_resource_usage(
        &self,
        external_task_id: &str,
    ) -> Result<Option<ResourceUsageSample>> {
        let tool = self.tool_of(external_task_id).unwrap_or_default();
        Ok(self.usage.get(&tool).cloned())
    }
}

pub fn fast_config() -> FlowConfig {
    FlowConfig::builder()
        .poll_interval(Duration::from_millis(1))
        .build()
}

pub fn samples(n: usize, value: f64) -> ResourceUsageSample {
    ResourceUsageSample {
        cpu_samples: vec![value; n],
        memory_samples: vec![value; n],
    }
}

/// Record whose tool is named after the task, so executor scripts can
/// address tasks directly
pub fn task(id: &str) -> TaskRecord {
    TaskRecord::new(id, EXP, format!("tool-{}", id))
}

pub fn file(id: &str) -> Option<DataReference> {
    Some(DataReference::file(id))
}

/// `T1 -> T2 -> T3`, each consuming the previous task's file output
pub fn chain() -> Vec<TaskRecord> {
    vec![
        task("T1")
            .with_input("reads", Some(DataReference::literal("s3://raw/reads.fq")))
            .with_output("out", file("f1")),
        task("T2").with_input("in", file("f1")).with_output("out", file("f2")),
        task("T3").with_input("in", file("f2")).with_output("out", file("f3")),
    ]
}

/// `T1 -> {T2, T3} -> T4` wired through in-memory outputs
pub fn diamond() -> Vec<TaskRecord> {
    let memory = |task: &str| Some(DataReference::memory(format!("{}_{}", EXP, task)));
    vec![
        task("T1")
            .with_input("seed", Some(DataReference::literal(7)))
            .with_output("out", memory("T1")),
        task("T2").with_input("in", memory("T1")).with_output("out", memory("T2")),
        task("T3").with_input("in", memory("T1")).with_output("out", memory("T3")),
        task("T4")
            .with_input("left", memory("T2"))
            .with_input("right", memory("T3"))
            .with_output("out", memory("T4")),
    ]
}

pub fn state_with(records: Vec<TaskRecord>) -> StoreState {
    let mut state = StoreState::default()
        .with_balance("alice", 100.0)
        .with_rates(QuotaRates {
            cpu_quota: 0.5,
            memory_quota: 0.25,
        });
    state.records = records;
    state
}

pub fn service(
    state: StoreState,
    executor: Arc<ScriptedExecutor>,
    config: FlowConfig,
) -> (AnalysisService, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::from_state(state));
    let service = AnalysisService::new(Collaborators::new(store.clone(), executor), config);
    (service, store)
}
