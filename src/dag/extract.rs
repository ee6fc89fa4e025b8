use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::record::{DataReference, MemoryRef, TaskRecord};
use crate::error::{FlowError, Result};

/// How unresolvable data references are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    /// Log and bind the parameter to its historical value
    #[default]
    Lenient,
    /// Fail with `UnresolvedDependency`
    Strict,
}

/// Kind of data flowing along an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    File,
    Memory,
    Value,
}

/// Where a piece of referenced data came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedData {
    pub owning_experiment_id: String,
    pub owning_task_id: String,
    pub kind: DataKind,
}

/// Lookup of file and memory references in the record store
#[async_trait]
pub trait DataResolver: Send + Sync {
    async fn resolve_data_reference(&self, data_id: &str) -> Result<Option<ResolvedData>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub name: String,
    pub tool_name: String,
    pub enabled: bool,
}

/// Data not produced within the experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalInputNode {
    pub id: String,
    pub name: String,
    pub consumed_by: Vec<String>,
}

/// Data produced by a task of the same experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedOutputNode {
    pub id: String,
    pub name: String,
    pub produced_by: String,
    pub consumed_by: Vec<String>,
    pub kind: DataKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum DependencyNode {
    Task(TaskNode),
    ExternalInput(ExternalInputNode),
    ProducedOutput(ProducedOutputNode),
}

impl DependencyNode {
    pub fn id(&self) -> &str {
        match self {
            DependencyNode::Task(n) => &n.id,
            DependencyNode::ExternalInput(n) => &n.id,
            DependencyNode::ProducedOutput(n) => &n.id,
        }
    }
}

/// What supplies a task parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputSource {
    /// External node; `value` is the historical payload, if any
    External { node_id: String, value: Option<Value> },
    /// Output of another task in the experiment
    Produced { node_id: String, producer: String },
    /// Reference that could not be resolved (lenient mode)
    Unlinked { value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub param: String,
    pub required: bool,
    pub source: InputSource,
}

impl InputBinding {
    /// Node id the parameter is bound to, if it is bound to a node
    pub fn node_id(&self) -> Option<&str> {
        match &self.source {
            InputSource::External { node_id, .. } | InputSource::Produced { node_id, .. } => {
                Some(node_id)
            }
            InputSource::Unlinked { .. } => None,
        }
    }

    pub fn producer(&self) -> Option<&str> {
        match &self.source {
            InputSource::Produced { producer, .. } => Some(producer),
            _ => None,
        }
    }
}

/// Nodes and per-task input maps extracted from one experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySet {
    pub experiment_id: String,
    tasks: Vec<TaskNode>,
    externals: BTreeMap<String, ExternalInputNode>,
    produced: BTreeMap<String, ProducedOutputNode>,
    bindings: BTreeMap<String, Vec<InputBinding>>,
}

impl DependencySet {
    /// Task nodes in historical execution order
    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn bindings(&self, task_id: &str) -> &[InputBinding] {
        self.bindings.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn external(&self, node_id: &str) -> Option<&ExternalInputNode> {
        self.externals.get(node_id)
    }

    pub fn produced(&self, node_id: &str) -> Option<&ProducedOutputNode> {
        self.produced.get(node_id)
    }

    pub fn externals(&self) -> impl Iterator<Item = &ExternalInputNode> {
        self.externals.values()
    }

    /// Produced outputs nobody in the experiment consumes
    pub fn output_pins(&self) -> impl Iterator<Item = &ProducedOutputNode> {
        self.produced.values().filter(|n| n.consumed_by.is_empty())
    }

    /// Producers of every produced output `task_id` consumes
    pub fn predecessors(&self, task_id: &str) -> BTreeSet<String> {
        self.bindings(task_id)
            .iter()
            .filter_map(|b| b.producer().map(str::to_string))
            .collect()
    }

    /// All nodes as one tagged list: tasks, then external inputs, then produced outputs
    pub fn nodes(&self) -> Vec<DependencyNode> {
        self.tasks
            .iter()
            .cloned()
            .map(DependencyNode::Task)
            .chain(self.externals.values().cloned().map(DependencyNode::ExternalInput))
            .chain(self.produced.values().cloned().map(DependencyNode::ProducedOutput))
            .collect()
    }

    fn attach_external(&mut self, node_id: &str, name: &str, consumer: &str) {
        let node = self
            .externals
            .entry(node_id.to_string())
            .or_insert_with(|| ExternalInputNode {
                id: node_id.to_string(),
                name: name.to_string(),
                consumed_by: vec![],
            });
        push_unique(&mut node.consumed_by, consumer);
    }

    fn attach_produced(
        &mut self,
        node_id: &str,
        name: &str,
        producer: &str,
        kind: DataKind,
        consumer: &str,
    ) {
        let node = self
            .produced
            .entry(node_id.to_string())
            .or_insert_with(|| ProducedOutputNode {
                id: node_id.to_string(),
                name: name.to_string(),
                produced_by: producer.to_string(),
                consumed_by: vec![],
                kind,
            });
        push_unique(&mut node.consumed_by, consumer);
    }

    fn register_output(&mut self, node_id: String, name: &str, producer: &str, kind: DataKind) {
        match self.produced.get_mut(&node_id) {
            Some(node) => {
                if node.produced_by != producer {
                    tracing::warn!(
                        "Output {} claimed by {} but resolved to {}, keeping {}",
                        node_id, producer, node.produced_by, producer
                    );
                    node.produced_by = producer.to_string();
                }
                // The producer's parameter name is authoritative
                node.name = name.to_string();
                node.kind = kind;
            }
            None => {
                self.produced.insert(
                    node_id.clone(),
                    ProducedOutputNode {
                        id: node_id,
                        name: name.to_string(),
                        produced_by: producer.to_string(),
                        consumed_by: vec![],
                        kind,
                    },
                );
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}

/// Synthetic id for a parameter without a stable data identity
pub fn synthetic_node_id(task_id: &str, param: &str) -> String {
    format!("{}.{}", task_id, param)
}

/// Classifies every input/output of an experiment's task records
///
/// Resolver lookups are cached for the lifetime of the extractor, so one
/// extractor should be created per replay request.
pub struct DependencyExtractor<'a> {
    resolver: &'a dyn DataResolver,
    mode: ExtractionMode,
    cache: HashMap<String, Option<ResolvedData>>,
    cache_hits: usize,
}

enum Classified {
    External { node_id: String },
    Produced { node_id: String, producer: String, kind: DataKind },
    Unresolved { data_id: String },
}

impl<'a> DependencyExtractor<'a> {
    pub fn new(resolver: &'a dyn DataResolver) -> Self {
        Self {
            resolver,
            mode: ExtractionMode::default(),
            cache: HashMap::new(),
            cache_hits: 0,
        }
    }

    pub fn with_mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Number of resolver lookups answered from the cache
    pub fn cache_hits(&self) -> usize {
        self.cache_hits
    }

    pub async fn extract(
        &mut self,
        experiment_id: &str,
        records: &[TaskRecord],
    ) -> Result<DependencySet> {
        let mut set = DependencySet {
            experiment_id: experiment_id.to_string(),
            ..Default::default()
        };

        let records: Vec<&TaskRecord> = records
            .iter()
            .filter(|r| {
                let own = r.experiment_id == experiment_id;
                if !own {
                    tracing::warn!("Ignoring task {} of experiment {}", r.id, r.experiment_id);
                }
                own
            })
            .collect();
        let known: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

        for record in &records {
            set.tasks.push(TaskNode {
                id: record.id.clone(),
                name: record.name.clone(),
                tool_name: record.tool_name.clone(),
                enabled: record.is_success(),
            });
        }

        for record in &records {
            for output in &record.outputs {
                let (node_id, kind) = match &output.data {
                    Some(DataReference::File { id }) => (id.clone(), DataKind::File),
                    Some(DataReference::Memory { id }) => (id.clone(), DataKind::Memory),
                    _ => (synthetic_node_id(&record.id, &output.name), DataKind::Value),
                };
                set.register_output(node_id, &output.name, &record.id, kind);
            }
        }

        for record in &records {
            if !record.is_success() {
                tracing::debug!("Task {} is {:?}, extracted as disabled", record.id, record.status);
                continue;
            }

            let mut bindings = Vec::with_capacity(record.inputs.len());
            for input in &record.inputs {
                let historical = input.data.as_ref().map(DataReference::to_value);
                let classified = match &input.data {
                    Some(DataReference::File { id }) => {
                        self.classify_file(experiment_id, id, &set, &known).await?
                    }
                    Some(DataReference::Memory { id }) => {
                        classify_memory(experiment_id, id, &known)
                    }
                    _ => Classified::External {
                        node_id: synthetic_node_id(&record.id, &input.name),
                    },
                };

                let source = match classified {
                    Classified::External { node_id } => {
                        set.attach_external(&node_id, &input.name, &record.id);
                        InputSource::External { node_id, value: historical }
                    }
                    Classified::Produced { node_id, producer, kind } => {
                        set.attach_produced(&node_id, &input.name, &producer, kind, &record.id);
                        InputSource::Produced { node_id, producer }
                    }
                    Classified::Unresolved { data_id } => {
                        if self.mode == ExtractionMode::Strict {
                            return Err(FlowError::UnresolvedDependency {
                                task_id: record.id.clone(),
                                param: input.name.clone(),
                                data_id,
                            });
                        }
                        tracing::warn!(
                            "Skipping unresolved reference {} on {}.{}",
                            data_id, record.id, input.name
                        );
                        InputSource::Unlinked {
                            value: historical.unwrap_or(Value::Null),
                        }
                    }
                };

                bindings.push(InputBinding {
                    param: input.name.clone(),
                    required: !input.optional,
                    source,
                });
            }
            set.bindings.insert(record.id.clone(), bindings);
        }

        tracing::info!(
            "Extracted {} tasks, {} external inputs, {} produced outputs from experiment {}",
            set.tasks.len(),
            set.externals.len(),
            set.produced.len(),
            experiment_id
        );

        Ok(set)
    }

    async fn classify_file(
        &mut self,
        experiment_id: &str,
        id: &str,
        set: &DependencySet,
        known: &HashSet<&str>,
    ) -> Result<Classified> {
        if let Some(node) = set.produced(id) {
            return Ok(Classified::Produced {
                node_id: id.to_string(),
                producer: node.produced_by.clone(),
                kind: node.kind,
            });
        }
        let Some(resolved) = self.resolve(id).await? else {
            return Ok(Classified::Unresolved { data_id: id.to_string() });
        };
        if resolved.owning_experiment_id != experiment_id {
            return Ok(Classified::External { node_id: id.to_string() });
        }
        if !known.contains(resolved.owning_task_id.as_str()) {
            return Ok(Classified::Unresolved { data_id: id.to_string() });
        }
        Ok(Classified::Produced {
            node_id: id.to_string(),
            producer: resolved.owning_task_id,
            kind: DataKind::File,
        })
    }

    async fn resolve(&mut self, data_id: &str) -> Result<Option<ResolvedData>> {
        if let Some(cached) = self.cache.get(data_id) {
            self.cache_hits += 1;
            return Ok(cached.clone());
        }
        let resolved = self.resolver.resolve_data_reference(data_id).await?;
        self.cache.insert(data_id.to_string(), resolved.clone());
        Ok(resolved)
    }
}

/// Memory ids embed their producer, no lookup needed
fn classify_memory(experiment_id: &str, id: &str, known: &HashSet<&str>) -> Classified {
    let Some(memory) = MemoryRef::parse(id) else {
        return Classified::Unresolved { data_id: id.to_string() };
    };
    if memory.experiment_id != experiment_id {
        return Classified::External { node_id: id.to_string() };
    }
    if !known.contains(memory.task_id) {
        return Classified::Unresolved { data_id: id.to_string() };
    }
    Classified::Produced {
        node_id: id.to_string(),
        producer: memory.task_id.to_string(),
        kind: DataKind::Memory,
    }
}
