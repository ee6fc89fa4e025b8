use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::MemoryRef;

/// Caller-supplied inputs of one replay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayBinding {
    pub analysis_id: String,
    /// Values keyed by original node id; they take precedence over internal wiring
    #[serde(default)]
    pub outer_input: BTreeMap<String, Value>,
    #[serde(default)]
    pub disabled_task_ids: BTreeSet<String>,
    /// Skip tasks whose required inputs come only from disabled tasks instead
    /// of failing with `MissingRequiredInput`
    #[serde(default)]
    pub cascade_disabled: bool,
}

impl ReplayBinding {
    pub fn new(analysis_id: impl Into<String>) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, node_id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outer_input.insert(node_id.into(), value.into());
        self
    }

    pub fn disable(mut self, task_id: impl Into<String>) -> Self {
        self.disabled_task_ids.insert(task_id.into());
        self
    }

    pub fn with_cascade(mut self, cascade: bool) -> Self {
        self.cascade_disabled = cascade;
        self
    }

    pub fn is_disabled(&self, task_id: &str) -> bool {
        self.disabled_task_ids.contains(task_id)
    }
}

/// Mutable state of a single replay run
///
/// Owned by one engine run and dropped with its report; never shared
/// between replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayContext {
    analysis_id: String,
    old_experiment_id: String,
    /// `"{old_experiment_id}_{old_task_id}"` → new execution id
    old_to_new_task_id: BTreeMap<String, String>,
}

impl ReplayContext {
    pub fn new(analysis_id: impl Into<String>, old_experiment_id: impl Into<String>) -> Self {
        Self {
            analysis_id: analysis_id.into(),
            old_experiment_id: old_experiment_id.into(),
            old_to_new_task_id: BTreeMap::new(),
        }
    }

    pub fn analysis_id(&self) -> &str {
        &self.analysis_id
    }

    fn key(&self, old_task_id: &str) -> String {
        MemoryRef::compose(&self.old_experiment_id, old_task_id)
    }

    pub fn record(&mut self, old_task_id: &str, new_task_id: impl Into<String>) {
        let key = self.key(old_task_id);
        self.old_to_new_task_id.insert(key, new_task_id.into());
    }

    /// New execution id of a task that already succeeded in this replay
    pub fn new_task_id(&self, old_task_id: &str) -> Option<&str> {
        self.old_to_new_task_id.get(&self.key(old_task_id)).map(String::as_str)
    }

    pub fn old_to_new(&self) -> &BTreeMap<String, String> {
        &self.old_to_new_task_id
    }

    pub fn len(&self) -> usize {
        self.old_to_new_task_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.old_to_new_task_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_keys() {
        let mut ctx = ReplayContext::new("lab-2", "exp-1");
        assert!(ctx.new_task_id("t1").is_none());

        ctx.record("t1", "run-a");
        assert_eq!(ctx.new_task_id("t1"), Some("run-a"));
        assert_eq!(ctx.old_to_new().get("exp-1_t1").map(String::as_str), Some("run-a"));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_binding_builder() {
        let binding = ReplayBinding::new("lab-2")
            .with_input("raw.csv", "new.csv")
            .disable("t2")
            .with_cascade(true);

        assert!(binding.is_disabled("t2"));
        assert!(!binding.is_disabled("t1"));
        assert_eq!(binding.outer_input["raw.csv"], Value::from("new.csv"));
        assert!(binding.cascade_disabled);
    }
}
