use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Terminal or pending state of a historical task execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RecordStatus {
    Success,
    Error,
    #[default]
    Pending,
}

/// One completed (or attempted) execution of a tool within an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub experiment_id: String,
    /// Human-readable task name
    #[serde(default)]
    pub name: String,
    pub tool_name: String,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub inputs: Vec<Param>,
    #[serde(default)]
    pub outputs: Vec<Param>,
}

/// Named input or output of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataReference>,
    /// Optional inputs may be left unset at replay time
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// Payload carried by a task parameter
///
/// Decoded from the stored JSON once: `{id, is_file: true}` is a file,
/// `{id, is_memory: true}` an in-memory object, anything else a literal.
/// Stored documents use either `id` or `_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum DataReference {
    File { id: String },
    Memory { id: String },
    Literal(Value),
}

impl DataReference {
    pub fn file(id: impl Into<String>) -> Self {
        DataReference::File { id: id.into() }
    }

    pub fn memory(id: impl Into<String>) -> Self {
        DataReference::Memory { id: id.into() }
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        DataReference::Literal(value.into())
    }

    /// Id of the referenced data, `None` for literals
    pub fn id(&self) -> Option<&str> {
        match self {
            DataReference::File { id } | DataReference::Memory { id } => Some(id),
            DataReference::Literal(_) => None,
        }
    }

    pub fn is_reference(&self) -> bool {
        !matches!(self, DataReference::Literal(_))
    }

    /// JSON form handed to workers
    pub fn to_value(&self) -> Value {
        Value::from(self.clone())
    }
}

impl From<Value> for DataReference {
    fn from(value: Value) -> Self {
        if let Value::Object(ref obj) = value {
            let id = obj
                .get("id")
                .or_else(|| obj.get("_id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);

            if let Some(id) = id {
                if flag("is_file") {
                    return DataReference::File { id };
                }
                if flag("is_memory") {
                    return DataReference::Memory { id };
                }
            }
        }
        DataReference::Literal(value)
    }
}

impl From<DataReference> for Value {
    fn from(data: DataReference) -> Self {
        match data {
            DataReference::File { id } => json!({ "id": id, "is_file": true }),
            DataReference::Memory { id } => json!({ "id": id, "is_memory": true }),
            DataReference::Literal(value) => value,
        }
    }
}

/// Composite in-memory data id: `{experiment_id}_{task_id}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRef<'a> {
    pub experiment_id: &'a str,
    pub task_id: &'a str,
}

impl<'a> MemoryRef<'a> {
    /// Split on the first `_`; both halves must be non-empty
    pub fn parse(id: &'a str) -> Option<Self> {
        let (experiment_id, task_id) = id.split_once('_')?;
        if experiment_id.is_empty() || task_id.is_empty() {
            return None;
        }
        Some(Self { experiment_id, task_id })
    }

    pub fn compose(experiment_id: &str, task_id: &str) -> String {
        format!("{}_{}", experiment_id, task_id)
    }
}

impl TaskRecord {
    pub fn new(
        id: impl Into<String>,
        experiment_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            experiment_id: experiment_id.into(),
            tool_name: tool_name.into(),
            status: RecordStatus::Success,
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, data: Option<DataReference>) -> Self {
        self.inputs.push(Param::new(name, data));
        self
    }

    pub fn with_optional_input(
        mut self,
        name: impl Into<String>,
        data: Option<DataReference>,
    ) -> Self {
        let mut param = Param::new(name, data);
        param.optional = true;
        self.inputs.push(param);
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, data: Option<DataReference>) -> Self {
        self.outputs.push(Param::new(name, data));
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RecordStatus::Success
    }
}

impl Param {
    pub fn new(name: impl Into<String>, data: Option<DataReference>) -> Self {
        Self {
            name: name.into(),
            param_type: String::new(),
            data,
            optional: false,
        }
    }
}

/// Parameter map submitted to a worker
pub type Params = Map<String, Value>;
