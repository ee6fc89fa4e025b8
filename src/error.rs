//! Error types for dependency extraction, scheduling and replay
//!
//! Extraction and scheduling errors are raised before anything is submitted
//! to a worker. Execution errors halt further waves of a running replay.

use thiserror::Error;

/// Main error type for the replay engine
#[derive(Error, Debug)]
pub enum FlowError {
    /// A data reference could not be classified (strict extraction only)
    #[error("Unresolved data reference {data_id} on input '{param}' of task {task_id}")]
    UnresolvedDependency {
        task_id: String,
        param: String,
        data_id: String,
    },

    /// The topological sort could not place every task
    #[error("Cyclic dependency between tasks: {}", tasks.join(", "))]
    CyclicDependency { tasks: Vec<String> },

    /// A task id was referenced that is not part of the graph
    #[error("Task {0} not found")]
    UnknownTask(String),

    #[error("Task {0} already exists")]
    DuplicateTask(String),

    /// A required input has no value at replay time
    #[error("Task {task_id} is missing required input '{param}'")]
    MissingRequiredInput { task_id: String, param: String },

    /// The execution collaborator rejected a submission
    #[error("Submission of tool '{tool_name}' rejected: {message}")]
    ExternalSubmission { tool_name: String, message: String },

    /// A submitted task reported failure
    #[error("Task {task_id} failed: {}", message.as_deref().unwrap_or("no message"))]
    TaskExecutionFailed {
        task_id: String,
        message: Option<String>,
    },

    /// A submitted task did not reach a terminal state in time
    #[error("Task {task_id} timed out after {waited_secs}s")]
    TaskTimeout { task_id: String, waited_secs: u64 },

    /// The replay was cancelled
    #[error("Replay cancelled at task {task_id}")]
    Cancelled { task_id: String },

    /// Usage samples too sparse or malformed for a weighted estimate
    #[error("Insufficient usage data for {task_id}: {reason}")]
    InsufficientUsageData { task_id: String, reason: String },

    /// Every user must own exactly one balance record
    #[error("Balance record not found for user {0}")]
    BalanceRecordNotFound(String),

    #[error("Analysis {0} not found")]
    AnalysisNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for replay operations
pub type Result<T> = std::result::Result<T, FlowError>;

impl FlowError {
    /// Whether this error happened while tasks were executing, as opposed to
    /// while the replay was being constructed.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            FlowError::ExternalSubmission { .. }
                | FlowError::TaskExecutionFailed { .. }
                | FlowError::TaskTimeout { .. }
                | FlowError::Cancelled { .. }
        )
    }

    /// Id of the task the error is about, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            FlowError::UnresolvedDependency { task_id, .. }
            | FlowError::MissingRequiredInput { task_id, .. }
            | FlowError::TaskExecutionFailed { task_id, .. }
            | FlowError::TaskTimeout { task_id, .. }
            | FlowError::Cancelled { task_id }
            | FlowError::InsufficientUsageData { task_id, .. } => Some(task_id),
            FlowError::UnknownTask(task_id) | FlowError::DuplicateTask(task_id) => Some(task_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = FlowError::CyclicDependency {
            tasks: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(error.to_string(), "Cyclic dependency between tasks: a, b");

        let error = FlowError::TaskTimeout {
            task_id: "t-1".to_string(),
            waited_secs: 5,
        };
        assert!(error.to_string().contains("timed out after 5s"));

        let error = FlowError::TaskExecutionFailed {
            task_id: "t-1".to_string(),
            message: None,
        };
        assert!(error.to_string().ends_with("no message"));
    }

    #[test]
    fn test_error_classification() {
        let failed = FlowError::TaskExecutionFailed {
            task_id: "t-1".to_string(),
            message: Some("oom".to_string()),
        };
        assert!(failed.is_execution_error());
        assert_eq!(failed.task_id(), Some("t-1"));

        let missing = FlowError::MissingRequiredInput {
            task_id: "t-3".to_string(),
            param: "table".to_string(),
        };
        assert!(!missing.is_execution_error());
        assert_eq!(missing.task_id(), Some("t-3"));
    }
}
