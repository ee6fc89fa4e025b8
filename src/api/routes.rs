//! API routes for the replay server

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::analysis::{AnalysisService, DagEditMask, ReplayOutcome, ReplayRequest};
use crate::dag::{DependencyNode, Edge};
use crate::error::FlowError;
use crate::store::MemoryStore;

/// Application state
pub struct AppState {
    pub service: AnalysisService,
    pub store: Arc<MemoryStore>,
    /// Snapshot file rewritten after every replay
    pub snapshot_path: Option<PathBuf>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize, Deserialize)]
pub struct GraphResponse {
    pub experiment_id: String,
    pub tasks: Vec<String>,
    pub edges: Vec<Edge>,
    pub waves: Vec<Vec<String>>,
    pub nodes: Vec<DependencyNode>,
}

/// Replay request body; the analysis id comes from the path
#[derive(Deserialize)]
pub struct ReplayBody {
    pub user_id: String,
    #[serde(default)]
    pub dag_edit_mask: Option<DagEditMask>,
    #[serde(default)]
    pub outer_input: BTreeMap<String, Value>,
}

pub struct ApiError(FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            FlowError::AnalysisNotFound(_) | FlowError::UnknownTask(_) => StatusCode::NOT_FOUND,
            FlowError::MissingRequiredInput { .. }
            | FlowError::CyclicDependency { .. }
            | FlowError::UnresolvedDependency { .. }
            | FlowError::DuplicateTask(_) => StatusCode::UNPROCESSABLE_ENTITY,
            FlowError::Cancelled { .. } => StatusCode::SERVICE_UNAVAILABLE,
            err if err.is_execution_error() => StatusCode::BAD_GATEWAY,
            FlowError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": self.0.to_string(),
            "task_id": self.0.task_id(),
        });
        (status, Json(body)).into_response()
    }
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Dependency graph and wave schedule of an experiment
pub async fn experiment_graph(
    State(state): State<Arc<AppState>>,
    Path(experiment_id): Path<String>,
) -> Result<Json<GraphResponse>, ApiError> {
    let plan = state.service.plan_experiment(&experiment_id).await?;
    let graph = plan.graph().to_state();

    Ok(Json(GraphResponse {
        experiment_id,
        tasks: graph.tasks,
        edges: graph.edges,
        waves: plan.waves().to_vec(),
        nodes: plan.dependencies().nodes(),
    }))
}

pub async fn replay_analysis(
    State(state): State<Arc<AppState>>,
    Path(analysis_id): Path<String>,
    Json(body): Json<ReplayBody>,
) -> Result<Json<ReplayOutcome>, ApiError> {
    let request = ReplayRequest {
        analysis_id,
        user_id: body.user_id,
        dag_edit_mask: body.dag_edit_mask,
        outer_input: body.outer_input,
    };
    let result = state.service.replay_analysis(request).await;

    if let Some(path) = &state.snapshot_path {
        state.store.save(path).await?;
    }

    Ok(Json(result?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let timeout = ApiError(FlowError::TaskTimeout {
            task_id: "t-1".to_string(),
            waited_secs: 3,
        });
        assert_eq!(timeout.status(), StatusCode::BAD_GATEWAY);

        let cancelled = ApiError(FlowError::Cancelled {
            task_id: "t-1".to_string(),
        });
        assert_eq!(cancelled.status(), StatusCode::SERVICE_UNAVAILABLE);

        let missing = ApiError(FlowError::BalanceRecordNotFound("bob".to_string()));
        assert_eq!(missing.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
