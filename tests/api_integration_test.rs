//! Integration tests for the replay API server

mod common;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

use common::*;
use datalab_flow::analysis::Analysis;
use datalab_flow::api::{router, AppState};
use datalab_flow::MemoryStore;

/// Serve the router on an ephemeral port in the background
async fn start_test_server(
    executor: Arc<ScriptedExecutor>,
    snapshot: Option<PathBuf>,
) -> Result<SocketAddr> {
    let state = state_with(chain()).with_analysis(Analysis::new("a1", EXP));
    let (service, store) = service(state, executor, fast_config());
    let app = router(Arc::new(AppState {
        service,
        store,
        snapshot_path: snapshot,
    }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn client() -> Result<Client> {
    Ok(Client::builder().no_proxy().build()?)
}

async fn get(addr: SocketAddr, path: &str) -> Result<(StatusCode, Value)> {
    let response = client()?.get(format!("http://{}{}", addr, path)).send().await?;
    Ok((response.status(), response.json().await?))
}

async fn replay(addr: SocketAddr, analysis_id: &str, body: Value) -> Result<(StatusCode, Value)> {
    let response = client()?
        .post(format!("http://{}/analyses/{}/replay", addr, analysis_id))
        .json(&body)
        .send()
        .await?;
    Ok((response.status(), response.json().await?))
}

#[tokio::test]
async fn test_health_check() -> Result<()> {
    let addr = start_test_server(Arc::new(ScriptedExecutor::new()), None).await?;
    let (status, body) = get(addr, "/health").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    Ok(())
}

#[tokio::test]
async fn test_experiment_graph() -> Result<()> {
    let addr = start_test_server(Arc::new(ScriptedExecutor::new()), None).await?;
    let (status, body) = get(addr, "/experiments/exp/graph").await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["waves"], json!([["T1"], ["T2"], ["T3"]]));
    assert_eq!(body["tasks"], json!(["T1", "T2", "T3"]));
    assert_eq!(
        body["edges"],
        json!([{ "from": "T1", "to": "T2" }, { "from": "T2", "to": "T3" }])
    );
    Ok(())
}

#[tokio::test]
async fn test_replay_persists_snapshot() -> Result<()> {
    let dir = TempDir::new()?;
    let snapshot = dir.path().join("store.json");
    let executor = Arc::new(ScriptedExecutor::new());
    let addr = start_test_server(executor.clone(), Some(snapshot.clone())).await?;

    let (status, body) = replay(addr, "a1", json!({ "user_id": "alice" })).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "SUCCESS");
    assert_eq!(executor.submissions().len(), 3);

    let saved = MemoryStore::load(&snapshot)?.snapshot().await;
    assert_eq!(saved.analyses["a1"].status, datalab_flow::AnalysisStatus::Success);
    assert_eq!(saved.statements.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_replay_failure_is_reported_in_body() -> Result<()> {
    let executor = Arc::new(ScriptedExecutor::new().failing("tool-T2", "bad input"));
    let addr = start_test_server(executor, None).await?;

    let (status, body) = replay(addr, "a1", json!({ "user_id": "alice" })).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FAILED");
    assert!(body["failing_task_id"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_replay_error_statuses() -> Result<()> {
    let addr = start_test_server(Arc::new(ScriptedExecutor::new()), None).await?;

    let (status, _) = replay(addr, "missing", json!({ "user_id": "alice" })).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Unknown user: rejected before any task is submitted
    let (status, _) = replay(addr, "a1", json!({ "user_id": "bob" })).await?;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, body) = replay(
        addr,
        "a1",
        json!({ "user_id": "alice", "dag_edit_mask": { "disabled_task_ids": ["T2"] } }),
    )
    .await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["task_id"], "T3");
    Ok(())
}

#[tokio::test]
async fn test_rejected_submission_marks_analysis_failed() -> Result<()> {
    let executor = Arc::new(ScriptedExecutor::new().rejecting("tool-T1"));
    let addr = start_test_server(executor, None).await?;

    let (status, body) = replay(addr, "a1", json!({ "user_id": "alice" })).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "FAILED");
    assert!(body["message"].as_str().unwrap_or_default().contains("rejected"));
    Ok(())
}
