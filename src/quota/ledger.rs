use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// What a balance statement was charged for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Analysis,
    Experiment,
    ToolTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRef {
    pub kind: EventKind,
    pub id: String,
}

impl EventRef {
    pub fn analysis(id: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Analysis,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementReason {
    AnalysisReplay,
}

/// Audit record of one balance mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceStatement {
    pub id: String,
    pub user_id: String,
    pub original_balance: f64,
    pub new_balance: f64,
    pub cost: f64,
    pub reason: StatementReason,
    pub event: EventRef,
    pub created_at: DateTime<Utc>,
}

impl BalanceStatement {
    pub fn new(
        user_id: impl Into<String>,
        original_balance: f64,
        cost: f64,
        reason: StatementReason,
        event: EventRef,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            original_balance,
            new_balance: original_balance - cost,
            cost,
            reason,
            event,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// `None` when the user has no balance record
    async fn get_user_balance(&self, user_id: &str) -> Result<Option<f64>>;

    async fn set_user_balance(&self, user_id: &str, balance: f64) -> Result<()>;

    async fn write_balance_statement(&self, statement: &BalanceStatement) -> Result<()>;
}
