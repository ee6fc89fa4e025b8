use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::analysis::{Analysis, AnalysisStore, TaskRecordStore};
use crate::dag::{DataKind, DataReference, DataResolver, ResolvedData, TaskRecord};
use crate::error::Result;
use crate::quota::{BalanceStatement, BalanceStore, QuotaRateSource, QuotaRates};

/// Everything the store holds, as written to the snapshot file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub records: Vec<TaskRecord>,
    /// Data references that cannot be derived from record outputs
    #[serde(default)]
    pub data: BTreeMap<String, ResolvedData>,
    #[serde(default)]
    pub analyses: BTreeMap<String, Analysis>,
    #[serde(default)]
    pub balances: BTreeMap<String, f64>,
    #[serde(default)]
    pub statements: Vec<BalanceStatement>,
    #[serde(default)]
    pub rates: QuotaRates,
}

impl StoreState {
    pub fn with_record(mut self, record: TaskRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn with_analysis(mut self, analysis: Analysis) -> Self {
        self.analyses.insert(analysis.id.clone(), analysis);
        self
    }

    pub fn with_balance(mut self, user_id: impl Into<String>, balance: f64) -> Self {
        self.balances.insert(user_id.into(), balance);
        self
    }

    pub fn with_rates(mut self, rates: QuotaRates) -> Self {
        self.rates = rates;
        self
    }

    fn resolve(&self, data_id: &str) -> Option<ResolvedData> {
        if let Some(resolved) = self.data.get(data_id) {
            return Some(resolved.clone());
        }

        self.records.iter().find_map(|record| {
            record.outputs.iter().find_map(|output| match &output.data {
                Some(DataReference::File { id }) if id == data_id => Some(ResolvedData {
                    owning_experiment_id: record.experiment_id.clone(),
                    owning_task_id: record.id.clone(),
                    kind: DataKind::File,
                }),
                _ => None,
            })
        })
    }
}

/// Record store backed by a JSON snapshot file
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_state(StoreState::default())
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let state: StoreState = serde_json::from_str(&json)?;
        tracing::debug!(
            "Loaded {} records and {} analyses from {:?}",
            state.records.len(),
            state.analyses.len(),
            path
        );
        Ok(Self::from_state(state))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let state = self.state.lock().await;
            serde_json::to_string_pretty(&*state)?
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, json)?;
        Ok(())
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> StoreState {
        self.state.lock().await.clone()
    }

    pub async fn insert_analysis(&self, analysis: Analysis) {
        self.state
            .lock()
            .await
            .analyses
            .insert(analysis.id.clone(), analysis);
    }

    pub async fn statements(&self) -> Vec<BalanceStatement> {
        self.state.lock().await.statements.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskRecordStore for MemoryStore {
    async fn list_task_records(&self, experiment_id: &str) -> Result<Vec<TaskRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.experiment_id == experiment_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AnalysisStore for MemoryStore {
    async fn get_analysis(&self, analysis_id: &str) -> Result<Option<Analysis>> {
        Ok(self.state.lock().await.analyses.get(analysis_id).cloned())
    }

    async fn save_analysis(&self, analysis: &Analysis) -> Result<()> {
        self.insert_analysis(analysis.clone()).await;
        Ok(())
    }
}

#[async_trait]
impl DataResolver for MemoryStore {
    async fn resolve_data_reference(&self, data_id: &str) -> Result<Option<ResolvedData>> {
        Ok(self.state.lock().await.resolve(data_id))
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn get_user_balance(&self, user_id: &str) -> Result<Option<f64>> {
        Ok(self.state.lock().await.balances.get(user_id).copied())
    }

    async fn set_user_balance(&self, user_id: &str, balance: f64) -> Result<()> {
        self.state
            .lock()
            .await
            .balances
            .insert(user_id.to_string(), balance);
        Ok(())
    }

    async fn write_balance_statement(&self, statement: &BalanceStatement) -> Result<()> {
        self.state.lock().await.statements.push(statement.clone());
        Ok(())
    }
}

#[async_trait]
impl QuotaRateSource for MemoryStore {
    async fn get_quota_rates(&self) -> Result<QuotaRates> {
        Ok(self.state.lock().await.rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> MemoryStore {
        let state = StoreState::default()
            .with_record(
                TaskRecord::new("t1", "exp", "align")
                    .with_output("bam", Some(DataReference::file("f1"))),
            )
            .with_record(TaskRecord::new("t9", "other", "align"))
            .with_analysis(Analysis::new("a1", "exp"))
            .with_balance("alice", 10.0);
        MemoryStore::from_state(state)
    }

    #[tokio::test]
    async fn test_records_filtered_by_experiment() {
        let store = store();
        let records = store.list_task_records("exp").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "t1");
    }

    #[tokio::test]
    async fn test_resolves_file_outputs() {
        let store = store();
        let resolved = store.resolve_data_reference("f1").await.unwrap().unwrap();
        assert_eq!(resolved.owning_task_id, "t1");
        assert_eq!(resolved.kind, DataKind::File);
        assert!(store.resolve_data_reference("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = store();
        store.set_user_balance("alice", 7.5).await.unwrap();
        store.save(&path).await.unwrap();

        let loaded = MemoryStore::load(&path).unwrap();
        assert_eq!(loaded.get_user_balance("alice").await.unwrap(), Some(7.5));
        assert!(loaded.get_analysis("a1").await.unwrap().is_some());
        assert_eq!(loaded.list_task_records("exp").await.unwrap().len(), 1);
    }
}
