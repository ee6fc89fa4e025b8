pub mod analysis;
pub mod api;
pub mod config;
pub mod dag;
pub mod error;
pub mod flow;
pub mod quota;
pub mod store;

pub use analysis::{
    Analysis, AnalysisService, AnalysisStatus, AnalysisStore, Collaborators, DagEditMask,
    ReplayOutcome, ReplayRequest, TaskRecordStore,
};
pub use api::{ApiServer, ApiServerConfig};
pub use config::{FlowConfig, WorkerConfig};
pub use error::{FlowError, Result};
pub use flow::{HttpExecutor, ReplayBinding, ReplayEngine, ReplayPlan, ReplayReport};
pub use store::{MemoryStore, StoreState};
