mod context;
mod executor;
mod poll;
mod replay;

pub use context::{ReplayBinding, ReplayContext};
pub use executor::{HttpExecutor, TaskExecutor, TaskState};
pub use poll::{Outcome, PollState, Poller};
pub use replay::{
    resolve_params, ReplayEngine, ReplayPlan, ReplayReport, RunState, Schedule, TaskRun,
};
