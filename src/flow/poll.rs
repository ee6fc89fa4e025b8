use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use super::executor::{TaskExecutor, TaskState};
use crate::error::{FlowError, Result};

/// Terminal result of a submitted task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed { message: Option<String> },
}

/// Lifecycle of one submitted task as seen by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Polling { attempts: u32 },
    Terminal(Outcome),
}

/// Waits for a submitted task to reach a terminal state
///
/// Polls at a fixed interval, yielding to the runtime between polls. The
/// cancellation token and the deadline are checked before every poll.
pub struct Poller<'a> {
    executor: &'a dyn TaskExecutor,
    interval: Duration,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl<'a> Poller<'a> {
    pub fn new(executor: &'a dyn TaskExecutor, interval: Duration) -> Self {
        Self {
            executor,
            interval,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Block until `external_id` is terminal
    ///
    /// `task_id` is the engine-side execution id used in errors.
    pub async fn wait(&self, task_id: &str, external_id: &str) -> Result<Outcome> {
        let started = Instant::now();
        let mut state = PollState::Submitted;

        loop {
            state = match state {
                PollState::Submitted => PollState::Polling { attempts: 0 },
                PollState::Polling { attempts } => {
                    if self.cancel.is_cancelled() {
                        return Err(FlowError::Cancelled {
                            task_id: task_id.to_string(),
                        });
                    }
                    if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
                        return Err(FlowError::TaskTimeout {
                            task_id: task_id.to_string(),
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }

                    let status = self.executor.poll_task_status(external_id).await?;
                    tracing::debug!(
                        "Poll #{} of {} ({}): {:?}",
                        attempts + 1,
                        task_id,
                        external_id,
                        status
                    );

                    match status {
                        TaskState::Pending => {
                            self.pause().await;
                            PollState::Polling { attempts: attempts + 1 }
                        }
                        TaskState::Success => PollState::Terminal(Outcome::Success),
                        TaskState::Failed { message } => {
                            PollState::Terminal(Outcome::Failed { message })
                        }
                    }
                }
                PollState::Terminal(outcome) => return Ok(outcome),
            };
        }
    }

    async fn pause(&self) {
        let mut wake = Instant::now() + self.interval;
        if let Some(deadline) = self.deadline {
            wake = wake.min(deadline);
        }

        tokio::select! {
            _ = sleep_until(wake) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}
