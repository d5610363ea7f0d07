//! Fixed-interval task scheduler with cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum TaskError {
    /// The task observed a shutdown request and stopped early. Skips the
    /// rest of the tick instead of being treated as a failure.
    #[error("shutdown requested")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A unit of periodic work.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, cancel: &CancellationToken) -> Result<(), TaskError>;
}

/// Run every task once per interval until cancelled. The first round runs
/// immediately; tasks within a round run sequentially, in order.
///
/// A failed task is logged and the round continues with the next task. A
/// cancelled task ends the round; the cancellation check at the top of the
/// loop then ends the scheduler.
pub async fn run_every(interval: Duration, tasks: Vec<Arc<dyn Task>>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately; consume it so the
    // loop body reads "run the round, then wait".
    ticker.tick().await;

    loop {
        for task in &tasks {
            match task.run(&cancel).await {
                Ok(()) => debug!(task = task.name(), "task completed"),
                Err(TaskError::Cancelled) => {
                    debug!(task = task.name(), "task cancelled; skipping rest of round");
                    break;
                }
                Err(TaskError::Failed(err)) => {
                    error!(task = task.name(), error = ?err, "task failed");
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler stopping");
                return;
            }
            _ = ticker.tick() => {}
        }
    }
}
