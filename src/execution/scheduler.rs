//! Execution scheduler - decides where node work runs

use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::debug;

/// Strategy for scheduling node starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingStrategy {
    /// Run every start in place, one node at a time (deterministic)
    #[default]
    Inline,

    /// Run every start on its own tokio task, so siblings overlap
    Spawned,
}

/// Runs scheduled work according to a strategy
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Run `work` in place or on a spawned task
    ///
    /// `work` must handle its own errors; nothing observes the result.
    pub async fn schedule<F>(&self, label: &str, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.strategy {
            SchedulingStrategy::Inline => work.await,
            SchedulingStrategy::Spawned => {
                debug!("Spawning {}", label);
                tokio::spawn(work);
            }
        }
    }
}
