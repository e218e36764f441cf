//! Execution status models

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a node execution or a plan execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created and persisted, not yet facilitated
    Queued,
    /// Facilitators are deciding the execution mode
    Facilitating,
    /// Executing inline, or waiting on spawned children
    Running,
    /// Waiting for asynchronous callbacks
    AsyncWaiting,
    /// Waiting for a delegated task to report back
    TaskWaiting,
    /// Concluded with a failure, awaiting an operator decision
    InterventionWaiting,
    Succeeded,
    Failed,
    Errored,
    Aborted,
    Expired,
    Suspended,
    /// Skip condition held, step never ran
    Skipped,
    /// Failed, but an adviser chose to ignore the failure
    IgnoreFailed,
}

impl Status {
    /// Statuses a node can conclude into and never leave on its own
    pub const FINAL: &'static [Status] = &[
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Aborted,
        Status::Expired,
        Status::Suspended,
        Status::Skipped,
        Status::IgnoreFailed,
    ];

    /// Statuses a step can be concluded from
    pub const CONCLUDABLE: &'static [Status] = &[
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
    ];

    /// Statuses an abort or expiry can force a conclusion from
    pub const INTERRUPTIBLE: &'static [Status] = &[
        Status::Queued,
        Status::Facilitating,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::InterventionWaiting,
    ];

    /// Failure statuses an adviser may override or wait on
    pub const BROKE: &'static [Status] = &[Status::Failed, Status::Errored, Status::Expired];

    pub fn is_final(self) -> bool {
        Self::FINAL.contains(&self)
    }

    pub fn is_positive(self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped | Status::IgnoreFailed)
    }

    pub fn is_broke(self) -> bool {
        Self::BROKE.contains(&self)
    }

    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Status::AsyncWaiting | Status::TaskWaiting | Status::InterventionWaiting
        )
    }

    /// Position in the lifecycle partial order; final statuses share the top rank
    pub fn rank(self) -> u8 {
        match self {
            Status::Queued => 0,
            Status::Facilitating => 1,
            Status::Running => 2,
            Status::AsyncWaiting | Status::TaskWaiting => 3,
            Status::InterventionWaiting => 4,
            _ => 5,
        }
    }

    /// Combine the statuses of concluded children into the parent's status
    ///
    /// Aborted wins over expired, expired over failures, and any failure over
    /// success. No children counts as success.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        statuses
            .into_iter()
            .map(|status| match status {
                Status::Skipped | Status::IgnoreFailed => Status::Succeeded,
                other => other,
            })
            .max_by_key(|status| match status {
                Status::Aborted => 5,
                Status::Expired => 4,
                Status::Errored => 3,
                Status::Failed => 2,
                Status::Succeeded => 0,
                _ => 1,
            })
            .unwrap_or(Status::Succeeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Facilitating => "FACILITATING",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Suspended => "SUSPENDED",
            Status::Skipped => "SKIPPED",
            Status::IgnoreFailed => "IGNORE_FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Status> {
        const ALL: &[Status] = &[
            Status::Queued,
            Status::Facilitating,
            Status::Running,
            Status::AsyncWaiting,
            Status::TaskWaiting,
            Status::InterventionWaiting,
            Status::Succeeded,
            Status::Failed,
            Status::Errored,
            Status::Aborted,
            Status::Expired,
            Status::Suspended,
            Status::Skipped,
            Status::IgnoreFailed,
        ];
        ALL.iter().copied().find(|status| status.as_str() == value)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a failed node failed, when it was not the step's own business logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorMarker {
    /// An unexpected error inside facilitation, invocation or advisement
    Errored,
    /// The remote executor itself failed
    Infrastructure,
}
