//! Lifecycle notifications emitted while plans run

use crate::core::{Ambiance, Status};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Events that can occur during a plan execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStart {
        ambiance: Ambiance,
        timestamp: DateTime<Utc>,
    },
    PipelineEnd {
        ambiance: Ambiance,
        status: Status,
        timestamp: DateTime<Utc>,
    },
    PipelineAbort {
        ambiance: Ambiance,
        timestamp: DateTime<Utc>,
    },
    PipelineTimeout {
        ambiance: Ambiance,
        timestamp: DateTime<Utc>,
    },
    StageStart {
        ambiance: Ambiance,
        timestamp: DateTime<Utc>,
    },
    StageEnd {
        ambiance: Ambiance,
        status: Status,
        timestamp: DateTime<Utc>,
    },
    /// A node execution reached a terminal or waiting status
    NodeStatusChanged {
        ambiance: Ambiance,
        node_execution_id: Uuid,
        status: Status,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ExecutionEvent::PipelineStart { .. } => "PIPELINE_START",
            ExecutionEvent::PipelineEnd { .. } => "PIPELINE_END",
            ExecutionEvent::PipelineAbort { .. } => "PIPELINE_ABORT",
            ExecutionEvent::PipelineTimeout { .. } => "PIPELINE_TIMEOUT",
            ExecutionEvent::StageStart { .. } => "STAGE_START",
            ExecutionEvent::StageEnd { .. } => "STAGE_END",
            ExecutionEvent::NodeStatusChanged { .. } => "NODE_STATUS_CHANGED",
        }
    }

    pub fn ambiance(&self) -> &Ambiance {
        match self {
            ExecutionEvent::PipelineStart { ambiance, .. }
            | ExecutionEvent::PipelineEnd { ambiance, .. }
            | ExecutionEvent::PipelineAbort { ambiance, .. }
            | ExecutionEvent::PipelineTimeout { ambiance, .. }
            | ExecutionEvent::StageStart { ambiance, .. }
            | ExecutionEvent::StageEnd { ambiance, .. }
            | ExecutionEvent::NodeStatusChanged { ambiance, .. } => ambiance,
        }
    }
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of execution events to registered handlers
#[derive(Default)]
pub struct LifecycleNotifier {
    handlers: RwLock<Vec<EventHandler>>,
}

impl LifecycleNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, handler: EventHandler) {
        self.handlers.write().await.push(handler);
    }

    /// Emit an event to all handlers
    pub async fn notify(&self, event: ExecutionEvent) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}
