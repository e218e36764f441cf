//! plan-engine - a durable node-execution engine for compiled plans

pub mod advisement;
pub mod cli;
pub mod core;
pub mod events;
pub mod execution;
pub mod expression;
pub mod facilitation;
pub mod persistence;
pub mod step;
pub mod task;

// Re-export commonly used types
pub use core::{Ambiance, NodeExecution, Plan, PlanExecution, PlanNode, Status};
pub use events::{SdkResponseEvent, SdkResponseEventEnvelope};
pub use execution::{EngineError, ExecutionEngine, ExecutionEvent, SchedulingStrategy};
