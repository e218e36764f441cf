//! Plan execution engine
//!
//! The engine façade dispatches every entry point to the strategy of the
//! addressed node type; strategies drive the node state machine.

pub mod engine;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod node_strategy;
pub mod plan_strategy;
pub mod scheduler;
pub mod strategy;

pub use engine::{EngineBuilder, ExecutionEngine};
pub use error::{EngineError, ErrorKind, PolicyError};
pub use executor::{delegate_tasks, Delegation};
pub use lifecycle::{EventHandler, ExecutionEvent, LifecycleNotifier};
pub use scheduler::{ExecutionScheduler, SchedulingStrategy};
pub use strategy::{Conclusion, NodeExecutionStrategy, NodeLinks, RunNodeRequest};
