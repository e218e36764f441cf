//! Core domain models for plan execution
//!
//! This module defines the execution context, the compiled plan graph,
//! runtime records and the payloads exchanged with pluggable policies.

pub mod ambiance;
pub mod config;
pub mod node_execution;
pub mod plan;
pub mod response;
pub mod state;

pub use ambiance::*;
pub use node_execution::*;
pub use plan::*;
pub use response::*;
pub use state::*;
