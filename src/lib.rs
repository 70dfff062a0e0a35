//! mcpflow library
//!
//! Workflow orchestration over Model Context Protocol servers: a
//! declarative node graph interpreted by an async engine, with a
//! transport-polymorphic JSON-RPC client layer underneath. The library
//! can be embedded; the `mcpflow` binary is a thin CLI over it.

pub mod engine;
pub mod error;
pub mod expr;
pub mod health;
pub mod pool;
pub mod transport;
pub mod types;
pub mod workflow;

pub use engine::{
    Engine, EngineOptions, Execution, ExecutionHandle, ExecutionMonitor, ExecutionStatus,
};
pub use error::{Error, Result};
pub use health::{HealthMonitor, HealthMonitorConfig};
pub use pool::{ConnectionPool, PoolConfig};
pub use workflow::Workflow;
