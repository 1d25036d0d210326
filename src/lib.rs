//! code-runner library
//!
//! Runs untrusted programs in five languages behind a uniform request
//! contract:
//! - Toolchain registry mapping language identifiers to compile/run recipes
//! - Per-job workspaces that are always reclaimed
//! - Process execution with deadlines, output caps and process-tree kill
//! - A coordinator with admission control, served over HTTP or MCP stdio

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod http;
pub mod job;
pub mod mcp;
pub mod normalize;
pub mod toolchain;
pub mod workspace;

pub use coordinator::{ExecuteRequest, JobCoordinator};
pub use error::ExecError;
pub use normalize::ExecutionResult;
