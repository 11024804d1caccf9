//! Stasis Core - session data model and shared infrastructure
//!
//! This crate defines the session data model, the granular operations that can be
//! applied against storage, the storage backend contract, and the error, logging and
//! configuration plumbing shared by the rest of the workspace.

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod operations;
pub mod traits;
pub mod types;

pub use async_utils::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use operations::*;
pub use traits::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;
