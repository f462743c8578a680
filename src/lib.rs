// Core infrastructure modules
pub mod core;
pub mod storage;

// Execution layers, leaves first
pub mod taskagent; // Single task under validation, CSI progress
pub mod coord; // Slot locks and coordinated execution
pub mod dag_flow; // Dependency-graph orchestration

// Re-exports for convenience
pub use crate::core::config::CoordinationConfig;
pub use crate::core::errors::{CoordError, ErrorCode, ErrorInfo, FieldError, Result};
pub use storage::{KvStore, MemoryKvStore, SetMode, SetOptions, SledKvStore};

pub use coord::*;
pub use dag_flow::*;
pub use taskagent::*;
