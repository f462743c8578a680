//! Lock-scoped execution of single tasks and task sequences
//!
//! The lock manager enforces at-most-one run per (owner, thread) slot through
//! the store's conditional write; the coordination manager wraps one task in
//! acquire/run/release.

pub mod coordinator;
pub mod hooks;
pub mod lock;
pub mod types;

pub use coordinator::{CoordinationManager, LockStatus, SequenceResult, SequenceStep};
pub use hooks::{CompositeHook, EventHook, ExecutionEvent, LoggingHook, RecordingHook};
pub use lock::LockManager;
pub use types::*;
