// Infrastructure shared by the lock, coordination and orchestration layers

pub mod config;
pub mod errors;

pub use config::{CoordinationConfig, CoordinationConfigBuilder};
pub use errors::{CoordError, ErrorCode, ErrorInfo, FieldError, Result};
