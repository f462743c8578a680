pub mod csi;
pub mod executor;
pub mod registry;
pub mod validation;

pub use csi::{Csi, PENDING_STEP};
pub use executor::{task_fn, FnTask, TaskCallable, TaskConfig, TaskExecutor, TaskResult};
pub use registry::TaskRegistry;
pub use validation::{JsonSchemaValidator, ValidationOutcome, Validator};
