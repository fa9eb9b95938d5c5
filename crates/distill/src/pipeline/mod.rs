//! Pipelines: the ordered stages each (tool type, content type) pair runs,
//! and the executor that drives a job through them.

pub mod context;
pub mod error;
pub mod executor;
pub mod registry;
pub mod stage;

pub use context::{StageContext, StageServices};
pub use error::StageError;
pub use executor::StageExecutor;
pub use registry::{resolve, supported_pairs, Pipeline, StageSpec};
pub use stage::StageHandler;
