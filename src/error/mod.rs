mod api_error;
mod engine_error;
mod step_error;

pub use api_error::{ApiError, ErrorCode};
pub use engine_error::EngineError;
pub use step_error::StepError;
