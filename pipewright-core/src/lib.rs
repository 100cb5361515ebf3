pub mod error;
pub mod models;

pub use error::{ExecError, FailurePhase, Result};
pub use models::*;
