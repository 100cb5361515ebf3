use crate::models::StreamKind;
use thiserror::Error;

/// Phase of a command invocation in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// Specification rejected or a stream resource could not be acquired.
    /// No process was spawned.
    Setup,
    /// The executable could not be located or the OS refused to spawn it.
    ProcessCreation,
    /// The process ran but draining its streams or reaping it failed.
    Teardown,
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Invalid specification: {0}")]
    InvalidSpecification(String),

    #[error("Failed to acquire {stream} resource: {source}")]
    ResourceAcquisition {
        stream: StreamKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to create process {executable}: {source}")]
    ProcessCreation {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to drain {stream}: {source}")]
    Drain {
        stream: StreamKind,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Spec file error: {0}")]
    SpecFile(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ExecError {
    pub fn phase(&self) -> FailurePhase {
        match self {
            ExecError::InvalidSpecification(_)
            | ExecError::ResourceAcquisition { .. }
            | ExecError::SpecFile(_)
            | ExecError::IoError(_) => FailurePhase::Setup,
            ExecError::ExecutableNotFound(_) | ExecError::ProcessCreation { .. } => {
                FailurePhase::ProcessCreation
            }
            ExecError::Drain { .. } | ExecError::Wait(_) => FailurePhase::Teardown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
