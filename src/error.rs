use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::ExitStatus;

/// Errors raised while configuring, starting, or driving a pipeline.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PipelineError {
    /// Invalid or conflicting options. Raised before any process is spawned.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A redirection target could not be opened.
    #[error("cannot open {}: {source}", path.display())]
    Redirect { path: PathBuf, source: io::Error },

    /// A stage could not be launched. Stages spawned before it have been killed.
    #[error("cannot spawn `{command}`: {source}")]
    Spawn { command: String, source: io::Error },

    /// A stage finished unsuccessfully. The whole process group has been killed.
    #[error("`{command}` failed with {status}")]
    Execution { command: String, status: ExitStatus },

    /// A wait exceeded its bound. The whole process group has been killed.
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Return code of the failed stage, for [`Execution`](Self::Execution) errors.
    ///
    /// A stage killed by a signal reports the negated signal number.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PipelineError::Execution { status, .. } => status.returncode(),
            _ => None,
        }
    }

    /// The command the error is about, if it concerns a single stage.
    pub fn command(&self) -> Option<&str> {
        match self {
            PipelineError::Spawn { command, .. }
            | PipelineError::Execution { command, .. }
            | PipelineError::Timeout { command, .. } => Some(command),
            _ => None,
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
