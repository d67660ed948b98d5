use std::time::Duration;
use thiserror::Error;

/// Errors raised while turning caller input into a [`ProcessSpec`](crate::ProcessSpec)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpecError {
    #[error("command must contain at least one token")]
    EmptyCommand,

    #[error("could not tokenize command line: {input}")]
    Tokenize { input: String },
}

/// Core error types for supervisor operations
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("invalid process spec #{index}: {source}")]
    InvalidSpec {
        index: usize,
        #[source]
        source: SpecError,
    },

    #[error("failed to spawn process #{index} ({name}) with program `{program}`: {source}")]
    Spawn {
        index: usize,
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} waiting for {running} process(es) to exit")]
    WaitTimeout { timeout: Duration, running: usize },

    #[error("launch plan error: {0}")]
    Plan(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Check if this error came from the OS refusing to create a child
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, SupervisorError::Spawn { .. })
    }

    /// Position of the offending spec in the list passed to `start`, if any
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            SupervisorError::Spawn { index, .. } | SupervisorError::InvalidSpec { index, .. } => {
                Some(*index)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SupervisorError {
    fn from(e: serde_json::Error) -> Self {
        SupervisorError::Plan(e.to_string())
    }
}
