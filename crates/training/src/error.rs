use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Failure categories surfaced to the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    DataExhausted,
    StateShapeMismatch,
    IncompatibleCheckpoint,
    CollectiveTimeout,
    Storage,
    Publish,
    Runtime,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::DataExhausted => "DataExhaustedError",
            ErrorKind::StateShapeMismatch => "StateShapeMismatchError",
            ErrorKind::IncompatibleCheckpoint => "IncompatibleCheckpointError",
            ErrorKind::CollectiveTimeout => "CollectiveTimeoutError",
            ErrorKind::Storage => "StorageError",
            ErrorKind::Publish => "PublishError",
            ErrorKind::Runtime => "RuntimeError",
        }
    }

    /// Process exit code reported by the `train` binary.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Runtime => 1,
            ErrorKind::Configuration => 2,
            ErrorKind::DataExhausted => 3,
            ErrorKind::StateShapeMismatch => 4,
            ErrorKind::IncompatibleCheckpoint => 5,
            ErrorKind::CollectiveTimeout => 6,
            ErrorKind::Storage => 7,
            ErrorKind::Publish => 8,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("data exhausted at step {step}: position {position} beyond {available} sequences and wrap_around is disabled")]
    DataExhausted {
        step: u64,
        position: u64,
        available: u64,
    },
    #[error("state shape mismatch: {0}")]
    StateShapeMismatch(String),
    #[error("incompatible checkpoint {}: {reason}", .path.display())]
    IncompatibleCheckpoint { path: PathBuf, reason: String },
    #[error("collective `{op}` failed on rank {rank}: {detail}")]
    CollectiveTimeout {
        op: &'static str,
        rank: usize,
        detail: String,
    },
    #[error("storage error at {}: {source}", .path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("publish error: {0}")]
    Publish(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("step {step} on rank {rank} failed with {}: {source}", .source.kind())]
    Failed {
        step: u64,
        rank: usize,
        #[source]
        source: Box<TrainingError>,
    },
}

impl TrainingError {
    pub fn configuration(message: impl Into<String>) -> Self {
        TrainingError::Configuration(message.into())
    }

    pub fn validation(errors: Vec<String>) -> Self {
        TrainingError::Validation(errors)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        TrainingError::Runtime(message.into())
    }

    pub fn shape_mismatch(message: impl Into<String>) -> Self {
        TrainingError::StateShapeMismatch(message.into())
    }

    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TrainingError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Storage error for content that was read but failed validation.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        TrainingError::storage(
            path,
            io::Error::new(io::ErrorKind::InvalidData, message.into()),
        )
    }

    pub fn collective(op: &'static str, rank: usize, detail: impl Into<String>) -> Self {
        TrainingError::CollectiveTimeout {
            op,
            rank,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrainingError::Configuration(_) | TrainingError::Validation(_) => {
                ErrorKind::Configuration
            }
            TrainingError::DataExhausted { .. } => ErrorKind::DataExhausted,
            TrainingError::StateShapeMismatch(_) => ErrorKind::StateShapeMismatch,
            TrainingError::IncompatibleCheckpoint { .. } => ErrorKind::IncompatibleCheckpoint,
            TrainingError::CollectiveTimeout { .. } => ErrorKind::CollectiveTimeout,
            TrainingError::Storage { .. } => ErrorKind::Storage,
            TrainingError::Publish(_) => ErrorKind::Publish,
            TrainingError::Runtime(_) => ErrorKind::Runtime,
            TrainingError::Failed { source, .. } => source.kind(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Attaches the step and rank at which the error surfaced. Already
    /// annotated errors keep their original context.
    pub fn at(self, step: u64, rank: usize) -> Self {
        match self {
            annotated @ TrainingError::Failed { .. } => annotated,
            other => TrainingError::Failed {
                step,
                rank,
                source: Box::new(other),
            },
        }
    }

    /// `(step, rank)` of an annotated error.
    pub fn context(&self) -> Option<(u64, usize)> {
        match self {
            TrainingError::Failed { step, rank, .. } => Some((*step, *rank)),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainingError {
    fn from(err: candle_core::Error) -> Self {
        TrainingError::Runtime(err.to_string())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(err: toml::de::Error) -> Self {
        TrainingError::Configuration(err.to_string())
    }
}

impl From<serde_yaml::Error> for TrainingError {
    fn from(err: serde_yaml::Error) -> Self {
        TrainingError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_preserves_kind_and_first_context() {
        let err = TrainingError::DataExhausted {
            step: 4,
            position: 40,
            available: 32,
        }
        .at(4, 1)
        .at(9, 0);

        assert_eq!(err.kind(), ErrorKind::DataExhausted);
        assert_eq!(err.context(), Some((4, 1)));
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("DataExhaustedError"));
    }

    #[test]
    fn validation_joins_messages() {
        let err = TrainingError::validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "invalid configuration: a; b");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
