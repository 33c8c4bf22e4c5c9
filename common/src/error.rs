use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Which user function an invocation belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Map,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => f.write_str("map"),
            Phase::Reduce => f.write_str("reduce"),
        }
    }
}

/// A value a user function could not interpret, e.g. a non-numeric count.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode value {value:?} for key {key:?}: {reason}")]
pub struct DecodeError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl DecodeError {
    pub fn new(key: &str, value: &str, reason: impl fmt::Display) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Every way a map or reduce task can fail. All of them are fatal to the
/// task that hit them.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task configuration: {0}")]
    Config(String),

    #[error("failed to fetch `{location}`: {source}")]
    Fetch {
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("store `{}` failed: {source}", path.display())]
    Store {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{phase} function failed for key {key:?}: {source}")]
    Function {
        phase: Phase,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{phase} function for key {key:?} broke the stream contract: {message}")]
    Protocol {
        phase: Phase,
        key: String,
        message: String,
    },

    #[error("{phase} function for key {key:?} did not finish within {limit:?}")]
    Timeout {
        phase: Phase,
        key: String,
        limit: Duration,
    },

    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn store(path: impl AsRef<Path>, source: impl Into<anyhow::Error>) -> Self {
        TaskError::Store {
            path: path.as_ref().to_path_buf(),
            source: source.into(),
        }
    }

    pub fn fetch(location: impl fmt::Display, source: impl Into<anyhow::Error>) -> Self {
        TaskError::Fetch {
            location: location.to_string(),
            source: source.into(),
        }
    }

    /// Classifies the error a user function returned.
    ///
    /// A [`DecodeError`] keeps its type so callers can tell bad data apart
    /// from other function failures.
    pub fn from_function(phase: Phase, key: &str, err: anyhow::Error) -> Self {
        match err.downcast::<DecodeError>() {
            Ok(decode) => TaskError::Decode(decode),
            Err(err) => TaskError::Function {
                phase,
                key: key.to_string(),
                source: err,
            },
        }
    }
}
