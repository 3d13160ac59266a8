//! Error types for convergence verification
//!
//! Each variant carries enough context (object names, expected vs. observed
//! instance sets) to diagnose a failed run without re-running it.

use std::time::Duration;

use thiserror::Error;

/// Main error type for fleet convergence checks
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that was not a 404
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An object the check depends on does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Object kind (e.g., "Secret", "Node")
        kind: String,
        /// Namespaced name or lookup key
        name: String,
    },

    /// Deadline exceeded before the observed state converged
    #[error(
        "timed out after {timeout:?} ({attempts} attempts) waiting for {what}{}",
        observed_suffix(.last_observed)
    )]
    Timeout {
        /// What was being waited on
        what: String,
        /// Total deadline that elapsed
        timeout: Duration,
        /// Number of predicate evaluations performed
        attempts: u32,
        /// Summary of the last state seen before the deadline
        last_observed: Option<String>,
    },

    /// Converged cardinality but wrong membership
    #[error("{context}: missing {missing:?}, unexpected {unexpected:?}")]
    Mismatch {
        /// Which signal disagreed (e.g., "tracker ConfigMap keys")
        context: String,
        /// Expected entries that were not observed
        missing: Vec<String>,
        /// Observed entries that were not expected
        unexpected: Vec<String>,
    },

    /// Malformed secret or artifact payload
    #[error("decode error [{context}]: {message}")]
    Decode {
        /// Object being decoded
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Malformed key material
    #[error("parse error [{context}]: {message}")]
    Parse {
        /// Object being parsed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// Any other failure, including failed writes
    #[error("fatal error [{context}]: {message}")]
    Fatal {
        /// Operation that failed
        context: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a not-found error for an object kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, timeout: Duration, attempts: u32) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
            attempts,
            last_observed: None,
        }
    }

    /// Attach the last observed state to a timeout; other variants pass through
    pub fn with_last_observed(self, observed: impl Into<String>) -> Self {
        match self {
            Self::Timeout {
                what,
                timeout,
                attempts,
                ..
            } => Self::Timeout {
                what,
                timeout,
                attempts,
                last_observed: Some(observed.into()),
            },
            other => other,
        }
    }

    /// Create a membership mismatch error.
    ///
    /// Both lists are sorted so the message is stable across runs.
    pub fn mismatch(
        context: impl Into<String>,
        mut missing: Vec<String>,
        mut unexpected: Vec<String>,
    ) -> Self {
        missing.sort();
        unexpected.sort();
        Self::Mismatch {
            context: context.into(),
            missing,
            unexpected,
        }
    }

    /// Create a decode error
    pub fn decode(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a key parse error
    pub fn parse(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Create a fatal error
    pub fn fatal(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// True for errors that should abort a poll loop and dependent checks
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Kube { .. })
    }

    /// True when the underlying object was absent
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            _ => false,
        }
    }
}

fn observed_suffix(last_observed: &Option<String>) -> String {
    match last_observed {
        Some(observed) => format!("; last observed {}", observed),
        None => String::new(),
    }
}
