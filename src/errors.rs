use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::data_store::observation_log::Observation;
use crate::scenario::StepId;

/// Distinguishes engine failures a scenario may legitimately expect from
/// everything else the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// Lock wait timeout or deadlock detected by the engine.
    LockConflict,
    /// Any other statement failure.
    Other,
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryErrorKind::LockConflict => f.write_str("lock conflict"),
            QueryErrorKind::Other => f.write_str("engine error"),
        }
    }
}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Query failed ({kind}): {message}")]
    Query {
        kind: QueryErrorKind,
        message: String,
    },

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Scenario '{}' aborted: {}", .0.scenario, .0.cause)]
    Scenario(Box<ScenarioFailure>),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    pub fn lock_conflict(message: impl Into<String>) -> Self {
        HarnessError::Query {
            kind: QueryErrorKind::LockConflict,
            message: message.into(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        HarnessError::Query {
            kind: QueryErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        matches!(
            self,
            HarnessError::Query {
                kind: QueryErrorKind::LockConflict,
                ..
            }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HarnessError::Timeout { .. })
    }

    /// Secondary errors raised in a participant because a peer already failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarnessError::Cancelled(_))
    }
}

/// Aggregate raised by the scheduler when a scenario hits an unexpected failure.
///
/// Carries the primary cause together with the partial observation log so the
/// interleaving that led to the failure can be inspected after the fact.
#[derive(Debug)]
pub struct ScenarioFailure {
    /// Name of the scenario that was running.
    pub scenario: String,
    /// The step that failed, when the failure is attributable to one.
    pub step: Option<StepId>,
    /// The first non-cancellation error observed.
    pub cause: HarnessError,
    /// Everything recorded up to the abort.
    pub observations: Vec<Observation>,
}

pub type Result<T> = std::result::Result<T, HarnessError>;
