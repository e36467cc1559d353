use std::fmt;

use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use log::debug;
use parking_lot::Mutex;

use crate::data_store::value::Value;
use crate::errors::{HarnessError, QueryErrorKind};
use crate::scenario::StepId;

/// Coarse classification of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Connection,
    State,
    LockConflict,
    Query,
    Timeout,
    Cancelled,
    Scenario,
    Config,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Connection => "connection error",
            ErrorClass::State => "state error",
            ErrorClass::LockConflict => "lock conflict",
            ErrorClass::Query => "query error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Scenario => "scenario error",
            ErrorClass::Config => "config error",
        };
        f.write_str(name)
    }
}

/// A failure as it is kept in the log: classified and rendered, detached from
/// the live error value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&HarnessError> for ObservedError {
    fn from(err: &HarnessError) -> Self {
        let class = match err {
            HarnessError::Connection(_) => ErrorClass::Connection,
            HarnessError::State(_) => ErrorClass::State,
            HarnessError::Query {
                kind: QueryErrorKind::LockConflict,
                ..
            } => ErrorClass::LockConflict,
            HarnessError::Query { .. } => ErrorClass::Query,
            HarnessError::Timeout { .. } => ErrorClass::Timeout,
            HarnessError::Cancelled(_) => ErrorClass::Cancelled,
            HarnessError::Scenario(_) => ErrorClass::Scenario,
            HarnessError::Config(_) => ErrorClass::Config,
        };
        Self {
            class,
            message: err.to_string(),
        }
    }
}

/// What a step produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    /// `BEGIN`, `COMMIT`, `ROLLBACK` or a rendezvous finished.
    Completed,
    /// A statement ran.
    Executed { rows: usize, rows_affected: u64 },
    /// First column of the fetched row; `None` once the cursor is exhausted.
    Fetched(Option<Value>),
    /// The step failed.
    Failed(ObservedError),
    /// Not run: an earlier expected failure already ended the transaction.
    Skipped,
}

impl Captured {
    pub fn is_failure(&self) -> bool {
        matches!(self, Captured::Failed(_))
    }

    /// The fetched value, flattening an exhausted cursor to `Null`.
    pub fn value(&self) -> Option<Value> {
        match self {
            Captured::Fetched(value) => Some(value.clone().unwrap_or(Value::Null)),
            _ => None,
        }
    }
}

impl fmt::Display for Captured {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Captured::Completed => f.write_str("ok"),
            Captured::Executed {
                rows,
                rows_affected,
            } => {
                if *rows > 0 {
                    write!(f, "{} row(s)", rows)
                } else {
                    write!(f, "{} row(s) affected", rows_affected)
                }
            }
            Captured::Fetched(Some(value)) => write!(f, "{}", value),
            Captured::Fetched(None) => f.write_str("no row"),
            Captured::Failed(err) => write!(f, "FAILED [{}] {}", err.class, err.message),
            Captured::Skipped => f.write_str("skipped, transaction already refused"),
        }
    }
}

/// One entry of the observation log.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Position in the log; strictly increasing in append order.
    pub seq: u64,
    /// The step that produced this entry.
    pub step: StepId,
    /// Human readable rendering of the step's action.
    pub action: String,
    /// Checkpoint name the scenario gave this step, if any.
    pub checkpoint: Option<String>,
    pub captured: Captured,
    /// Wall-clock time the step finished. Informational only.
    pub at: DateTime<Local>,
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} -> {}",
            self.at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.step.participant,
            self.action,
            self.captured
        )
    }
}

/// Append-only, thread-safe log of observations produced during a run.
///
/// Sequence numbers are assigned under the same lock that appends the entry,
/// so `seq` order and log order are the same thing. An optional listener
/// receives a copy of every entry as it is appended, which is how the command
/// line prints steps live.
pub struct ObservationLog {
    entries: Mutex<Vec<Observation>>,
    listener: Option<Sender<Observation>>,
}

impl Default for ObservationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ObservationLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            listener: None,
        }
    }

    /// Creates a log that forwards every appended entry to `listener`.
    pub fn with_listener(listener: Sender<Observation>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            listener: Some(listener),
        }
    }

    /// Appends an entry and returns the stored copy.
    pub fn append(
        &self,
        step: StepId,
        action: String,
        checkpoint: Option<String>,
        captured: Captured,
    ) -> Observation {
        let mut entries = self.entries.lock();
        let observation = Observation {
            seq: entries.len() as u64,
            step,
            action,
            checkpoint,
            captured,
            at: Local::now(),
        };
        entries.push(observation.clone());
        if let Some(listener) = &self.listener {
            // Send while still holding the lock so listeners see log order.
            if listener.send(observation.clone()).is_err() {
                debug!("Observation listener disconnected at seq {}", observation.seq);
            }
        }
        observation
    }

    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<Observation> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
