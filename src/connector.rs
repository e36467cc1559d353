use std::time::Duration;

use crate::data_store::row_set::RowSet;
use crate::data_store::value::Value;
use crate::errors::Result;
use crate::isolation::TransactionIsolation;

/// Factory for physical database connections.
///
/// The harness only ever needs a handful of capabilities from the database it
/// is pointed at: open a connection, start a transaction at a given isolation
/// level, run a statement, and finish the transaction. Everything that talks
/// to a real engine lives behind this trait so that the scheduler and the
/// assertion engine stay independent of any particular driver.
///
/// Implementations must be `Send` and `Sync`; the scheduler opens one
/// connection per participant and hands each one to its own thread.
///
/// # Examples
///
/// A connector that refuses every connection, which is enough to see the
/// shape of the trait:
///
/// ```no_run
/// use isoscope::prelude::*;
///
/// struct Offline;
///
/// impl Connector for Offline {
///     fn connect(&self) -> Result<Box<dyn Connection>> {
///         Err(HarnessError::Connection("database is offline".to_string()))
///     }
///
///     fn describe(&self) -> String {
///         "offline".to_string()
///     }
/// }
/// ```
pub trait Connector: Send + Sync {
    /// Opens a new, independent connection.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Connection` if the database cannot be reached.
    fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Short description of the target, used in log lines. Must not contain
    /// credentials.
    fn describe(&self) -> String;
}

/// One physical connection to the database.
///
/// The harness drives a connection strictly sequentially from a single thread.
/// A connection is never shared between participants.
pub trait Connection: Send {
    /// Issues the isolation directive for `level` and starts a transaction.
    fn begin(&mut self, level: TransactionIsolation) -> Result<()>;

    /// Executes one statement with positional parameters.
    ///
    /// The call must give up after `timeout` and report `HarnessError::Timeout`.
    /// Lock wait timeouts and deadlocks reported by the engine must surface as
    /// `HarnessError::Query { kind: QueryErrorKind::LockConflict, .. }` so that
    /// scenarios can expect them.
    fn execute(&mut self, sql: &str, params: &[Value], timeout: Duration) -> Result<RowSet>;

    /// Commits the current transaction.
    fn commit(&mut self) -> Result<()>;

    /// Rolls back the current transaction.
    fn rollback(&mut self) -> Result<()>;

    /// Releases the connection. Called exactly once, on teardown.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
