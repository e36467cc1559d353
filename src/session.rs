use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use log::{debug, warn};

use crate::connector::{Connection, Connector};
use crate::data_store::row_set::{Row, RowSet};
use crate::data_store::value::Value;
use crate::errors::{HarnessError, Result};
use crate::isolation::TransactionIsolation;
use crate::scenario::ParticipantId;

/// Lifecycle of the transaction owned by a [`SessionHandle`].
///
/// Transitions only go `NotStarted -> Active -> {Committed, RolledBack}`.
/// Teardown may also move `NotStarted` straight to `RolledBack`, since there is
/// nothing to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnStatus {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

impl TxnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::RolledBack)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnStatus::NotStarted => "NOT STARTED",
            TxnStatus::Active => "ACTIVE",
            TxnStatus::Committed => "COMMITTED",
            TxnStatus::RolledBack => "ROLLED BACK",
        };
        f.write_str(name)
    }
}

/// Owns one database connection, its client-side cursor and at most one
/// transaction.
///
/// A handle is created at scenario start and torn down at scenario end no
/// matter how the scenario went: [`SessionHandle::close`] does it explicitly,
/// and `Drop` does the same best-effort if the handle is abandoned on an error
/// path.
pub struct SessionHandle {
    /// Participant this session belongs to; used for log lines.
    participant: ParticipantId,
    /// The physical connection. `None` once closed or abandoned.
    connection: Option<Box<dyn Connection>>,
    /// Current transaction status.
    status: TxnStatus,
    /// Level the current transaction was started with.
    isolation: Option<TransactionIsolation>,
    /// Rows of the last executed statement not fetched yet.
    cursor: VecDeque<Row>,
    /// Upper bound for a single statement.
    statement_timeout: Duration,
}

impl SessionHandle {
    /// Opens a connection for `participant`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Connection` if the connector cannot reach the
    /// database.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use isoscope::prelude::*;
    ///
    /// fn read_balance(connector: &dyn Connector) -> Result<Option<Value>> {
    ///     let mut session = SessionHandle::open(connector, "T1".into(), Duration::from_secs(5))?;
    ///     session.begin(TransactionIsolation::ReadCommitted)?;
    ///     let rows = session.execute(
    ///         "SELECT balance FROM accounts WHERE name = ?",
    ///         &[Value::from("Alice")],
    ///     )?;
    ///     session.commit()?;
    ///     session.close()?;
    ///     Ok(rows.first_value().cloned())
    /// }
    /// ```
    pub fn open(
        connector: &dyn Connector,
        participant: ParticipantId,
        statement_timeout: Duration,
    ) -> Result<Self> {
        let connection = connector.connect()?;
        debug!("Session {} connected to {}", participant, connector.describe());
        Ok(Self {
            participant,
            connection: Some(connection),
            status: TxnStatus::NotStarted,
            isolation: None,
            cursor: VecDeque::new(),
            statement_timeout,
        })
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Isolation level of the current (or last) transaction.
    pub fn isolation(&self) -> Option<TransactionIsolation> {
        self.isolation
    }

    /// Starts a transaction at `level`.
    ///
    /// # Errors
    ///
    /// * `HarnessError::Connection` if the connection is gone.
    /// * `HarnessError::State` if a transaction is already active or the handle
    ///   already reached a terminal state.
    /// * Whatever the engine reports for the isolation directive.
    pub fn begin(&mut self, level: TransactionIsolation) -> Result<()> {
        let participant = &self.participant;
        let connection = self.connection.as_mut().ok_or_else(|| {
            HarnessError::Connection(format!("session {} has no open connection", participant))
        })?;
        match self.status {
            TxnStatus::NotStarted => {}
            TxnStatus::Active => {
                return Err(HarnessError::State(format!(
                    "session {} already has an active transaction",
                    participant
                )));
            }
            terminal => {
                return Err(HarnessError::State(format!(
                    "session {} is {} and accepts no further transactions",
                    participant, terminal
                )));
            }
        }
        connection.begin(level)?;
        self.status = TxnStatus::Active;
        self.isolation = Some(level);
        debug!("Session {} began {} transaction", self.participant, level);
        Ok(())
    }

    /// Executes a statement inside the active transaction and loads its rows
    /// into the cursor, replacing whatever was left there.
    ///
    /// # Errors
    ///
    /// * `HarnessError::State` without an active transaction.
    /// * `HarnessError::Query` for engine failures; lock wait timeouts and
    ///   deadlocks carry `QueryErrorKind::LockConflict`.
    /// * `HarnessError::Timeout` if the statement exceeded the statement
    ///   timeout. The connection is abandoned and the handle becomes
    ///   `RolledBack`, since the engine rolls back on disconnect.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<RowSet> {
        self.require_active("execute")?;
        let participant = &self.participant;
        let connection = self.connection.as_mut().ok_or_else(|| {
            HarnessError::Connection(format!("session {} has no open connection", participant))
        })?;
        match connection.execute(sql, params, self.statement_timeout) {
            Ok(rows) => {
                self.cursor = rows.rows.iter().cloned().collect();
                Ok(rows)
            }
            Err(err) => {
                self.cursor.clear();
                if err.is_timeout() {
                    warn!(
                        "Session {} abandoned its connection after a statement timeout",
                        self.participant
                    );
                    self.abandon();
                }
                Err(err)
            }
        }
    }

    /// Pops the next row from the cursor.
    ///
    /// Returns `Ok(None)` when the last statement produced no (more) rows.
    pub fn fetch(&mut self) -> Result<Option<Row>> {
        self.require_active("fetch")?;
        Ok(self.cursor.pop_front())
    }

    /// Commits the active transaction.
    ///
    /// A no-op if the handle is already terminal. If the engine rejects the
    /// commit the transaction is over anyway: the handle becomes `RolledBack`
    /// and the error is returned.
    pub fn commit(&mut self) -> Result<()> {
        match self.status {
            TxnStatus::Committed | TxnStatus::RolledBack => return Ok(()),
            TxnStatus::NotStarted => {
                return Err(HarnessError::State(format!(
                    "session {} cannot commit before begin",
                    self.participant
                )));
            }
            TxnStatus::Active => {}
        }
        self.cursor.clear();
        let result = match self.connection.as_mut() {
            Some(connection) => connection.commit(),
            None => Err(HarnessError::Connection(format!(
                "session {} lost its connection before commit",
                self.participant
            ))),
        };
        match result {
            Ok(()) => {
                self.status = TxnStatus::Committed;
                debug!("Session {} committed", self.participant);
                Ok(())
            }
            Err(err) => {
                self.status = TxnStatus::RolledBack;
                Err(err)
            }
        }
    }

    /// Rolls back the active transaction.
    ///
    /// A no-op if the handle is already terminal. On a handle that never began
    /// a transaction it only records the terminal state.
    pub fn rollback(&mut self) -> Result<()> {
        match self.status {
            TxnStatus::Committed | TxnStatus::RolledBack => return Ok(()),
            TxnStatus::NotStarted => {
                self.status = TxnStatus::RolledBack;
                return Ok(());
            }
            TxnStatus::Active => {}
        }
        self.cursor.clear();
        // The transaction is finished from our side whatever the engine says.
        self.status = TxnStatus::RolledBack;
        let result = match self.connection.as_mut() {
            Some(connection) => connection.rollback(),
            None => Ok(()),
        };
        debug!("Session {} rolled back", self.participant);
        result
    }

    /// Tears the session down: rolls back an active transaction and closes the
    /// connection. The handle always ends in a terminal state.
    pub fn close(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let rolled_back = self.rollback();
        let closed = match self.connection.take() {
            Some(mut connection) => connection.close(),
            None => Ok(()),
        };
        rolled_back.and(closed)
    }

    /// Drops the connection without talking to it again.
    fn abandon(&mut self) {
        self.connection = None;
        self.cursor.clear();
        if !self.status.is_terminal() {
            self.status = TxnStatus::RolledBack;
        }
    }

    fn require_active(&self, operation: &str) -> Result<()> {
        if self.status == TxnStatus::Active {
            Ok(())
        } else {
            Err(HarnessError::State(format!(
                "session {} cannot {} while {}",
                self.participant, operation, self.status
            )))
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.connection.is_none() && self.status.is_terminal() {
            return;
        }
        if let Err(e) = self.teardown() {
            warn!("Session {} teardown failed: {}", self.participant, e);
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("participant", &self.participant)
            .field("status", &self.status)
            .field("isolation", &self.isolation)
            .field("connected", &self.connection.is_some())
            .field("buffered_rows", &self.cursor.len())
            .finish()
    }
}
