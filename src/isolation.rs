use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// The four ANSI isolation levels a scenario can run its sessions under.
///
/// The harness never implements these levels itself. Each variant only decides
/// which directive is sent to the engine before a transaction starts and which
/// row of the expectation table a verdict is judged against.
pub enum TransactionIsolation {
    /// **Read Uncommitted:**
    ///
    /// A transaction may observe writes other transactions have not committed
    /// yet. Dirty reads, non-repeatable reads and phantoms are all permitted.
    ReadUncommitted,
    /// **Read Committed:**
    ///
    /// Every read observes only committed data, but two reads of the same row
    /// inside one transaction may disagree if another transaction commits in
    /// between. Dirty reads are prevented; non-repeatable reads and phantoms
    /// are permitted.
    ReadCommitted,
    /// **Repeatable Read:**
    ///
    /// The first read establishes a snapshot and later reads of the same rows
    /// return the same values. Whether range queries may still see phantoms
    /// depends on the engine (InnoDB consistent reads do not).
    RepeatableRead,
    /// **Serializable:**
    ///
    /// Transactions behave as if executed one after another. Engines enforce
    /// this with locking or validation, so a conflicting writer is blocked and
    /// eventually fails with a lock conflict instead of proceeding silently.
    Serializable,
}

impl TransactionIsolation {
    /// All levels, weakest first.
    pub const ALL: [TransactionIsolation; 4] = [
        TransactionIsolation::ReadUncommitted,
        TransactionIsolation::ReadCommitted,
        TransactionIsolation::RepeatableRead,
        TransactionIsolation::Serializable,
    ];

    /// The level as it appears in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            TransactionIsolation::ReadUncommitted => "READ UNCOMMITTED",
            TransactionIsolation::ReadCommitted => "READ COMMITTED",
            TransactionIsolation::RepeatableRead => "REPEATABLE READ",
            TransactionIsolation::Serializable => "SERIALIZABLE",
        }
    }

    /// Kebab-case name used on the command line.
    pub fn cli_name(&self) -> &'static str {
        match self {
            TransactionIsolation::ReadUncommitted => "read-uncommitted",
            TransactionIsolation::ReadCommitted => "read-committed",
            TransactionIsolation::RepeatableRead => "repeatable-read",
            TransactionIsolation::Serializable => "serializable",
        }
    }
}

impl fmt::Display for TransactionIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for TransactionIsolation {
    type Err = HarnessError;

    /// Accepts `read-committed`, `read_committed`, `READ COMMITTED` and friends.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | '_' | ' ' => ' ',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        TransactionIsolation::ALL
            .into_iter()
            .find(|level| level.as_sql() == normalized)
            .ok_or_else(|| HarnessError::Config(format!("unknown isolation level '{}'", s)))
    }
}
