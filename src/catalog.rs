//! The built-in demonstrations, one per anomaly an isolation level permits or
//! prevents, all against the fixed `accounts` table.

use std::fmt;
use std::str::FromStr;

use crate::assertion::expectations::AnomalyClass;
use crate::data_store::value::Value;
use crate::errors::{HarnessError, Result};
use crate::isolation::TransactionIsolation;
use crate::scenario::{AnomalyProbe, Detection, ExpectedFailure, Scenario, ScenarioBuilder};

/// The only statements the built-in scenarios issue.
pub mod sql {
    pub const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS accounts (\
        name VARCHAR(64) NOT NULL PRIMARY KEY, \
        balance DECIMAL(12, 2) NOT NULL)";
    pub const DELETE_ACCOUNT: &str = "DELETE FROM accounts WHERE name = ?";
    pub const INSERT_ACCOUNT: &str = "INSERT INTO accounts (name, balance) VALUES (?, ?)";
    pub const SELECT_BALANCE: &str = "SELECT balance FROM accounts WHERE name = ?";
    pub const UPDATE_BALANCE: &str = "UPDATE accounts SET balance = ? WHERE name = ?";
    pub const COUNT_AT_LEAST: &str = "SELECT COUNT(*) FROM accounts WHERE balance >= ?";
}

/// Balance written by the uncommitted update of the dirty read demos.
pub const DIRTY_BALANCE: i64 = 9999;
/// Balance committed between two reads under READ COMMITTED.
pub const COMMITTED_BALANCE: i64 = 7777;
/// Balance committed between two reads under REPEATABLE READ.
pub const SNAPSHOT_BALANCE: i64 = 8888;
/// Balance the blocked writer of the serializable demo tries to write.
pub const CONFLICTING_BALANCE: i64 = 6666;

/// The row every scenario works on and the state it is reset to.
#[derive(Debug, Clone, PartialEq)]
pub struct Fixture {
    /// Name of the account every scenario reads and writes.
    pub subject: String,
    /// Balance the subject is reset to before each scenario.
    pub initial_balance: i64,
    /// Account inserted by the phantom read demo.
    pub phantom: String,
}

impl Default for Fixture {
    fn default() -> Self {
        Self {
            subject: "Alice".to_string(),
            initial_balance: 1000,
            phantom: "Mallory".to_string(),
        }
    }
}

impl Fixture {
    /// Adds setup statements that create the table if needed and reset the
    /// fixture rows.
    fn install(&self, builder: ScenarioBuilder) -> ScenarioBuilder {
        builder
            .setup(sql::CREATE_TABLE, Vec::<Value>::new())
            .setup(sql::DELETE_ACCOUNT, [self.subject_value()])
            .setup(sql::DELETE_ACCOUNT, [self.phantom_value()])
            .setup(
                sql::INSERT_ACCOUNT,
                [self.subject_value(), Value::from(self.initial_balance)],
            )
    }

    fn subject_value(&self) -> Value {
        Value::from(self.subject.as_str())
    }

    fn phantom_value(&self) -> Value {
        Value::from(self.phantom.as_str())
    }
}

/// Selector for the built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioKind {
    DirtyRead,
    ReadCommitted,
    NonRepeatableRead,
    RepeatableRead,
    Serializable,
    PhantomRead,
}

impl ScenarioKind {
    pub const ALL: [ScenarioKind; 6] = [
        ScenarioKind::DirtyRead,
        ScenarioKind::ReadCommitted,
        ScenarioKind::NonRepeatableRead,
        ScenarioKind::RepeatableRead,
        ScenarioKind::Serializable,
        ScenarioKind::PhantomRead,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioKind::DirtyRead => "dirty-read",
            ScenarioKind::ReadCommitted => "read-committed",
            ScenarioKind::NonRepeatableRead => "non-repeatable-read",
            ScenarioKind::RepeatableRead => "repeatable-read",
            ScenarioKind::Serializable => "serializable",
            ScenarioKind::PhantomRead => "phantom-read",
        }
    }

    /// Level the demo is designed for.
    pub fn isolation(&self) -> TransactionIsolation {
        match self {
            ScenarioKind::DirtyRead => TransactionIsolation::ReadUncommitted,
            ScenarioKind::ReadCommitted
            | ScenarioKind::NonRepeatableRead
            | ScenarioKind::PhantomRead => TransactionIsolation::ReadCommitted,
            ScenarioKind::RepeatableRead => TransactionIsolation::RepeatableRead,
            ScenarioKind::Serializable => TransactionIsolation::Serializable,
        }
    }

    /// Builds the scenario for `fixture` at the level it is designed for.
    /// `serialization_failure` decides how a blocked statement is allowed to
    /// fail.
    pub fn build(
        &self,
        fixture: &Fixture,
        serialization_failure: ExpectedFailure,
    ) -> Result<Scenario> {
        self.build_at(fixture, serialization_failure, self.isolation())
    }

    /// Builds the script to run under `isolation` instead.
    ///
    /// At SERIALIZABLE plain reads lock what they read, so the other
    /// transaction's statement that crosses those locks is refused. Those
    /// statements are marked to fail with `serialization_failure` there.
    pub fn build_at(
        &self,
        fixture: &Fixture,
        serialization_failure: ExpectedFailure,
        isolation: TransactionIsolation,
    ) -> Result<Scenario> {
        let demo = Demo {
            kind: *self,
            isolation,
            failure: serialization_failure,
        };
        match self {
            ScenarioKind::DirtyRead | ScenarioKind::ReadCommitted => {
                uncommitted_write_read(fixture, demo)
            }
            ScenarioKind::NonRepeatableRead => {
                committed_write_between_reads(fixture, demo, COMMITTED_BALANCE)
            }
            ScenarioKind::RepeatableRead => {
                committed_write_between_reads(fixture, demo, SNAPSHOT_BALANCE)
            }
            ScenarioKind::Serializable => conflicting_writers(fixture, demo),
            ScenarioKind::PhantomRead => insert_between_range_reads(fixture, demo),
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScenarioKind {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        ScenarioKind::ALL
            .into_iter()
            .find(|kind| kind.name() == wanted)
            .ok_or_else(|| HarnessError::Config(format!("unknown scenario '{}'", s)))
    }
}

/// What a script is built for.
#[derive(Debug, Clone, Copy)]
struct Demo {
    kind: ScenarioKind,
    isolation: TransactionIsolation,
    failure: ExpectedFailure,
}

impl Demo {
    fn builder(&self) -> ScenarioBuilder {
        Scenario::builder(self.kind.name(), self.isolation)
    }

    /// Whether reads lock, making a peer's conflicting statement fail.
    fn reads_lock(&self) -> bool {
        self.isolation == TransactionIsolation::Serializable
    }
}

/// T1 writes without committing, T2 reads the row, T1 rolls back.
///
/// Under READ UNCOMMITTED T2 sees the dirty balance; under READ COMMITTED and
/// REPEATABLE READ it sees the committed one. Under SERIALIZABLE T2's read
/// waits for T1's row lock and is refused.
fn uncommitted_write_read(fixture: &Fixture, demo: Demo) -> Result<Scenario> {
    let dirty = Value::from(DIRTY_BALANCE);
    let builder = demo.builder()
        .description("T2 reads the row while T1 holds an uncommitted update");
    fixture
        .install(builder)
        .participant("T1", |t| {
            t.begin()
                .execute(sql::UPDATE_BALANCE, [dirty.clone(), fixture.subject_value()])
                .sync("t1-wrote")
                .sync("t2-read")
                .rollback()
        })
        .participant("T2", |t| {
            t.sync("t1-wrote")
                .begin()
                .execute(sql::SELECT_BALANCE, [fixture.subject_value()])
                .expect_failure_if(demo.reads_lock(), demo.failure)
                .fetch_into("t2_read")
                .sync("t2-read")
                .commit()
        })
        .probe(AnomalyProbe::new(
            AnomalyClass::DirtyRead,
            Detection::ReadsValue {
                checkpoint: "t2_read".to_string(),
                value: dirty.clone(),
            },
        ))
        .build()
}

/// T1 reads the row twice; T2 commits a new balance between the two reads.
/// Under SERIALIZABLE T1's first read locks the row and T2's update is refused.
fn committed_write_between_reads(
    fixture: &Fixture,
    demo: Demo,
    new_balance: i64,
) -> Result<Scenario> {
    let builder = demo.builder()
        .description("T2 commits an update between two reads of T1");
    fixture
        .install(builder)
        .participant("T1", |t| {
            t.begin()
                .execute(sql::SELECT_BALANCE, [fixture.subject_value()])
                .fetch_into("t1_first_read")
                .sync("t1-read")
                .sync("t2-committed")
                .execute(sql::SELECT_BALANCE, [fixture.subject_value()])
                .fetch_into("t1_second_read")
                .commit()
        })
        .participant("T2", |t| {
            t.sync("t1-read")
                .begin()
                .execute(
                    sql::UPDATE_BALANCE,
                    [Value::from(new_balance), fixture.subject_value()],
                )
                .expect_failure_if(demo.reads_lock(), demo.failure)
                .commit()
                .sync("t2-committed")
        })
        .probe(AnomalyProbe::new(
            AnomalyClass::NonRepeatableRead,
            Detection::Changes {
                first: "t1_first_read".to_string(),
                second: "t1_second_read".to_string(),
            },
        ))
        .expect_value("t1_first_read", fixture.initial_balance)
        .build()
}

/// T2 updates the row and holds the lock; T1 then tries to update the same row
/// and must be refused rather than proceed silently.
fn conflicting_writers(fixture: &Fixture, demo: Demo) -> Result<Scenario> {
    let failure = demo.failure;
    let builder = demo.builder()
        .description("T1 writes a row T2 has already written but not committed");
    fixture
        .install(builder)
        .participant("T1", |t| {
            t.begin()
                .sync("t2-wrote")
                .execute(
                    sql::UPDATE_BALANCE,
                    [Value::from(CONFLICTING_BALANCE), fixture.subject_value()],
                )
                .checkpoint("t1_conflicting_write")
                .expect_failure(failure)
                .sync("t1-refused")
                .commit()
        })
        .participant("T2", |t| {
            t.begin()
                .execute(
                    sql::UPDATE_BALANCE,
                    [Value::from(COMMITTED_BALANCE), fixture.subject_value()],
                )
                .sync("t2-wrote")
                .sync("t1-refused")
                .commit()
        })
        .probe(AnomalyProbe::new(
            AnomalyClass::SerializationFailure,
            Detection::Fails {
                checkpoint: "t1_conflicting_write".to_string(),
                failure,
            },
        ))
        .build()
}

/// T1 counts rows in a balance range twice; T2 commits a new row in that range
/// between the two counts. Under SERIALIZABLE the first count locks the range
/// and the insert is refused.
fn insert_between_range_reads(fixture: &Fixture, demo: Demo) -> Result<Scenario> {
    let threshold = Value::from(fixture.initial_balance);
    let builder = demo.builder()
        .description("T2 inserts a matching row between two range counts of T1");
    fixture
        .install(builder)
        .participant("T1", |t| {
            t.begin()
                .execute(sql::COUNT_AT_LEAST, [threshold.clone()])
                .fetch_into("t1_first_count")
                .sync("t1-counted")
                .sync("t2-inserted")
                .execute(sql::COUNT_AT_LEAST, [threshold.clone()])
                .fetch_into("t1_second_count")
                .commit()
        })
        .participant("T2", |t| {
            t.sync("t1-counted")
                .begin()
                .execute(
                    sql::INSERT_ACCOUNT,
                    [fixture.phantom_value(), Value::from(fixture.initial_balance)],
                )
                .expect_failure_if(demo.reads_lock(), demo.failure)
                .commit()
                .sync("t2-inserted")
        })
        .probe(AnomalyProbe::new(
            AnomalyClass::PhantomRead,
            Detection::Changes {
                first: "t1_first_count".to_string(),
                second: "t1_second_count".to_string(),
            },
        ))
        .build()
}
