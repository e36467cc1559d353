//! Common utilities for isoscope integration tests.
//!
//! `SimulatedEngine` is an in-memory stand-in for a database server that only
//! knows the `accounts` table and the statements in `isoscope::catalog::sql`.
//! It keeps committed versions as full copies of the table, so visibility per
//! level is a matter of picking the right copy:
//!
//! * READ UNCOMMITTED reads the latest committed table with every other open
//!   transaction's pending writes applied on top.
//! * READ COMMITTED reads the latest committed table.
//! * REPEATABLE READ reads the version current at its first statement.
//! * SERIALIZABLE reads the latest committed table, but every read is a
//!   locking read, as in InnoDB: it takes a shared lock on each row it looks
//!   at, and a range count also locks the range against inserts.
//!
//! Writes take an exclusive row lock until commit or rollback; inserts also
//! wait for range locks held by others. A statement that cannot get its locks
//! within the lock wait timeout fails with a lock conflict, unless the
//! statement timeout runs out first.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::Rng;

use isoscope::catalog::sql;
use isoscope::prelude::*;

type Table = BTreeMap<String, i64>;
type TxnId = u64;

/// Lock key standing for the whole `balance` range of the table.
const RANGE: &str = "\u{0}accounts-range";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
    /// Waits like an exclusive lock but is not held afterwards.
    InsertIntention,
}

#[derive(Debug)]
enum RowLock {
    Shared(Vec<TxnId>),
    Exclusive(TxnId),
}

impl RowLock {
    fn blocks(&self, txn: TxnId, mode: LockMode) -> bool {
        match (self, mode) {
            (RowLock::Exclusive(owner), _) => *owner != txn,
            (RowLock::Shared(_), LockMode::Shared) => false,
            (RowLock::Shared(owners), _) => owners.iter().any(|owner| *owner != txn),
        }
    }

    /// Drops `txn` from the lock; false once nobody holds it.
    fn release(&mut self, txn: TxnId) -> bool {
        match self {
            RowLock::Exclusive(owner) => *owner != txn,
            RowLock::Shared(owners) => {
                owners.retain(|owner| *owner != txn);
                !owners.is_empty()
            }
        }
    }
}

fn grant(locks: &mut HashMap<String, RowLock>, key: &str, txn: TxnId, mode: LockMode) {
    match mode {
        LockMode::Exclusive => {
            locks.insert(key.to_string(), RowLock::Exclusive(txn));
        }
        LockMode::Shared => {
            let lock = locks
                .entry(key.to_string())
                .or_insert_with(|| RowLock::Shared(Vec::new()));
            if let RowLock::Shared(owners) = lock {
                if !owners.contains(&txn) {
                    owners.push(txn);
                }
            }
        }
        LockMode::InsertIntention => {}
    }
}

/// Deadlines of one statement.
#[derive(Debug, Clone, Copy)]
struct Clock {
    lock_deadline: Instant,
    statement_deadline: Instant,
    timeout: Duration,
}

/// A statement failure the engine produces on purpose.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fails with a plain engine error.
    Query(String),
    /// Fails as if the engine had reported a deadlock.
    LockConflict,
    /// Blocks for the given time before running the statement. Honours the
    /// statement timeout.
    Hang(Duration),
}

#[derive(Debug)]
struct EngineState {
    /// Committed versions, oldest first. Never empty.
    versions: Vec<Table>,
    /// Row locks by account name, plus the range lock under `RANGE`.
    locks: HashMap<String, RowLock>,
    /// Uncommitted writes per open transaction; `None` deletes the row.
    pending: HashMap<TxnId, BTreeMap<String, Option<i64>>>,
    next_txn: TxnId,
    faults: Vec<(String, Fault)>,
    fail_connects_after: Option<usize>,
    fail_commits: bool,
    stats: EngineStats,
}

/// Connection and transaction accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub connects: usize,
    pub closes: usize,
    pub live_connections: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub statements: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<EngineState>,
    lock_released: Condvar,
    lock_wait_timeout: Duration,
    forced_level: Option<TransactionIsolation>,
    jitter: Option<Duration>,
}

/// In-memory engine implementing `Connector`. Clones share the same data.
#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    shared: Arc<Shared>,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::build(Duration::from_millis(200), None, None)
    }

    /// An engine whose writers give up on a held row lock after `wait`.
    pub fn with_lock_wait_timeout(wait: Duration) -> Self {
        Self::build(wait, None, None)
    }

    /// An engine that runs every transaction at `level`, whatever was asked
    /// for. Used to check that the harness notices a misbehaving engine.
    pub fn forcing_level(level: TransactionIsolation) -> Self {
        Self::build(Duration::from_millis(200), Some(level), None)
    }

    /// An engine that sleeps up to `max` before every statement.
    pub fn with_jitter(max: Duration) -> Self {
        Self::build(Duration::from_millis(200), None, Some(max))
    }

    fn build(
        lock_wait_timeout: Duration,
        forced_level: Option<TransactionIsolation>,
        jitter: Option<Duration>,
    ) -> Self {
        let state = EngineState {
            versions: vec![Table::new()],
            locks: HashMap::new(),
            pending: HashMap::new(),
            next_txn: 1,
            faults: Vec::new(),
            fail_connects_after: None,
            fail_commits: false,
            stats: EngineStats::default(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                lock_released: Condvar::new(),
                lock_wait_timeout,
                forced_level,
                jitter,
            }),
        }
    }

    /// The engine as the harness wants it.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Injects `fault` into every statement containing `pattern`.
    pub fn inject(&self, pattern: &str, fault: Fault) {
        self.shared.state.lock().faults.push((pattern.to_string(), fault));
    }

    /// Lets `n` connections succeed and refuses the rest.
    pub fn fail_connects_after(&self, n: usize) {
        self.shared.state.lock().fail_connects_after = Some(n);
    }

    pub fn fail_commits(&self, fail: bool) {
        self.shared.state.lock().fail_commits = fail;
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.state.lock().stats
    }

    /// Transactions that are neither committed nor rolled back.
    pub fn open_transactions(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn held_locks(&self) -> usize {
        self.shared.state.lock().locks.len()
    }

    pub fn committed_balance(&self, name: &str) -> Option<i64> {
        let state = self.shared.state.lock();
        state.versions.last().and_then(|table| table.get(name).copied())
    }

    /// Commits `balance` for `name` outside of any session.
    pub fn seed(&self, name: &str, balance: i64) {
        let mut state = self.shared.state.lock();
        let mut table = state.versions.last().cloned().unwrap_or_default();
        table.insert(name.to_string(), balance);
        state.versions.push(table);
    }
}

impl Connector for SimulatedEngine {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = self.shared.state.lock();
        if let Some(limit) = state.fail_connects_after {
            if state.stats.connects >= limit {
                return Err(HarnessError::Connection("too many connections".to_string()));
            }
        }
        state.stats.connects += 1;
        state.stats.live_connections += 1;
        Ok(Box::new(SimulatedConnection {
            shared: Arc::clone(&self.shared),
            txn: None,
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "simulated engine".to_string()
    }
}

#[derive(Debug)]
struct OpenTxn {
    id: TxnId,
    level: TransactionIsolation,
    /// Index into `versions`, taken at the first statement.
    snapshot: Option<usize>,
}

/// One connection to the simulated engine.
pub struct SimulatedConnection {
    shared: Arc<Shared>,
    txn: Option<OpenTxn>,
    closed: bool,
}

impl SimulatedConnection {
    fn finish(&mut self, commit: bool) -> Result<()> {
        let Some(txn) = self.txn.take() else {
            return Ok(());
        };
        let mut state = self.shared.state.lock();
        let writes = state.pending.remove(&txn.id).unwrap_or_default();
        state.locks.retain(|_, lock| lock.release(txn.id));
        let failed = commit && state.fail_commits;
        if commit && !failed {
            if !writes.is_empty() {
                let mut table = state.versions.last().cloned().unwrap_or_default();
                apply(&mut table, &writes);
                state.versions.push(table);
            }
            state.stats.commits += 1;
        } else {
            state.stats.rollbacks += 1;
        }
        drop(state);
        self.shared.lock_released.notify_all();
        if failed {
            Err(HarnessError::query("commit refused by engine"))
        } else {
            Ok(())
        }
    }

    /// The table as this transaction is allowed to read it.
    fn visible(&mut self, state: &EngineState) -> Table {
        let Some(txn) = self.txn.as_mut() else {
            return state.versions.last().cloned().unwrap_or_default();
        };
        let level = self.shared.forced_level.unwrap_or(txn.level);
        let latest = state.versions.len() - 1;
        let mut table = match level {
            TransactionIsolation::ReadUncommitted => {
                let mut table = state.versions[latest].clone();
                for (owner, writes) in &state.pending {
                    if *owner != txn.id {
                        apply(&mut table, writes);
                    }
                }
                table
            }
            TransactionIsolation::ReadCommitted | TransactionIsolation::Serializable => {
                state.versions[latest].clone()
            }
            TransactionIsolation::RepeatableRead => {
                let snapshot = *txn.snapshot.get_or_insert(latest);
                state.versions[snapshot].clone()
            }
        };
        if let Some(own) = state.pending.get(&txn.id) {
            apply(&mut table, own);
        }
        table
    }

    /// Current committed state plus own writes, as seen by a writer.
    fn current(&self, state: &EngineState) -> Table {
        let mut table = state.versions.last().cloned().unwrap_or_default();
        if let Some(txn) = &self.txn {
            if let Some(own) = state.pending.get(&txn.id) {
                apply(&mut table, own);
            }
        }
        table
    }

    fn txn_id(&self) -> Result<TxnId> {
        self.txn
            .as_ref()
            .map(|txn| txn.id)
            .ok_or_else(|| HarnessError::query("no transaction"))
    }

    fn level(&self) -> Option<TransactionIsolation> {
        self.txn
            .as_ref()
            .map(|txn| self.shared.forced_level.unwrap_or(txn.level))
    }

    fn reads_lock(&self) -> bool {
        self.level() == Some(TransactionIsolation::Serializable)
    }

    /// Waits until none of `wanted` conflicts with another transaction's
    /// locks, then takes them.
    fn lock(
        &self,
        state: &mut MutexGuard<'_, EngineState>,
        wanted: &[(String, LockMode)],
        clock: Clock,
    ) -> Result<()> {
        let txn = self.txn_id()?;
        let blocked = |state: &EngineState| {
            wanted.iter().any(|(key, mode)| {
                state
                    .locks
                    .get(key)
                    .is_some_and(|lock| lock.blocks(txn, *mode))
            })
        };
        while blocked(&**state) {
            let wait_until = clock.lock_deadline.min(clock.statement_deadline);
            let timed_out = self
                .shared
                .lock_released
                .wait_until(state, wait_until)
                .timed_out();
            if timed_out && blocked(&**state) {
                if clock.statement_deadline <= clock.lock_deadline {
                    let keys: Vec<&str> = wanted.iter().map(|(key, _)| key.as_str()).collect();
                    return Err(HarnessError::Timeout {
                        what: format!("lock on {}", keys.join(", ")),
                        after: clock.timeout,
                    });
                }
                return Err(HarnessError::lock_conflict(
                    "Lock wait timeout exceeded; try restarting transaction",
                ));
            }
        }
        for (key, mode) in wanted {
            grant(&mut state.locks, key, txn, *mode);
        }
        Ok(())
    }

    fn write(
        &mut self,
        name: &str,
        change: impl FnOnce(Option<i64>) -> Result<Option<Option<i64>>>,
        inserts: bool,
        clock: Clock,
    ) -> Result<RowSet> {
        let txn_id = self.txn_id()?;
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        let mut wanted = vec![(name.to_string(), LockMode::Exclusive)];
        if inserts {
            wanted.push((RANGE.to_string(), LockMode::InsertIntention));
        }
        self.lock(&mut state, &wanted, clock)?;

        let before = self.current(&state).get(name).copied();
        match change(before)? {
            Some(after) => {
                state
                    .pending
                    .entry(txn_id)
                    .or_default()
                    .insert(name.to_string(), after);
                Ok(RowSet::affected(1))
            }
            None => Ok(RowSet::affected(0)),
        }
    }
}

fn apply(table: &mut Table, writes: &BTreeMap<String, Option<i64>>) {
    for (name, value) in writes {
        match value {
            Some(balance) => {
                table.insert(name.clone(), *balance);
            }
            None => {
                table.remove(name);
            }
        }
    }
}

fn text_param(params: &[Value], index: usize) -> Result<String> {
    match params.get(index) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(HarnessError::query(format!(
            "parameter {} must be text, got {:?}",
            index, other
        ))),
    }
}

fn int_param(params: &[Value], index: usize) -> Result<i64> {
    params
        .get(index)
        .and_then(Value::as_f64)
        .map(|v| v as i64)
        .ok_or_else(|| HarnessError::query(format!("parameter {} must be numeric", index)))
}

fn decimal(balance: i64) -> Value {
    Value::Decimal(format!("{}.00", balance))
}

impl Connection for SimulatedConnection {
    fn begin(&mut self, level: TransactionIsolation) -> Result<()> {
        if self.txn.is_some() {
            return Err(HarnessError::query("transaction already open"));
        }
        let mut state = self.shared.state.lock();
        let id = state.next_txn;
        state.next_txn += 1;
        state.pending.insert(id, BTreeMap::new());
        self.txn = Some(OpenTxn {
            id,
            level,
            snapshot: None,
        });
        Ok(())
    }

    fn execute(&mut self, statement: &str, params: &[Value], timeout: Duration) -> Result<RowSet> {
        let started = Instant::now();
        let statement_deadline = started + timeout;

        if let Some(max) = self.shared.jitter {
            let pause = rand::rng().random_range(0..=max.as_millis() as u64);
            thread::sleep(Duration::from_millis(pause));
        }

        let fault = {
            let mut state = self.shared.state.lock();
            state.stats.statements += 1;
            state
                .faults
                .iter()
                .find(|(pattern, _)| statement.contains(pattern.as_str()))
                .map(|(_, fault)| fault.clone())
        };
        match fault {
            Some(Fault::Query(message)) => return Err(HarnessError::query(message)),
            Some(Fault::LockConflict) => {
                return Err(HarnessError::lock_conflict("Deadlock found when trying to get lock"));
            }
            Some(Fault::Hang(pause)) => {
                if pause >= timeout {
                    thread::sleep(timeout);
                    return Err(HarnessError::Timeout {
                        what: format!("statement '{}'", statement),
                        after: timeout,
                    });
                }
                thread::sleep(pause);
            }
            None => {}
        }

        let clock = Clock {
            lock_deadline: Instant::now() + self.shared.lock_wait_timeout,
            statement_deadline,
            timeout,
        };
        match statement {
            sql::CREATE_TABLE => Ok(RowSet::default()),
            sql::SELECT_BALANCE => {
                let name = text_param(params, 0)?;
                let shared = Arc::clone(&self.shared);
                let mut state = shared.state.lock();
                if self.reads_lock() {
                    self.lock(&mut state, &[(name.clone(), LockMode::Shared)], clock)?;
                }
                let rows = self
                    .visible(&state)
                    .get(&name)
                    .map(|balance| vec![decimal(*balance)])
                    .into_iter()
                    .collect();
                Ok(RowSet::with_rows(vec!["balance".to_string()], rows))
            }
            sql::COUNT_AT_LEAST => {
                let threshold = int_param(params, 0)?;
                let shared = Arc::clone(&self.shared);
                let mut state = shared.state.lock();
                if self.reads_lock() {
                    // No index on balance: the scan locks every row and the range.
                    let mut wanted: Vec<(String, LockMode)> = self
                        .current(&state)
                        .into_keys()
                        .map(|name| (name, LockMode::Shared))
                        .collect();
                    wanted.push((RANGE.to_string(), LockMode::Shared));
                    self.lock(&mut state, &wanted, clock)?;
                }
                let count = self
                    .visible(&state)
                    .values()
                    .filter(|balance| **balance >= threshold)
                    .count();
                Ok(RowSet::with_rows(
                    vec!["COUNT(*)".to_string()],
                    vec![vec![Value::Int(count as i64)]],
                ))
            }
            sql::UPDATE_BALANCE => {
                let balance = int_param(params, 0)?;
                let name = text_param(params, 1)?;
                self.write(
                    &name,
                    |before| Ok(before.map(|_| Some(balance))),
                    false,
                    clock,
                )
            }
            sql::INSERT_ACCOUNT => {
                let name = text_param(params, 0)?;
                let balance = int_param(params, 1)?;
                let key = name.clone();
                self.write(
                    &name,
                    move |before| match before {
                        Some(_) => Err(HarnessError::query(format!(
                            "Duplicate entry '{}' for key 'PRIMARY'",
                            key
                        ))),
                        None => Ok(Some(Some(balance))),
                    },
                    true,
                    clock,
                )
            }
            sql::DELETE_ACCOUNT => {
                let name = text_param(params, 0)?;
                self.write(
                    &name,
                    |before| Ok(before.map(|_| None)),
                    false,
                    clock,
                )
            }
            other => Err(HarnessError::query(format!("unsupported statement: {}", other))),
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.finish(true)
    }

    fn rollback(&mut self) -> Result<()> {
        self.finish(false)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.finish(false)?;
        self.closed = true;
        let mut state = self.shared.state.lock();
        state.stats.closes += 1;
        state.stats.live_connections -= 1;
        Ok(())
    }
}

// Disconnecting rolls back, the same as a real server does.
impl Drop for SimulatedConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let _ = self.finish(false);
        self.shared.state.lock().stats.live_connections -= 1;
    }
}

/// Deadlines short enough for tests, with room for the engine's lock waits.
pub fn test_config() -> SchedulerConfig {
    SchedulerConfig {
        barrier_timeout: Duration::from_secs(5),
        statement_timeout: Duration::from_secs(2),
        scenario_timeout: Duration::from_secs(20),
    }
}

pub fn harness(engine: &SimulatedEngine) -> Harness {
    Harness::new(engine.connector(), test_config())
}

/// Builds every catalog scenario with the default fixture.
pub fn catalog() -> Vec<Scenario> {
    ScenarioKind::ALL
        .iter()
        .map(|kind| {
            kind.build(&Fixture::default(), ExpectedFailure::Serialization)
                .unwrap()
        })
        .collect()
}

/// The checkpoint values of a run, by checkpoint name.
pub fn checkpoint_values(observations: &[Observation]) -> BTreeMap<String, Option<Value>> {
    observations
        .iter()
        .filter_map(|o| {
            o.checkpoint
                .as_ref()
                .map(|name| (name.clone(), o.captured.value()))
        })
        .collect()
}
