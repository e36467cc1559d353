//! Drives the participants of a scenario through their scripts.
//!
//! Each participant gets its own thread and its own [`SessionHandle`]. Steps of
//! one participant run strictly in order; steps of different participants are
//! ordered only by the barriers they share. Every completed step is appended to
//! the [`ObservationLog`] after it finishes and before the participant moves on,
//! so the log order always respects the declared barriers.

/// Rendezvous barriers with timeout and cancellation.
pub mod barrier;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::connector::Connector;
use crate::data_store::observation_log::{Captured, Observation, ObservationLog};
use crate::errors::{HarnessError, Result, ScenarioFailure};
use crate::isolation::TransactionIsolation;
use crate::scenario::{Action, Participant, ParticipantId, Scenario, Step, StepId};
use crate::session::{SessionHandle, TxnStatus};

pub use barrier::{BarrierSet, RendezvousBarrier};

/// Deadlines applied while a scenario runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long a participant waits at a barrier for its peers.
    pub barrier_timeout: Duration,
    /// How long a single statement may run.
    pub statement_timeout: Duration,
    /// How long the whole scenario may run, setup excluded.
    pub scenario_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            barrier_timeout: Duration::from_secs(15),
            statement_timeout: Duration::from_secs(10),
            scenario_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of a scenario that ran to completion.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub scenario: String,
    pub isolation: TransactionIsolation,
    /// The full observation log, in append order.
    pub observations: Vec<Observation>,
    /// Terminal transaction status of every participant's session.
    pub final_states: BTreeMap<ParticipantId, TxnStatus>,
}

/// Runs scenarios against a [`Connector`].
pub struct Scheduler {
    connector: Arc<dyn Connector>,
    config: SchedulerConfig,
}

/// State shared by the participant threads of one run.
struct RunContext<'a> {
    scenario: &'a Scenario,
    barriers: BarrierSet,
    log: &'a ObservationLog,
    config: SchedulerConfig,
    aborted: AtomicBool,
    /// First non-cancellation failure; later ones are consequences of it.
    primary: Mutex<Option<(Option<StepId>, HarnessError)>>,
}

impl RunContext<'_> {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Records `err` as the cause if it is the first real failure, and stops
    /// every participant.
    fn fail(&self, step: Option<StepId>, err: HarnessError) {
        {
            let mut primary = self.primary.lock();
            if primary.is_none() && !err.is_cancelled() {
                *primary = Some((step, err));
            }
        }
        if !self.aborted.swap(true, Ordering::SeqCst) {
            debug!("Scenario '{}' aborting", self.scenario.name());
        }
        self.barriers.cancel_all();
    }
}

impl Scheduler {
    pub fn new(connector: Arc<dyn Connector>, config: SchedulerConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs `scenario`, appending every step outcome to `log`.
    ///
    /// Sessions are always torn down before this returns: every participant's
    /// transaction ends committed or rolled back whatever happened.
    ///
    /// # Errors
    ///
    /// * `HarnessError::State` if the scenario is malformed.
    /// * `HarnessError::Scenario` if setup, connecting, a barrier, a statement,
    ///   or the scenario deadline failed in a way the scenario did not expect.
    ///   The failure carries the partial observation log.
    pub fn run(&self, scenario: &Scenario, log: &ObservationLog) -> Result<RunReport> {
        scenario.validate()?;
        info!(
            "Running scenario '{}' at {} against {}",
            scenario.name(),
            scenario.isolation(),
            self.connector.describe()
        );

        if let Err(err) = self.run_setup(scenario) {
            return Err(Self::aborted(scenario, None, err, log));
        }

        let mut sessions = Vec::with_capacity(scenario.participants().len());
        for participant in scenario.participants() {
            match SessionHandle::open(
                self.connector.as_ref(),
                participant.id.clone(),
                self.config.statement_timeout,
            ) {
                Ok(session) => sessions.push(session),
                // Already opened sessions are torn down by drop.
                Err(err) => return Err(Self::aborted(scenario, None, err, log)),
            }
        }

        let context = RunContext {
            scenario,
            barriers: BarrierSet::new(scenario.barrier_parties()),
            log,
            config: self.config,
            aborted: AtomicBool::new(false),
            primary: Mutex::new(None),
        };
        let deadline = Instant::now() + self.config.scenario_timeout;
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<ParticipantId>();

        let final_states = thread::scope(|scope| {
            let context = &context;
            let handles: Vec<_> = scenario
                .participants()
                .iter()
                .zip(sessions)
                .map(|(participant, session)| {
                    let done = done_tx.clone();
                    let handle = scope.spawn(move || {
                        let status = run_participant(context, participant, session);
                        if done.send(participant.id.clone()).is_err() {
                            debug!("Scheduler stopped listening before {} finished", participant.id);
                        }
                        status
                    });
                    (participant.id.clone(), handle)
                })
                .collect();
            drop(done_tx);

            let mut finished = 0;
            while finished < handles.len() {
                match done_rx.recv_deadline(deadline) {
                    Ok(id) => {
                        finished += 1;
                        debug!("Participant {} finished", id);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        warn!(
                            "Scenario '{}' exceeded {:?}; cancelling participants",
                            scenario.name(),
                            self.config.scenario_timeout
                        );
                        context.fail(
                            None,
                            HarnessError::Timeout {
                                what: format!("scenario '{}'", scenario.name()),
                                after: self.config.scenario_timeout,
                            },
                        );
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            // Blocked participants notice the abort at their next barrier or
            // once their current statement returns or times out.
            handles
                .into_iter()
                .map(|(id, handle)| {
                    let status = handle.join().unwrap_or_else(|_| {
                        context.fail(
                            None,
                            HarnessError::State(format!("participant {} panicked", id)),
                        );
                        TxnStatus::RolledBack
                    });
                    (id, status)
                })
                .collect::<BTreeMap<_, _>>()
        });

        if let Some((step, cause)) = context.primary.into_inner() {
            return Err(Self::aborted(scenario, step, cause, log));
        }

        info!("Scenario '{}' completed", scenario.name());
        Ok(RunReport {
            scenario: scenario.name().to_string(),
            isolation: scenario.isolation(),
            observations: log.snapshot(),
            final_states,
        })
    }

    /// Runs the scenario's setup statements in their own committed transaction.
    fn run_setup(&self, scenario: &Scenario) -> Result<()> {
        if scenario.setup().is_empty() {
            return Ok(());
        }
        debug!(
            "Running {} setup statement(s) for '{}'",
            scenario.setup().len(),
            scenario.name()
        );
        let mut session = SessionHandle::open(
            self.connector.as_ref(),
            ParticipantId::from("setup"),
            self.config.statement_timeout,
        )?;
        session.begin(TransactionIsolation::ReadCommitted)?;
        for statement in scenario.setup() {
            session.execute(&statement.sql, &statement.params)?;
        }
        session.commit()?;
        session.close()
    }

    fn aborted(
        scenario: &Scenario,
        step: Option<StepId>,
        cause: HarnessError,
        log: &ObservationLog,
    ) -> HarnessError {
        match &step {
            Some(step) => warn!("Scenario '{}' aborted at {}: {}", scenario.name(), step, cause),
            None => warn!("Scenario '{}' aborted: {}", scenario.name(), cause),
        }
        HarnessError::Scenario(Box::new(ScenarioFailure {
            scenario: scenario.name().to_string(),
            step,
            cause,
            observations: log.snapshot(),
        }))
    }
}

/// Executes one participant's script and tears its session down.
///
/// Returns the session's terminal status.
fn run_participant(
    context: &RunContext<'_>,
    participant: &Participant,
    mut session: SessionHandle,
) -> TxnStatus {
    let isolation = context.scenario.isolation();
    // Set once a step failed as expected; the engine rolled the transaction
    // back, so its remaining statements have nothing to run in.
    let mut refused = false;
    for (index, step) in participant.steps.iter().enumerate() {
        let step_id = StepId {
            participant: participant.id.clone(),
            index,
        };
        if context.is_aborted() {
            debug!("{} stops before step {}: scenario aborted", participant.id, index);
            break;
        }
        let label = describe(step, isolation);

        if let Some(barrier_id) = &step.barrier {
            let waited = context
                .barriers
                .get(barrier_id)
                .and_then(|barrier| barrier.wait(context.config.barrier_timeout));
            if let Err(err) = waited {
                context.log.append(
                    step_id.clone(),
                    label,
                    step.checkpoint.clone(),
                    Captured::Failed((&err).into()),
                );
                // Release locks before peers are woken up by the abort.
                rollback_quietly(&mut session);
                context.fail(Some(step_id), err);
                break;
            }
        }

        if refused && matches!(step.action, Action::Execute { .. } | Action::Fetch) {
            debug!("{} skipped: transaction already refused", step_id);
            context
                .log
                .append(step_id, label, step.checkpoint.clone(), Captured::Skipped);
            continue;
        }

        match perform(&mut session, step, isolation) {
            Ok(captured) => {
                context
                    .log
                    .append(step_id, label, step.checkpoint.clone(), captured);
            }
            Err(err) => {
                context.log.append(
                    step_id.clone(),
                    label,
                    step.checkpoint.clone(),
                    Captured::Failed((&err).into()),
                );
                if step.expect.is_some_and(|expected| expected.matches(&err)) {
                    debug!("{} failed as expected: {}", step_id, err);
                    rollback_quietly(&mut session);
                    refused = true;
                    continue;
                }
                rollback_quietly(&mut session);
                context.fail(Some(step_id), err);
                break;
            }
        }
    }

    if session.status() == TxnStatus::Active && !context.is_aborted() {
        warn!(
            "{} ended its script with an open transaction; rolling back",
            participant.id
        );
    }
    rollback_quietly(&mut session);
    let status = session.status();
    if let Err(e) = session.close() {
        warn!("Closing session {} failed: {}", participant.id, e);
    }
    status
}

fn perform(
    session: &mut SessionHandle,
    step: &Step,
    isolation: TransactionIsolation,
) -> Result<Captured> {
    match &step.action {
        Action::Begin => session.begin(isolation).map(|_| Captured::Completed),
        Action::Execute { sql, params } => {
            session
                .execute(sql, params)
                .map(|rows| Captured::Executed {
                    rows: rows.rows.len(),
                    rows_affected: rows.rows_affected,
                })
        }
        Action::Fetch => session
            .fetch()
            .map(|row| Captured::Fetched(row.and_then(|r| r.into_iter().next()))),
        Action::Commit => session.commit().map(|_| Captured::Completed),
        Action::Rollback => session.rollback().map(|_| Captured::Completed),
        Action::Sync => Ok(Captured::Completed),
    }
}

fn rollback_quietly(session: &mut SessionHandle) {
    if let Err(e) = session.rollback() {
        warn!("Rollback of {} failed: {}", session.participant(), e);
    }
}

/// Rendering of a step used in the log and on screen.
fn describe(step: &Step, isolation: TransactionIsolation) -> String {
    let action = match &step.action {
        Action::Begin => format!("BEGIN {}", isolation),
        other => other.to_string(),
    };
    match (&step.action, &step.barrier) {
        (Action::Sync, Some(barrier)) => format!("SYNC {}", barrier),
        (_, Some(barrier)) => format!("{} (after {})", action, barrier),
        (_, None) => action,
    }
}
