use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use serde::{Deserialize, Serialize};

use crate::assertion::expectations::AnomalyClass;
use crate::data_store::observation_log::{ErrorClass, ObservedError};
use crate::data_store::value::Value;
use crate::errors::{HarnessError, Result};
use crate::isolation::TransactionIsolation;

/// Name of a scenario participant, e.g. `T1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Name of a rendezvous point shared by two or more participants.
pub type BarrierId = String;

/// Position of a step inside its participant's script.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId {
    pub participant: ParticipantId,
    pub index: usize,
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.participant, self.index)
    }
}

/// What a step does to its participant's session.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Start a transaction at the scenario's isolation level.
    Begin,
    /// Run a statement; its rows become the session's cursor.
    Execute { sql: String, params: Vec<Value> },
    /// Pop the next row from the cursor and capture its first column.
    Fetch,
    Commit,
    Rollback,
    /// Rendezvous only. Never touches the session.
    Sync,
}

impl Action {
    pub fn execute(sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        Action::Execute {
            sql: sql.into(),
            params: params.into_iter().collect(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Begin => f.write_str("BEGIN"),
            Action::Execute { sql, params } if params.is_empty() => write!(f, "EXECUTE {}", sql),
            Action::Execute { sql, params } => {
                let rendered: Vec<String> = params.iter().map(ToString::to_string).collect();
                write!(f, "EXECUTE {} [{}]", sql, rendered.join(", "))
            }
            Action::Fetch => f.write_str("FETCH"),
            Action::Commit => f.write_str("COMMIT"),
            Action::Rollback => f.write_str("ROLLBACK"),
            Action::Sync => f.write_str("SYNC"),
        }
    }
}

/// Failure a step is allowed to end with.
///
/// Which sub-kind a conflicting writer actually gets is engine dependent, so
/// scenarios usually expect [`ExpectedFailure::Serialization`], which accepts
/// either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedFailure {
    /// Engine-reported lock wait timeout or deadlock.
    LockConflict,
    /// The harness' own statement timeout.
    Timeout,
    /// Either of the above.
    Serialization,
}

impl ExpectedFailure {
    pub fn accepts(&self, class: ErrorClass) -> bool {
        match self {
            ExpectedFailure::LockConflict => class == ErrorClass::LockConflict,
            ExpectedFailure::Timeout => class == ErrorClass::Timeout,
            ExpectedFailure::Serialization => {
                matches!(class, ErrorClass::LockConflict | ErrorClass::Timeout)
            }
        }
    }

    pub fn matches(&self, err: &HarnessError) -> bool {
        self.accepts(ObservedError::from(err).class)
    }
}

impl fmt::Display for ExpectedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedFailure::LockConflict => f.write_str("lock conflict"),
            ExpectedFailure::Timeout => f.write_str("timeout"),
            ExpectedFailure::Serialization => f.write_str("serialization failure"),
        }
    }
}

/// One scripted step of one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub participant: ParticipantId,
    pub action: Action,
    /// Rendezvous waited on before the action runs.
    pub barrier: Option<BarrierId>,
    /// Name under which the assertion engine can find this step's observation.
    pub checkpoint: Option<String>,
    /// Failure this step is allowed to end with.
    pub expect: Option<ExpectedFailure>,
}

/// A participant and its ordered steps.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub steps: Vec<Step>,
}

impl Participant {
    /// Barriers this participant crosses, in script order.
    pub fn barriers(&self) -> impl Iterator<Item = &BarrierId> {
        self.steps.iter().filter_map(|step| step.barrier.as_ref())
    }
}

/// How the assertion engine decides whether an anomaly happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// The anomaly happened if `checkpoint` captured `value`.
    ReadsValue { checkpoint: String, value: Value },
    /// The anomaly happened if the two checkpoints captured different values.
    Changes { first: String, second: String },
    /// The anomaly happened if `checkpoint` failed the way `failure` describes.
    Fails {
        checkpoint: String,
        failure: ExpectedFailure,
    },
}

impl Detection {
    fn checkpoints(&self) -> Vec<&str> {
        match self {
            Detection::ReadsValue { checkpoint, .. } | Detection::Fails { checkpoint, .. } => {
                vec![checkpoint.as_str()]
            }
            Detection::Changes { first, second } => vec![first.as_str(), second.as_str()],
        }
    }
}

/// An anomaly class a scenario is built to provoke, and how to recognise it.
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyProbe {
    pub class: AnomalyClass,
    pub detection: Detection,
}

impl AnomalyProbe {
    pub fn new(class: AnomalyClass, detection: Detection) -> Self {
        Self { class, detection }
    }
}

/// A literal value a checkpoint must capture, independent of the level table.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueExpectation {
    pub checkpoint: String,
    pub value: Value,
}

/// A statement run by the setup session before participants connect.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// An immutable, validated scenario: who does what, in which order relative to
/// which barriers, under which isolation level, and what should be observed.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    name: String,
    description: String,
    isolation: TransactionIsolation,
    setup: Vec<SetupStatement>,
    participants: Vec<Participant>,
    probes: Vec<AnomalyProbe>,
    expected_values: Vec<ValueExpectation>,
}

impl Scenario {
    /// Starts building a scenario.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use isoscope::prelude::*;
    ///
    /// let scenario = Scenario::builder("dirty-read", TransactionIsolation::ReadUncommitted)
    ///     .participant("T1", |t| {
    ///         t.begin()
    ///             .execute("UPDATE accounts SET balance = ? WHERE name = ?", [Value::from(9999), "Alice".into()])
    ///             .sync("written")
    ///             .sync("read")
    ///             .rollback()
    ///     })
    ///     .participant("T2", |t| {
    ///         t.sync("written")
    ///             .begin()
    ///             .execute("SELECT balance FROM accounts WHERE name = ?", [Value::from("Alice")])
    ///             .fetch_into("t2_read")
    ///             .sync("read")
    ///             .commit()
    ///     })
    ///     .probe(AnomalyProbe::new(
    ///         AnomalyClass::DirtyRead,
    ///         Detection::ReadsValue { checkpoint: "t2_read".into(), value: Value::from(9999) },
    ///     ))
    ///     .build()
    ///     .expect("valid scenario");
    /// assert_eq!(scenario.participants().len(), 2);
    /// ```
    pub fn builder(name: impl Into<String>, isolation: TransactionIsolation) -> ScenarioBuilder {
        ScenarioBuilder {
            name: name.into(),
            description: String::new(),
            isolation,
            setup: Vec::new(),
            participants: Vec::new(),
            probes: Vec::new(),
            expected_values: Vec::new(),
            misuse: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn isolation(&self) -> TransactionIsolation {
        self.isolation
    }

    pub fn setup(&self) -> &[SetupStatement] {
        &self.setup
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn probes(&self) -> &[AnomalyProbe] {
        &self.probes
    }

    pub fn expected_values(&self) -> &[ValueExpectation] {
        &self.expected_values
    }

    /// Looks a step up by id.
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.participants
            .iter()
            .find(|p| p.id == id.participant)
            .and_then(|p| p.steps.get(id.index))
    }

    /// All steps that carry a checkpoint, by checkpoint name.
    pub fn checkpoints(&self) -> BTreeMap<&str, StepId> {
        let mut map = BTreeMap::new();
        for participant in &self.participants {
            for (index, step) in participant.steps.iter().enumerate() {
                if let Some(name) = &step.checkpoint {
                    map.insert(
                        name.as_str(),
                        StepId {
                            participant: participant.id.clone(),
                            index,
                        },
                    );
                }
            }
        }
        map
    }

    /// Number of distinct participants referencing each barrier.
    pub fn barrier_parties(&self) -> BTreeMap<BarrierId, usize> {
        let mut parties = BTreeMap::new();
        for participant in &self.participants {
            for barrier in participant.barriers() {
                *parties.entry(barrier.clone()).or_insert(0) += 1;
            }
        }
        parties
    }

    /// The same script run under another isolation level. Anomaly
    /// expectations follow the level, since they are looked up at evaluation
    /// time; failure markers and value expectations are kept as written. See
    /// [`ScenarioKind::build_at`](crate::catalog::ScenarioKind::build_at) for
    /// the built-in scripts, which adjust their markers to the level.
    pub fn with_isolation(&self, isolation: TransactionIsolation) -> Scenario {
        Scenario {
            isolation,
            ..self.clone()
        }
    }

    /// Checks the structural rules every scenario must satisfy.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::State` describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.participants.is_empty() {
            return Err(self.invalid("has no participants"));
        }

        let mut ids = HashSet::new();
        let mut checkpoints = HashSet::new();
        for participant in &self.participants {
            if !ids.insert(&participant.id) {
                return Err(self.invalid(&format!("declares participant {} twice", participant.id)));
            }
            if participant.steps.is_empty() {
                return Err(self.invalid(&format!("participant {} has no steps", participant.id)));
            }
            let mut seen = HashSet::new();
            for step in &participant.steps {
                if step.participant != participant.id {
                    return Err(self.invalid(&format!(
                        "step of {} is filed under {}",
                        step.participant, participant.id
                    )));
                }
                if let Some(barrier) = &step.barrier {
                    if !seen.insert(barrier) {
                        return Err(self.invalid(&format!(
                            "participant {} waits on barrier '{}' more than once",
                            participant.id, barrier
                        )));
                    }
                }
                if let Some(name) = &step.checkpoint {
                    if !checkpoints.insert(name.as_str()) {
                        return Err(self.invalid(&format!("reuses checkpoint '{}'", name)));
                    }
                }
            }
        }

        for (barrier, parties) in self.barrier_parties() {
            if parties < 2 {
                return Err(self.invalid(&format!(
                    "barrier '{}' is referenced by a single participant",
                    barrier
                )));
            }
        }
        self.check_barrier_order()?;

        for probe in &self.probes {
            for checkpoint in probe.detection.checkpoints() {
                if !checkpoints.contains(checkpoint) {
                    return Err(self.invalid(&format!(
                        "probe for {} refers to unknown checkpoint '{}'",
                        probe.class, checkpoint
                    )));
                }
            }
        }
        for expectation in &self.expected_values {
            if !checkpoints.contains(expectation.checkpoint.as_str()) {
                return Err(self.invalid(&format!(
                    "expects a value at unknown checkpoint '{}'",
                    expectation.checkpoint
                )));
            }
        }
        Ok(())
    }

    /// Rejects scripts whose barriers cannot all be satisfied, i.e. where the
    /// "crossed before" relation between barriers has a cycle.
    fn check_barrier_order(&self) -> Result<()> {
        let mut successors: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for participant in &self.participants {
            let order: Vec<&str> = participant.barriers().map(String::as_str).collect();
            for barrier in &order {
                in_degree.entry(*barrier).or_insert(0);
            }
            for pair in order.windows(2) {
                if successors.entry(pair[0]).or_default().insert(pair[1]) {
                    *in_degree.entry(pair[1]).or_insert(0) += 1;
                }
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(barrier, _)| *barrier)
            .collect();
        let mut visited = 0;
        while let Some(barrier) = ready.pop() {
            visited += 1;
            if let Some(next) = successors.get(barrier) {
                for successor in next {
                    if let Some(degree) = in_degree.get_mut(successor) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(*successor);
                        }
                    }
                }
            }
        }

        if visited == in_degree.len() {
            Ok(())
        } else {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(barrier, _)| *barrier)
                .collect();
            Err(self.invalid(&format!(
                "orders barriers inconsistently across participants: {}",
                stuck.join(", ")
            )))
        }
    }

    fn invalid(&self, reason: &str) -> HarnessError {
        HarnessError::State(format!("scenario '{}' {}", self.name, reason))
    }
}

/// Builder for [`Scenario`]; validation happens in [`ScenarioBuilder::build`].
#[derive(Debug, Clone)]
pub struct ScenarioBuilder {
    name: String,
    description: String,
    isolation: TransactionIsolation,
    setup: Vec<SetupStatement>,
    participants: Vec<Participant>,
    probes: Vec<AnomalyProbe>,
    expected_values: Vec<ValueExpectation>,
    /// First script-writing mistake, reported by `build`.
    misuse: Option<String>,
}

impl ScenarioBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds a statement to run, committed, before any participant starts.
    pub fn setup(mut self, sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        self.setup.push(SetupStatement {
            sql: sql.into(),
            params: params.into_iter().collect(),
        });
        self
    }

    /// Adds a participant whose steps are written by `script`.
    pub fn participant(
        mut self,
        id: &str,
        script: impl FnOnce(ParticipantScript) -> ParticipantScript,
    ) -> Self {
        let id = ParticipantId::from(id);
        let script = script(ParticipantScript::new(id.clone()));
        if self.misuse.is_none() {
            self.misuse = script.misuse.clone();
        }
        self.participants.push(Participant {
            id,
            steps: script.finish(),
        });
        self
    }

    pub fn probe(mut self, probe: AnomalyProbe) -> Self {
        self.probes.push(probe);
        self
    }

    /// Requires `checkpoint` to capture `value`.
    pub fn expect_value(mut self, checkpoint: impl Into<String>, value: impl Into<Value>) -> Self {
        self.expected_values.push(ValueExpectation {
            checkpoint: checkpoint.into(),
            value: value.into(),
        });
        self
    }

    /// Validates and freezes the scenario.
    pub fn build(self) -> Result<Scenario> {
        if let Some(misuse) = self.misuse {
            return Err(HarnessError::State(format!(
                "scenario '{}' {}",
                self.name, misuse
            )));
        }
        let scenario = Scenario {
            name: self.name,
            description: self.description,
            isolation: self.isolation,
            setup: self.setup,
            participants: self.participants,
            probes: self.probes,
            expected_values: self.expected_values,
        };
        scenario.validate()?;
        Ok(scenario)
    }
}

/// Writes the steps of one participant.
///
/// `sync` marks a rendezvous that the *next* step waits on. Two rendezvous in a
/// row, or one at the end of the script, become standalone `Sync` steps.
#[derive(Debug, Clone)]
pub struct ParticipantScript {
    id: ParticipantId,
    steps: Vec<Step>,
    pending_barrier: Option<BarrierId>,
    misuse: Option<String>,
}

impl ParticipantScript {
    fn new(id: ParticipantId) -> Self {
        Self {
            id,
            steps: Vec::new(),
            pending_barrier: None,
            misuse: None,
        }
    }

    pub fn begin(self) -> Self {
        self.push(Action::Begin)
    }

    pub fn execute(self, sql: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        self.push(Action::execute(sql, params))
    }

    pub fn fetch(self) -> Self {
        self.push(Action::Fetch)
    }

    /// Fetches and names the observation `checkpoint`.
    pub fn fetch_into(self, checkpoint: impl Into<String>) -> Self {
        self.fetch().checkpoint(checkpoint)
    }

    pub fn commit(self) -> Self {
        self.push(Action::Commit)
    }

    pub fn rollback(self) -> Self {
        self.push(Action::Rollback)
    }

    /// Rendezvous with every other participant naming `barrier`.
    pub fn sync(mut self, barrier: impl Into<BarrierId>) -> Self {
        if let Some(pending) = self.pending_barrier.take() {
            self.push_step(Action::Sync, Some(pending));
        }
        self.pending_barrier = Some(barrier.into());
        self
    }

    /// Names the last step's observation.
    pub fn checkpoint(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if let Some(step) = self.last_step("checkpoint", &name) {
            step.checkpoint = Some(name);
        }
        self
    }

    /// Allows the last step to fail with `failure`.
    pub fn expect_failure(mut self, failure: ExpectedFailure) -> Self {
        if let Some(step) = self.last_step("expect_failure", &failure.to_string()) {
            step.expect = Some(failure);
        }
        self
    }

    /// [`expect_failure`](Self::expect_failure) when `applies` holds.
    pub fn expect_failure_if(self, applies: bool, failure: ExpectedFailure) -> Self {
        if applies {
            self.expect_failure(failure)
        } else {
            self
        }
    }

    /// The step a `checkpoint` or `expect_failure` call annotates. There is
    /// none before the first step, and none right after `sync`, where the
    /// step the barrier guards has not been written yet.
    fn last_step(&mut self, call: &str, argument: &str) -> Option<&mut Step> {
        let misplaced = match (&self.pending_barrier, self.steps.is_empty()) {
            (Some(barrier), _) => Some(format!("directly after sync '{}'", barrier)),
            (None, true) => Some("before any step".to_string()),
            (None, false) => None,
        };
        if let Some(place) = misplaced {
            if self.misuse.is_none() {
                self.misuse = Some(format!(
                    "participant {} calls {}({}) {}",
                    self.id, call, argument, place
                ));
            }
            return None;
        }
        self.steps.last_mut()
    }

    fn push(mut self, action: Action) -> Self {
        let barrier = self.pending_barrier.take();
        self.push_step(action, barrier);
        self
    }

    fn push_step(&mut self, action: Action, barrier: Option<BarrierId>) {
        self.steps.push(Step {
            participant: self.id.clone(),
            action,
            barrier,
            checkpoint: None,
            expect: None,
        });
    }

    fn finish(mut self) -> Vec<Step> {
        if let Some(pending) = self.pending_barrier.take() {
            self.push_step(Action::Sync, Some(pending));
        }
        self.steps
    }
}
