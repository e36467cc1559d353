use std::sync::Arc;

use log::info;

use crate::assertion::{Verdict, evaluate};
use crate::catalog::{Fixture, ScenarioKind};
use crate::connector::Connector;
use crate::data_store::observation_log::ObservationLog;
use crate::errors::Result;
use crate::isolation::TransactionIsolation;
use crate::scenario::{ExpectedFailure, Scenario};
use crate::scheduler::{RunReport, Scheduler, SchedulerConfig};

/// Isoscope Prelude
pub mod prelude {
    pub use crate::assertion::*;
    pub use crate::catalog::*;
    pub use crate::connector::*;
    pub use crate::data_store::observation_log::*;
    pub use crate::data_store::row_set::*;
    pub use crate::data_store::value::*;
    pub use crate::errors::*;
    pub use crate::scenario::*;
    pub use crate::scheduler::*;
    pub use crate::session::*;
    pub use crate::*;
}

/// The main entry point: runs scenarios against one database and judges them.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use isoscope::prelude::*;
///
/// fn check(connector: Arc<dyn Connector>) -> Result<bool> {
///     let harness = Harness::new(connector, SchedulerConfig::default());
///     let scenario = ScenarioKind::DirtyRead.build(&Fixture::default(), ExpectedFailure::Serialization)?;
///     let verdict = harness.run(&scenario)?;
///     println!("{}", verdict);
///     Ok(verdict.passed())
/// }
/// ```
pub struct Harness {
    /// Source of the sessions every run opens.
    connector: Arc<dyn Connector>,
    /// Deadlines applied to every run.
    config: SchedulerConfig,
    /// Rows the built-in scenarios work on.
    fixture: Fixture,
    /// How the serializable demo's blocked writer may fail.
    serialization_failure: ExpectedFailure,
}

impl Harness {
    pub fn new(connector: Arc<dyn Connector>, config: SchedulerConfig) -> Self {
        Self {
            connector,
            config,
            fixture: Fixture::default(),
            serialization_failure: ExpectedFailure::Serialization,
        }
    }

    pub fn with_fixture(mut self, fixture: Fixture) -> Self {
        self.fixture = fixture;
        self
    }

    pub fn with_serialization_failure(mut self, failure: ExpectedFailure) -> Self {
        self.serialization_failure = failure;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    /// Builds a built-in scenario, optionally forcing another isolation level
    /// than the one it was designed for.
    pub fn scenario(
        &self,
        kind: ScenarioKind,
        isolation: Option<TransactionIsolation>,
    ) -> Result<Scenario> {
        kind.build_at(
            &self.fixture,
            self.serialization_failure,
            isolation.unwrap_or_else(|| kind.isolation()),
        )
    }

    /// Runs `scenario` and evaluates it.
    ///
    /// # Errors
    ///
    /// Fails only when the run itself could not complete; see
    /// [`Scheduler::run`]. A run that completes but shows the wrong anomalies
    /// is an `Ok` verdict that did not pass.
    pub fn run(&self, scenario: &Scenario) -> Result<Verdict> {
        let log = ObservationLog::new();
        self.run_with_log(scenario, &log).map(|(_, verdict)| verdict)
    }

    /// Runs `scenario` recording into `log`, which may carry a listener for
    /// live output.
    pub fn run_with_log(
        &self,
        scenario: &Scenario,
        log: &ObservationLog,
    ) -> Result<(RunReport, Verdict)> {
        let scheduler = Scheduler::new(Arc::clone(&self.connector), self.config);
        let report = scheduler.run(scenario, log)?;
        let verdict = evaluate(scenario, &report.observations);
        info!(
            "Scenario '{}' at {}: {}",
            scenario.name(),
            scenario.isolation(),
            if verdict.passed() { "pass" } else { "fail" }
        );
        Ok((report, verdict))
    }
}
