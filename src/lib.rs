//! Scripted, barrier-synchronised interleavings of concurrent SQL sessions,
//! judged against the anomalies each ANSI isolation level permits or prevents.

pub mod errors;
pub mod isolation;
pub mod data_store;
pub mod scenario;
pub mod connector;
pub mod session;
pub mod scheduler;
pub mod assertion;
pub mod catalog;
pub mod config;
pub mod harness;
pub mod backend;

// Re-export key types and structs for easier access
pub use errors::{HarnessError, Result, ScenarioFailure};
pub use isolation::TransactionIsolation;
pub use data_store::observation_log::{Observation, ObservationLog};
pub use data_store::value::Value;
pub use connector::{Connection, Connector};
pub use session::{SessionHandle, TxnStatus};
pub use scenario::{Scenario, ScenarioBuilder};
pub use scheduler::{RunReport, Scheduler, SchedulerConfig};
pub use assertion::{AnomalyClass, Verdict, evaluate};
pub use catalog::{Fixture, ScenarioKind};
pub use config::HarnessConfig;
pub use harness::{Harness, prelude};
#[cfg(feature = "mysql")]
pub use backend::MySqlConnector;
