use std::fmt;
use std::path::Path;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::catalog::Fixture;
use crate::errors::{HarnessError, Result};
use crate::scenario::ExpectedFailure;
use crate::scheduler::SchedulerConfig;

/// Prefix of the environment variables that override `[database]`.
pub const ENV_PREFIX: &str = "ISOSCOPE_";

/// Where the target database lives and how to log in.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: "isoscope".to_string(),
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Deadlines, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub barrier_ms: u64,
    pub statement_ms: u64,
    pub scenario_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            barrier_ms: defaults.barrier_timeout.as_millis() as u64,
            statement_ms: defaults.statement_timeout.as_millis() as u64,
            scenario_ms: defaults.scenario_timeout.as_millis() as u64,
        }
    }
}

impl From<TimeoutConfig> for SchedulerConfig {
    fn from(timeouts: TimeoutConfig) -> Self {
        SchedulerConfig {
            barrier_timeout: Duration::from_millis(timeouts.barrier_ms),
            statement_timeout: Duration::from_millis(timeouts.statement_ms),
            scenario_timeout: Duration::from_millis(timeouts.scenario_ms),
        }
    }
}

/// The rows the built-in scenarios work on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureConfig {
    pub subject: String,
    pub initial_balance: i64,
    pub phantom: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        let fixture = Fixture::default();
        Self {
            subject: fixture.subject,
            initial_balance: fixture.initial_balance,
            phantom: fixture.phantom,
        }
    }
}

impl From<&FixtureConfig> for Fixture {
    fn from(config: &FixtureConfig) -> Self {
        Fixture {
            subject: config.subject.clone(),
            initial_balance: config.initial_balance,
            phantom: config.phantom.clone(),
        }
    }
}

/// Engine specific behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session lock wait timeout set on every connection, in seconds. Keeps a
    /// blocked writer from waiting out the server default.
    pub lock_wait_timeout_secs: Option<u64>,
    /// Engine error numbers reported as lock conflicts.
    pub lock_conflict_codes: Vec<u16>,
    /// How the blocked writer of the serializable demo may fail.
    pub serialization_failure: ExpectedFailure,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_secs: Some(2),
            // ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK
            lock_conflict_codes: vec![1205, 1213],
            serialization_failure: ExpectedFailure::Serialization,
        }
    }
}

/// Complete harness configuration.
///
/// Every section is optional in the file; missing fields take their defaults.
///
/// ```toml
/// [database]
/// host = "127.0.0.1"
/// user = "demo"
/// password = "secret"
/// database = "bank"
///
/// [timeouts]
/// statement_ms = 5000
///
/// [engine]
/// serialization_failure = "lock_conflict"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub database: DatabaseConfig,
    pub timeouts: TimeoutConfig,
    pub fixture: FixtureConfig,
    pub engine: EngineConfig,
}

impl HarnessConfig {
    /// Loads the configuration from `path` (defaults if `None`), applies the
    /// `ISOSCOPE_*` environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Overrides connection settings from `ISOSCOPE_HOST`, `ISOSCOPE_PORT`,
    /// `ISOSCOPE_USER`, `ISOSCOPE_PASSWORD` and `ISOSCOPE_DATABASE`, looked up
    /// through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        if let Some(host) = var("HOST") {
            self.database.host = host;
        }
        if let Some(port) = var("PORT") {
            self.database.port = port.trim().parse().map_err(|_| {
                HarnessError::Config(format!("{}PORT is not a port number: {}", ENV_PREFIX, port))
            })?;
        }
        if let Some(user) = var("USER") {
            self.database.user = user;
        }
        if let Some(password) = var("PASSWORD") {
            self.database.password = password;
        }
        if let Some(database) = var("DATABASE") {
            self.database.database = database;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.timeouts;
        if t.barrier_ms == 0 || t.statement_ms == 0 || t.scenario_ms == 0 {
            return Err(HarnessError::Config("timeouts must be non-zero".to_string()));
        }
        if t.barrier_ms > t.scenario_ms {
            return Err(HarnessError::Config(format!(
                "barrier timeout ({} ms) exceeds scenario timeout ({} ms)",
                t.barrier_ms, t.scenario_ms
            )));
        }
        // A peer blocked in a statement must be able to reach the barrier.
        if t.barrier_ms < t.statement_ms {
            return Err(HarnessError::Config(format!(
                "barrier timeout ({} ms) is shorter than statement timeout ({} ms)",
                t.barrier_ms, t.statement_ms
            )));
        }
        if self.fixture.subject.trim().is_empty() {
            return Err(HarnessError::Config("fixture subject is empty".to_string()));
        }
        if self.fixture.subject == self.fixture.phantom {
            return Err(HarnessError::Config(
                "fixture subject and phantom must differ".to_string(),
            ));
        }
        if self.database.host.trim().is_empty() {
            return Err(HarnessError::Config("database host is empty".to_string()));
        }
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.timeouts.into()
    }

    pub fn fixture(&self) -> Fixture {
        Fixture::from(&self.fixture)
    }
}
