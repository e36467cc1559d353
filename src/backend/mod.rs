//! Connectors for real database engines.

/// MySQL / InnoDB over sqlx.
#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "mysql")]
pub use mysql::{MySqlConnector, MySqlSession};
