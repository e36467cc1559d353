use std::time::Duration;

use futures::TryStreamExt;
use log::{debug, trace};
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection as _, Either, Executor, MySql, Row as _, TypeInfo, ValueRef};
use tokio::runtime::Runtime;

use crate::config::HarnessConfig;
use crate::connector::{Connection, Connector};
use crate::data_store::row_set::{Row, RowSet};
use crate::data_store::value::Value;
use crate::errors::{HarnessError, Result};
use crate::isolation::TransactionIsolation;

/// Opens sqlx connections to a MySQL server.
#[derive(Debug, Clone)]
pub struct MySqlConnector {
    options: MySqlConnectOptions,
    /// `user@host:port/database`, without the password.
    target: String,
    lock_wait_timeout_secs: Option<u64>,
    lock_conflict_codes: Vec<u16>,
    connect_timeout: Duration,
}

impl MySqlConnector {
    pub fn from_config(config: &HarnessConfig) -> Self {
        let db = &config.database;
        let options = MySqlConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.user)
            .password(&db.password)
            .database(&db.database);
        Self {
            options,
            target: format!("{}@{}:{}/{}", db.user, db.host, db.port, db.database),
            lock_wait_timeout_secs: config.engine.lock_wait_timeout_secs,
            lock_conflict_codes: config.engine.lock_conflict_codes.clone(),
            connect_timeout: Duration::from_millis(config.timeouts.statement_ms),
        }
    }
}

impl Connector for MySqlConnector {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        // Each session drives its own connection from its own thread.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| HarnessError::Connection(format!("cannot start runtime: {}", e)))?;

        let connect = MySqlConnection::connect_with(&self.options);
        let timeout = self.connect_timeout;
        let mut connection = match runtime.block_on(async { tokio::time::timeout(timeout, connect).await }) {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(HarnessError::Connection(format!("{}: {}", self.target, e)));
            }
            Err(_) => {
                return Err(HarnessError::Timeout {
                    what: format!("connection to {}", self.target),
                    after: self.connect_timeout,
                });
            }
        };

        if let Some(secs) = self.lock_wait_timeout_secs {
            let directive = format!("SET SESSION innodb_lock_wait_timeout = {}", secs);
            runtime
                .block_on(connection.execute(directive.as_str()))
                .map_err(|e| HarnessError::Connection(format!("{}: {}", self.target, e)))?;
        }
        debug!("Connected to {}", self.target);

        Ok(Box::new(MySqlSession {
            runtime,
            connection: Some(connection),
            lock_conflict_codes: self.lock_conflict_codes.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("mysql://{}", self.target)
    }
}

/// One MySQL connection driven synchronously through a private runtime.
pub struct MySqlSession {
    runtime: Runtime,
    /// `None` once closed.
    connection: Option<MySqlConnection>,
    lock_conflict_codes: Vec<u16>,
}

impl MySqlSession {
    /// Runs a parameterless directive over the text protocol.
    fn directive(&mut self, sql: &str) -> Result<()> {
        trace!("{}", sql);
        let codes = self.lock_conflict_codes.clone();
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| HarnessError::Connection("connection already closed".to_string()))?;
        self.runtime
            .block_on(connection.execute(sql))
            .map(|_| ())
            .map_err(|e| classify(e, &codes))
    }
}

impl Connection for MySqlSession {
    fn begin(&mut self, level: TransactionIsolation) -> Result<()> {
        self.directive(&format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))?;
        self.directive("START TRANSACTION")
    }

    fn execute(&mut self, sql: &str, params: &[Value], timeout: Duration) -> Result<RowSet> {
        trace!("{} {:?}", sql, params);
        let codes = self.lock_conflict_codes.clone();
        let runtime = &self.runtime;
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| HarnessError::Connection("connection already closed".to_string()))?;

        let query = params.iter().fold(sqlx::query(sql), bind);
        let run = async move {
            let mut stream = query.fetch_many(connection);
            let mut columns = Vec::new();
            let mut rows = Vec::new();
            let mut rows_affected = 0;
            while let Some(item) = stream.try_next().await? {
                match item {
                    Either::Left(done) => rows_affected += done.rows_affected(),
                    Either::Right(row) => {
                        if columns.is_empty() {
                            columns = row.columns().iter().map(|c| c.name().to_string()).collect();
                        }
                        rows.push(decode_row(&row)?);
                    }
                }
            }
            Ok::<_, sqlx::Error>(RowSet {
                columns,
                rows,
                rows_affected,
            })
        };

        // The timer has to be created inside the runtime.
        match runtime.block_on(async { tokio::time::timeout(timeout, run).await }) {
            Ok(result) => result.map_err(|e| classify(e, &codes)),
            Err(_) => Err(HarnessError::Timeout {
                what: format!("statement '{}'", sql),
                after: timeout,
            }),
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.directive("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.directive("ROLLBACK")
    }

    fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(connection) => self
                .runtime
                .block_on(connection.close())
                .map_err(|e| HarnessError::Connection(e.to_string())),
            None => Ok(()),
        }
    }
}

fn bind<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &Value,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Decimal(s) | Value::Text(s) => query.bind(s.clone()),
    }
}

fn decode_row(row: &MySqlRow) -> std::result::Result<Row, sqlx::Error> {
    let mut values = Vec::with_capacity(row.len());
    for (index, column) in row.columns().iter().enumerate() {
        if row.try_get_raw(index)?.is_null() {
            values.push(Value::Null);
            continue;
        }
        let value = match column.type_info().name() {
            "DECIMAL" => Value::Decimal(row.try_get_unchecked::<String, _>(index)?),
            "FLOAT" => Value::Float(f64::from(row.try_get_unchecked::<f32, _>(index)?)),
            "DOUBLE" => Value::Float(row.try_get_unchecked::<f64, _>(index)?),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
                Value::Int(row.try_get_unchecked::<i64, _>(index)?)
            }
            name if name.ends_with(" UNSIGNED") => {
                let unsigned = row.try_get_unchecked::<u64, _>(index)?;
                i64::try_from(unsigned).map_or_else(|_| Value::Decimal(unsigned.to_string()), Value::Int)
            }
            _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
        };
        values.push(value);
    }
    Ok(values)
}

/// Maps a driver error onto the harness taxonomy. Engine error numbers listed in
/// `lock_conflict_codes` become lock conflicts.
fn classify(err: sqlx::Error, lock_conflict_codes: &[u16]) -> HarnessError {
    match &err {
        sqlx::Error::Database(db) => {
            let number = db.try_downcast_ref::<MySqlDatabaseError>().map(|e| e.number());
            match number {
                Some(code) if lock_conflict_codes.contains(&code) => {
                    HarnessError::lock_conflict(format!("[{}] {}", code, db.message()))
                }
                Some(code) => HarnessError::query(format!("[{}] {}", code, db.message())),
                None => HarnessError::query(db.message().to_string()),
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            HarnessError::Connection(err.to_string())
        }
        _ => HarnessError::query(err.to_string()),
    }
}
