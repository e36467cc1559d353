use crate::data_store::value::Value;

/// One result row, columns in select-list order.
pub type Row = Vec<Value>;

/// The materialised result of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column names reported by the engine; empty for DML.
    pub columns: Vec<String>,
    /// Returned rows.
    pub rows: Vec<Row>,
    /// Rows changed by an `INSERT` / `UPDATE` / `DELETE`.
    pub rows_affected: u64,
}

impl RowSet {
    /// A result carrying rows from a query.
    pub fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: 0,
        }
    }

    /// A result of a DML statement.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    /// First column of the first row, if any.
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
