use crate::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A statement to run on a live connection.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// The SQL statement to execute.
    pub sql: String,

    /// Database the statement expects to run in.
    ///
    /// Drivers that track a current database re-select it before executing
    /// when it differs.
    pub database: Option<String>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn with_database(mut self, database: Option<String>) -> Self {
        self.database = database;
        self
    }
}

/// A single row of query results.
pub type Row = Vec<Value>;

/// Metadata for a result column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name as returned by the database.
    pub name: String,

    /// Database-specific type name (e.g., "varchar", "int4", "TEXT").
    pub type_name: String,

    /// Whether the column allows NULL values.
    pub nullable: bool,
}

/// Result of executing a SQL statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,

    /// Row data, where each row contains values matching `columns` order.
    pub rows: Vec<Row>,

    /// Number of rows affected by INSERT/UPDATE/DELETE statements.
    /// `None` for SELECT queries.
    pub affected_rows: Option<u64>,

    pub execution_time: Duration,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: None,
            execution_time: Duration::ZERO,
        }
    }

    /// Single-column result built from plain strings.
    pub fn from_names(column: &str, names: &[&str]) -> Self {
        Self {
            columns: vec![ColumnMeta {
                name: column.to_string(),
                type_name: "TEXT".to_string(),
                nullable: false,
            }],
            rows: names
                .iter()
                .map(|name| vec![Value::Text(name.to_string())])
                .collect(),
            affected_rows: None,
            execution_time: Duration::ZERO,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Display strings of one column, skipping NULLs and short rows.
    pub fn column_strings(&self, index: usize) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.get(index))
            .filter(|value| !value.is_null())
            .map(Value::as_display_string)
            .collect()
    }
}
