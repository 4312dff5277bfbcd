//! Storage seam: parameterized writes and the SQLite backend.
//!
//! The materializer emits [`SqlWrite`] values and never touches a connection
//! directly; [`StorageBackend`] is the only thing it needs. The SQLite
//! implementation renders `?N` placeholders and uses `RETURNING` to surface
//! storage-assigned ids.

use rusqlite::params_from_iter;
use rusqlite::types::Value as SqliteValue;
use rusqlite::Connection;
use std::error::Error;
use std::fmt;
use std::path::Path;

use crate::catalog::WriteOp;

/// A storage-bound scalar, already coerced by the materializer.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "null"),
            SqlValue::Integer(value) => write!(f, "{value}"),
            SqlValue::Real(value) => write!(f, "{value}"),
            SqlValue::Text(value) => write!(f, "{value}"),
            SqlValue::Bool(value) => write!(f, "{value}"),
        }
    }
}

/// One parameterized write: table, ordered columns, positional values, and an
/// optional column to return from the inserted row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlWrite {
    pub op: WriteOp,
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
    pub returning: Option<String>,
}

pub trait StorageBackend {
    /// Executes the write; returns the `RETURNING` value when one was asked for.
    fn execute(&mut self, write: &SqlWrite) -> Result<Option<SqlValue>, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Open { message: String },
    Execute { table: String, message: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Open { message } => write!(f, "open database failed: {message}"),
            StorageError::Execute { table, message } => {
                write!(f, "write to {table} failed: {message}")
            }
        }
    }
}

impl Error for StorageError {}

/// Renders the SQL for a write. `update` and `upsert` specs both become
/// `INSERT OR REPLACE`: write specs carry no key columns, so row identity is
/// left to the table's own primary key.
pub fn render_sql(write: &SqlWrite) -> String {
    let verb = match write.op {
        WriteOp::Insert => "INSERT",
        WriteOp::Update | WriteOp::Upsert => "INSERT OR REPLACE",
    };
    let placeholders: Vec<String> = (1..=write.values.len()).map(|n| format!("?{n}")).collect();
    let mut sql = format!(
        "{verb} INTO {} ({}) VALUES ({})",
        write.table,
        write.columns.join(", "),
        placeholders.join(", ")
    );
    if let Some(column) = &write.returning {
        sql.push_str(&format!(" RETURNING {column}"));
    }
    sql
}

pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(|err| StorageError::Open {
            message: err.to_string(),
        })?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(|err| StorageError::Open {
            message: err.to_string(),
        })?;
        Ok(Self { conn })
    }

    /// Wraps an existing connection, e.g. one that just ran schema setup.
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StorageBackend for SqliteBackend {
    fn execute(&mut self, write: &SqlWrite) -> Result<Option<SqlValue>, StorageError> {
        let sql = render_sql(write);
        let params = params_from_iter(write.values.iter().map(to_sqlite_value));
        let execute_err = |err: rusqlite::Error| StorageError::Execute {
            table: write.table.clone(),
            message: err.to_string(),
        };

        if write.returning.is_some() {
            let value: SqliteValue = self
                .conn
                .query_row(&sql, params, |row| row.get(0))
                .map_err(execute_err)?;
            Ok(Some(from_sqlite_value(value)))
        } else {
            self.conn.execute(&sql, params).map_err(execute_err)?;
            Ok(None)
        }
    }
}

fn to_sqlite_value(value: &SqlValue) -> SqliteValue {
    match value {
        SqlValue::Null => SqliteValue::Null,
        SqlValue::Integer(value) => SqliteValue::Integer(*value),
        SqlValue::Real(value) => SqliteValue::Real(*value),
        SqlValue::Text(value) => SqliteValue::Text(value.clone()),
        // SQLite has no boolean affinity; store 0/1.
        SqlValue::Bool(value) => SqliteValue::Integer(i64::from(*value)),
    }
}

fn from_sqlite_value(value: SqliteValue) -> SqlValue {
    match value {
        SqliteValue::Null => SqlValue::Null,
        SqliteValue::Integer(value) => SqlValue::Integer(value),
        SqliteValue::Real(value) => SqlValue::Real(value),
        SqliteValue::Text(value) => SqlValue::Text(value),
        SqliteValue::Blob(bytes) => SqlValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_schema() -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .connection()
            .execute_batch(
                "CREATE TABLE users (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     handle TEXT NOT NULL,
                     active INTEGER NOT NULL DEFAULT 1
                 );",
            )
            .unwrap();
        backend
    }

    #[test]
    fn renders_insert_with_numbered_placeholders() {
        let write = SqlWrite {
            op: WriteOp::Insert,
            table: "users".to_string(),
            columns: vec!["handle".to_string(), "active".to_string()],
            values: vec![SqlValue::Text("maya".to_string()), SqlValue::Bool(true)],
            returning: Some("id".to_string()),
        };
        assert_eq!(
            render_sql(&write),
            "INSERT INTO users (handle, active) VALUES (?1, ?2) RETURNING id"
        );
    }

    #[test]
    fn renders_update_and_upsert_as_insert_or_replace() {
        let write = SqlWrite {
            op: WriteOp::Upsert,
            table: "users".to_string(),
            columns: vec!["handle".to_string()],
            values: vec![SqlValue::Text("maya".to_string())],
            returning: None,
        };
        assert_eq!(
            render_sql(&write),
            "INSERT OR REPLACE INTO users (handle) VALUES (?1)"
        );
    }

    #[test]
    fn execute_returns_generated_id() {
        let mut backend = backend_with_schema();
        let write = SqlWrite {
            op: WriteOp::Insert,
            table: "users".to_string(),
            columns: vec!["handle".to_string(), "active".to_string()],
            values: vec![SqlValue::Text("maya".to_string()), SqlValue::Bool(false)],
            returning: Some("id".to_string()),
        };
        let returned = backend.execute(&write).unwrap();
        assert_eq!(returned, Some(SqlValue::Integer(1)));

        let active: i64 = backend
            .connection()
            .query_row("SELECT active FROM users WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(active, 0);
    }

    #[test]
    fn execute_without_returning_yields_none() {
        let mut backend = backend_with_schema();
        let write = SqlWrite {
            op: WriteOp::Insert,
            table: "users".to_string(),
            columns: vec!["handle".to_string()],
            values: vec![SqlValue::Text("ravi".to_string())],
            returning: None,
        };
        assert_eq!(backend.execute(&write).unwrap(), None);
    }

    #[test]
    fn execute_surfaces_sqlite_errors() {
        let mut backend = backend_with_schema();
        let write = SqlWrite {
            op: WriteOp::Insert,
            table: "missing_table".to_string(),
            columns: vec!["x".to_string()],
            values: vec![SqlValue::Null],
            returning: None,
        };
        let err = backend.execute(&write).unwrap_err();
        assert!(matches!(err, StorageError::Execute { ref table, .. } if table == "missing_table"));
    }
}
