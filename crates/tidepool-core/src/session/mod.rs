//! The database session seam.
//!
//! Every request owns one [`Session`] for its lifetime. The trait is the
//! boundary between the store's SQL-producing core and the PostgreSQL
//! driver; [`mem::ScriptedSession`] stands in for the database in tests and
//! [`pg::PgSession`] adapts a live `tokio_postgres` connection.

pub mod mem;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cidr::{IpCidr, IpInet};

use crate::coerce::escape_array_element;
use crate::error::DbError;

/// Transaction mode for a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    /// Read-only transaction; always rolled back at pipeline end to release
    /// locks early.
    ReadOnly,
    /// Read-write transaction; committed on pipeline success.
    ReadWrite,
}

/// A typed SQL parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Inet(IpInet),
    Cidr(IpCidr),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    BoolArray(Vec<bool>),
    InetArray(Vec<IpInet>),
    CidrArray(Vec<IpCidr>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Render this value as a SQL literal for trace output.
    ///
    /// Array elements containing any of `" , { } \` are wrapped in double
    /// quotes with each such character backslash-escaped, matching the
    /// PostgreSQL array input syntax.
    pub fn render_literal(&self) -> String {
        fn quoted(s: &str) -> String {
            format!("'{}'", s.replace('\'', "''"))
        }
        fn array_literal<T, F: Fn(&T) -> String>(elems: &[T], f: F) -> String {
            let inner: Vec<String> = elems.iter().map(f).collect();
            format!("'{{{}}}'", inner.join(","))
        }

        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Text(s) => quoted(s),
            SqlValue::Int(n) => n.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::Timestamp(t) => quoted(&t.to_rfc3339()),
            SqlValue::Inet(ip) => quoted(&ip.to_string()),
            SqlValue::Cidr(net) => quoted(&net.to_string()),
            SqlValue::TextArray(elems) => {
                array_literal(elems, |s| escape_array_element(s))
            }
            SqlValue::IntArray(elems) => array_literal(elems, |n| n.to_string()),
            SqlValue::BoolArray(elems) => array_literal(elems, |b| b.to_string()),
            SqlValue::InetArray(elems) => {
                array_literal(elems, |ip| escape_array_element(&ip.to_string()))
            }
            SqlValue::CidrArray(elems) => {
                array_literal(elems, |net| escape_array_element(&net.to_string()))
            }
        }
    }
}

/// A row returned from a query, as an ordered list of named column values.
#[derive(Debug, Clone, Default)]
pub struct SqlRow {
    cols: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new(cols: Vec<(String, SqlValue)>) -> Self {
        Self { cols }
    }

    /// Look up a column by name. Returns `None` when the column is absent
    /// from the row (distinct from a present-but-NULL column).
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.cols
            .iter()
            .find(|(col, _)| col == name)
            .map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.cols.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Required text column.
    pub fn text(&self, name: &str) -> Result<&str, DbError> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Ok(s),
            other => Err(DbError::Internal(format!(
                "expected text column '{name}', got {other:?}"
            ))),
        }
    }

    /// Required bigint column.
    pub fn int(&self, name: &str) -> Result<i64, DbError> {
        match self.get(name) {
            Some(SqlValue::Int(n)) => Ok(*n),
            other => Err(DbError::Internal(format!(
                "expected bigint column '{name}', got {other:?}"
            ))),
        }
    }

    /// Optional bigint column: absent or NULL maps to `None`.
    pub fn opt_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(SqlValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Optional text column: absent or NULL maps to `None`.
    pub fn opt_text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(SqlValue::Text(s)) => Some(s),
            _ => None,
        }
    }
}

/// Hands out database sessions. Pool sizing and connection management live
/// behind this seam.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Session>, DbError>;
}

/// A single database session with explicit transaction control.
///
/// A request owns its session exclusively for its lifetime; sessions are
/// never shared across concurrent requests.
#[async_trait]
pub trait Session: Send {
    /// Begin a transaction in the given mode.
    async fn begin(&mut self, mode: TxnMode) -> Result<(), DbError>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), DbError>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Run a query and collect its rows.
    async fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    /// Run a statement and return the affected-row count.
    async fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError>;
}
