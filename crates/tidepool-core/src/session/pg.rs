//! PostgreSQL session adapter over `tokio_postgres`.

use async_trait::async_trait;
use bytes::BytesMut;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{IsNull, ToSql, Type};
use tokio_postgres::{Client, Row};
use tracing::trace;

use crate::error::DbError;

use super::{Session, SqlRow, SqlValue, TxnMode};

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Int(n) => {
                // Narrow to the column's width when the server asks for it.
                if *ty == Type::INT4 {
                    (*n as i32).to_sql(ty, out)
                } else if *ty == Type::INT2 {
                    (*n as i16).to_sql(ty, out)
                } else {
                    n.to_sql(ty, out)
                }
            }
            SqlValue::Float(f) => f.to_sql(ty, out),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Timestamp(t) => t.to_sql(ty, out),
            SqlValue::Inet(ip) => ip.to_sql(ty, out),
            SqlValue::Cidr(net) => net.to_sql(ty, out),
            SqlValue::TextArray(v) => v.to_sql(ty, out),
            SqlValue::IntArray(v) => v.to_sql(ty, out),
            SqlValue::BoolArray(v) => v.to_sql(ty, out),
            SqlValue::InetArray(v) => v.to_sql(ty, out),
            SqlValue::CidrArray(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Acceptance is value-dependent; the delegated `to_sql` rejects
        // genuinely incompatible combinations.
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

/// Classify a driver error into the store's taxonomy. Serialization
/// failures, deadlocks, cancelled queries, and lock/connection trouble are
/// transient; everything else is fatal for the request.
fn classify(e: tokio_postgres::Error) -> DbError {
    if e.is_closed() {
        return DbError::Connection(e.to_string());
    }
    match e.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => {
            DbError::UniqueViolation(e.to_string())
        }
        Some(code)
            if *code == SqlState::T_R_SERIALIZATION_FAILURE
                || *code == SqlState::T_R_DEADLOCK_DETECTED
                || *code == SqlState::QUERY_CANCELED
                || *code == SqlState::LOCK_NOT_AVAILABLE
                || *code == SqlState::ADMIN_SHUTDOWN
                || *code == SqlState::CRASH_SHUTDOWN
                || *code == SqlState::CANNOT_CONNECT_NOW =>
        {
            DbError::Transient(e.to_string())
        }
        Some(code) if code.code().starts_with("08") => DbError::Connection(e.to_string()),
        Some(_) => DbError::Query(e.to_string()),
        None => DbError::Internal(e.to_string()),
    }
}

/// Convert a driver row into the store's typed row model.
fn convert_row(row: &Row) -> Result<SqlRow, DbError> {
    let mut cols = Vec::with_capacity(row.len());

    for (i, col) in row.columns().iter().enumerate() {
        let name = col.name().to_string();
        let ty = col.type_().clone();

        let get_err =
            |e: tokio_postgres::Error| DbError::Internal(format!("column '{name}': {e}"));

        let value = if ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i).map_err(get_err)?.map(SqlValue::Int)
        } else if ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)
                .map_err(get_err)?
                .map(|v| SqlValue::Int(v as i64))
        } else if ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)
                .map_err(get_err)?
                .map(|v| SqlValue::Int(v as i64))
        } else if ty == Type::TEXT || ty == Type::VARCHAR || ty == Type::BPCHAR || ty == Type::NAME
        {
            row.try_get::<_, Option<String>>(i)
                .map_err(get_err)?
                .map(SqlValue::Text)
        } else if ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i).map_err(get_err)?.map(SqlValue::Bool)
        } else if ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i).map_err(get_err)?.map(SqlValue::Float)
        } else if ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)
                .map_err(get_err)?
                .map(|v| SqlValue::Float(v as f64))
        } else if ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)
                .map_err(get_err)?
                .map(SqlValue::Timestamp)
        } else if ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(i)
                .map_err(get_err)?
                .map(|t| SqlValue::Timestamp(t.and_utc()))
        } else if ty == Type::INET {
            row.try_get::<_, Option<cidr::IpInet>>(i)
                .map_err(get_err)?
                .map(SqlValue::Inet)
        } else if ty == Type::CIDR {
            row.try_get::<_, Option<cidr::IpCidr>>(i)
                .map_err(get_err)?
                .map(SqlValue::Cidr)
        } else if ty == Type::TEXT_ARRAY || ty == Type::VARCHAR_ARRAY {
            row.try_get::<_, Option<Vec<String>>>(i)
                .map_err(get_err)?
                .map(SqlValue::TextArray)
        } else if ty == Type::INT8_ARRAY {
            row.try_get::<_, Option<Vec<i64>>>(i)
                .map_err(get_err)?
                .map(SqlValue::IntArray)
        } else if ty == Type::INT4_ARRAY {
            row.try_get::<_, Option<Vec<i32>>>(i)
                .map_err(get_err)?
                .map(|v| SqlValue::IntArray(v.into_iter().map(i64::from).collect()))
        } else if ty == Type::BOOL_ARRAY {
            row.try_get::<_, Option<Vec<bool>>>(i)
                .map_err(get_err)?
                .map(SqlValue::BoolArray)
        } else if ty == Type::INET_ARRAY {
            row.try_get::<_, Option<Vec<cidr::IpInet>>>(i)
                .map_err(get_err)?
                .map(SqlValue::InetArray)
        } else if ty == Type::CIDR_ARRAY {
            row.try_get::<_, Option<Vec<cidr::IpCidr>>>(i)
                .map_err(get_err)?
                .map(SqlValue::CidrArray)
        } else {
            return Err(DbError::Internal(format!(
                "unsupported column type {ty} for '{name}'"
            )));
        };

        cols.push((name, value.unwrap_or(SqlValue::Null)));
    }

    Ok(SqlRow::new(cols))
}

fn render_args(args: &[SqlValue]) -> String {
    args.iter()
        .map(SqlValue::render_literal)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A [`Session`] backed by a dedicated `tokio_postgres` connection.
pub struct PgSession {
    client: Client,
}

impl PgSession {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin(&mut self, mode: TxnMode) -> Result<(), DbError> {
        let sql = match mode {
            TxnMode::ReadOnly => "BEGIN READ ONLY",
            TxnMode::ReadWrite => "BEGIN",
        };
        self.client.batch_execute(sql).await.map_err(classify)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.client.batch_execute("COMMIT").await.map_err(classify)
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.client.batch_execute("ROLLBACK").await.map_err(classify)
    }

    async fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        trace!(sql, args = %render_args(args), "session query");
        let params: Vec<&(dyn ToSql + Sync)> =
            args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();
        let rows = self.client.query(sql, &params).await.map_err(classify)?;
        rows.iter().map(convert_row).collect()
    }

    async fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        trace!(sql, args = %render_args(args), "session execute");
        let params: Vec<&(dyn ToSql + Sync)> =
            args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();
        self.client.execute(sql, &params).await.map_err(classify)
    }
}
