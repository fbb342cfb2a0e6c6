//! Scripted in-memory session, standing in for PostgreSQL in tests.
//!
//! A script is an ordered list of expected statements with canned results.
//! Each `query`/`execute` call consumes the next step after checking that
//! the SQL contains the expected fragment; any deviation panics with the
//! offending statement, which surfaces directly as a test failure. The
//! statement log is shared, so a test can keep a handle and inspect the
//! issued SQL after the session has been moved into a request.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::DbError;

use super::{Session, SessionPool, SqlRow, SqlValue, TxnMode};

/// Shared record of every statement a scripted session has issued,
/// including transaction control.
pub type StatementLog = Arc<Mutex<Vec<(String, Vec<SqlValue>)>>>;

#[derive(Debug)]
struct Step {
    fragment: String,
    rows: Vec<SqlRow>,
    affected: u64,
    error: Option<DbError>,
}

/// A session that replays a fixed script of statement expectations.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    script: VecDeque<Step>,
    log: StatementLog,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect a query whose SQL contains `fragment`; respond with `rows`.
    pub fn expect(mut self, fragment: &str, rows: Vec<SqlRow>) -> Self {
        self.script.push_back(Step {
            fragment: fragment.to_string(),
            rows,
            affected: 0,
            error: None,
        });
        self
    }

    /// Expect a statement whose SQL contains `fragment`; respond with an
    /// affected-row count.
    pub fn expect_exec(mut self, fragment: &str, affected: u64) -> Self {
        self.script.push_back(Step {
            fragment: fragment.to_string(),
            rows: Vec::new(),
            affected,
            error: None,
        });
        self
    }

    /// Expect a statement whose SQL contains `fragment`; respond with an
    /// error.
    pub fn expect_fail(mut self, fragment: &str, error: DbError) -> Self {
        self.script.push_back(Step {
            fragment: fragment.to_string(),
            rows: Vec::new(),
            affected: 0,
            error: Some(error),
        });
        self
    }

    /// A handle onto the statement log, usable after the session has been
    /// consumed by a request.
    pub fn log_handle(&self) -> StatementLog {
        Arc::clone(&self.log)
    }

    fn next_step(&mut self, sql: &str) -> Step {
        let step = self
            .script
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected statement (script exhausted): {sql}"));
        assert!(
            sql.contains(&step.fragment),
            "statement mismatch:\n  expected fragment: {}\n  got: {sql}",
            step.fragment
        );
        step
    }

    /// Panic if any scripted step was never reached.
    pub fn verify_drained(&self) {
        assert!(
            self.script.is_empty(),
            "script not drained; next expected fragment: {}",
            self.script[0].fragment
        );
    }
}

/// Whether the log records a COMMIT.
pub fn committed(log: &StatementLog) -> bool {
    log.lock().iter().any(|(sql, _)| sql == "COMMIT")
}

/// Whether the log records a ROLLBACK.
pub fn rolled_back(log: &StatementLog) -> bool {
    log.lock().iter().any(|(sql, _)| sql == "ROLLBACK")
}

/// The logged statements, in order, without their arguments.
pub fn logged_sql(log: &StatementLog) -> Vec<String> {
    log.lock().iter().map(|(sql, _)| sql.clone()).collect()
}

#[async_trait]
impl Session for ScriptedSession {
    async fn begin(&mut self, mode: TxnMode) -> Result<(), DbError> {
        let sql = match mode {
            TxnMode::ReadOnly => "BEGIN READ ONLY",
            TxnMode::ReadWrite => "BEGIN",
        };
        self.log.lock().push((sql.to_string(), Vec::new()));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.log.lock().push(("COMMIT".to_string(), Vec::new()));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.log.lock().push(("ROLLBACK".to_string(), Vec::new()));
        Ok(())
    }

    async fn query(&mut self, sql: &str, args: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        let step = self.next_step(sql);
        self.log.lock().push((sql.to_string(), args.to_vec()));
        match step.error {
            Some(e) => Err(e),
            None => Ok(step.rows),
        }
    }

    async fn execute(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64, DbError> {
        let step = self.next_step(sql);
        self.log.lock().push((sql.to_string(), args.to_vec()));
        match step.error {
            Some(e) => Err(e),
            None => Ok(step.affected)
        }
    }
}

/// A pool handing out pre-scripted sessions in order.
#[derive(Debug, Default)]
pub struct ScriptedPool {
    sessions: Mutex<VecDeque<ScriptedSession>>,
}

impl ScriptedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, session: ScriptedSession) {
        self.sessions.lock().push_back(session);
    }
}

#[async_trait]
impl SessionPool for ScriptedPool {
    async fn acquire(&self) -> Result<Box<dyn Session>, DbError> {
        self.sessions
            .lock()
            .pop_front()
            .map(|s| Box::new(s) as Box<dyn Session>)
            .ok_or_else(|| DbError::Connection("no scripted session available".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_session_replays_in_order() {
        let mut session = ScriptedSession::new()
            .expect(
                "SELECT",
                vec![SqlRow::new(vec![(
                    "_key".to_string(),
                    SqlValue::Text("k1".to_string()),
                )])],
            )
            .expect_exec("UPDATE", 1);
        let log = session.log_handle();

        session.begin(TxnMode::ReadWrite).await.unwrap();
        let rows = session.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        let n = session.execute("UPDATE t SET x = 1", &[]).await.unwrap();
        assert_eq!(n, 1);
        session.commit().await.unwrap();

        assert!(committed(&log));
        assert!(!rolled_back(&log));
        assert_eq!(logged_sql(&log).first().unwrap(), "BEGIN");
        session.verify_drained();
    }

    #[tokio::test]
    #[should_panic(expected = "statement mismatch")]
    async fn test_scripted_session_panics_on_mismatch() {
        let mut session = ScriptedSession::new().expect("SELECT", vec![]);
        let _ = session.query("DELETE FROM t", &[]).await;
    }

    #[tokio::test]
    async fn test_scripted_pool_exhaustion() {
        let pool = ScriptedPool::new();
        pool.push(ScriptedSession::new());
        assert!(pool.acquire().await.is_ok());
        assert!(pool.acquire().await.is_err());
    }
}
