//! Narrow database interface.
//!
//! The agent never talks to a driver directly. Every component that needs
//! the database (engine ping, collector queries, heartbeat writes, the
//! adjuster's state probe) goes through [`DbConn`], and connections are
//! built through [`DbFactory`]. Concrete drivers live outside this
//! workspace; tests implement the traits with in-memory mocks.

use async_trait::async_trait;
use dbpulse_common::config::MonitorConfig;
use std::sync::Arc;

/// One result row: column values in select order, stringly typed the way
/// MySQL text-protocol results arrive.
pub type Row = Vec<String>;

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Str(String),
    Int(i64),
    UInt(u64),
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Str(v.to_string())
    }
}

impl From<u64> for Param {
    fn from(v: u64) -> Self {
        Param::UInt(v)
    }
}

/// Database errors, classified just enough for retry policy decisions.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DbError {
    /// The instance refused a write because it is read-only
    /// (`read_only`/`super_read_only` set, or a replica).
    #[error("db: instance is read-only: {0}")]
    ReadOnly(String),

    /// Could not reach the instance (connect refused, lost connection).
    #[error("db: unavailable: {0}")]
    Unavailable(String),

    /// The statement itself failed (syntax, unknown table, privileges).
    #[error("db: query failed: {0}")]
    Query(String),
}

impl DbError {
    pub fn is_read_only(&self) -> bool {
        matches!(self, DbError::ReadOnly(_))
    }
}

/// A live connection (pool) to one database instance.
#[async_trait]
pub trait DbConn: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), DbError>;

    /// Run a result-returning statement.
    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<Row>, DbError>;

    /// Run a statement, returning affected rows.
    async fn exec(&self, sql: &str, params: &[Param]) -> Result<u64, DbError>;
}

/// Builds connections from monitor configs. One factory serves the whole
/// agent; each monitor gets its own connection.
pub trait DbFactory: Send + Sync {
    fn make(&self, cfg: &MonitorConfig) -> Result<Arc<dyn DbConn>, DbError>;
}

/// Sanitize a table reference for inlining into SQL text.
///
/// Accepts `table` or `db.table`, strips backticks and anything outside
/// `[A-Za-z0-9$_.]`, and qualifies bare names with `default_db`.
pub fn sanitize_table(table: &str, default_db: &str) -> String {
    let clean: String = table
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '$' | '_' | '.'))
        .collect();
    let mut parts = clean.splitn(2, '.');
    let first = parts.next().unwrap_or_default();
    match parts.next() {
        Some(tbl) if !tbl.is_empty() => format!("`{first}`.`{tbl}`"),
        _ if default_db.is_empty() => format!("`{first}`"),
        _ => format!("`{default_db}`.`{first}`"),
    }
}

/// Parse a status/variable value the way the server reports them: numbers
/// as-is, booleans as ON/OFF, YES/NO, TRUE/FALSE. Returns `None` for
/// values that have no numeric reading.
pub fn parse_value(s: &str) -> Option<f64> {
    if let Ok(v) = s.parse::<f64>() {
        return Some(v);
    }
    match s.to_ascii_uppercase().as_str() {
        "ON" | "YES" | "TRUE" => Some(1.0),
        "OFF" | "NO" | "FALSE" | "NULL" => Some(0.0),
        _ => None,
    }
}
