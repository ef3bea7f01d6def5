use async_trait::async_trait;
use dbpulse_db::{DbConn, DbError, Param, Row};
use std::sync::Mutex;

/// A `DbConn` that answers every query with canned rows and records the
/// SQL it was given.
#[derive(Default)]
pub struct MockDb {
    pub rows: Vec<Row>,
    pub queries: Mutex<Vec<String>>,
}

impl MockDb {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DbConn for MockDb {
    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn query(&self, sql: &str, _params: &[Param]) -> Result<Vec<Row>, DbError> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.rows.clone())
    }

    async fn exec(&self, sql: &str, _params: &[Param]) -> Result<u64, DbError> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(0)
    }
}

pub fn row(cols: &[&str]) -> Row {
    cols.iter().map(|c| c.to_string()).collect()
}
