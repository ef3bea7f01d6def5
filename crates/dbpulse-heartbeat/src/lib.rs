//! Heartbeat writer.
//!
//! On the primary, maintains one row `(monitor_id, ts, freq)` in the
//! heartbeat table so downstream consumers can compute replication lag
//! from anywhere the row replicates to.

use dbpulse_common::config::{parse_duration, HeartbeatConfig};
use dbpulse_db::{sanitize_table, DbConn, Param};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// On-the-wire heartbeat table schema. `freq` is milliseconds.
pub const HEARTBEAT_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS heartbeat (
  monitor_id varchar(500)      NOT NULL PRIMARY KEY,
  ts         timestamp(3)      NOT NULL,
  freq       smallint unsigned NOT NULL
) ENGINE=InnoDB";

/// How long to wait for the database to execute any heartbeat write.
/// Much greater than the write frequency so a slow network does not cause
/// overlapping writes.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait between retries of the bootstrap insert on generic errors.
pub const INIT_ERROR_WAIT: Duration = Duration::from_secs(10);

/// Wait when the instance is read-only. Long, because this instance may be
/// a standby indefinitely; it starts heartbeating when promoted.
pub const READ_ONLY_WAIT: Duration = Duration::from_secs(20);

pub struct Writer {
    monitor_id: String,
    db: Arc<dyn DbConn>,
    table: String,
    freq: Duration,
    write_timeout: Duration,
    init_error_wait: Duration,
    read_only_wait: Duration,
}

impl Writer {
    pub fn new(
        monitor_id: &str,
        db: Arc<dyn DbConn>,
        cfg: &HeartbeatConfig,
    ) -> anyhow::Result<Self> {
        if cfg.freq.is_empty() {
            anyhow::bail!("heartbeat writer built without heartbeat.freq");
        }
        if cfg.table.is_empty() {
            anyhow::bail!("heartbeat writer built without heartbeat.table");
        }
        let freq = parse_duration(&cfg.freq).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Self {
            monitor_id: monitor_id.to_string(),
            db,
            table: sanitize_table(&cfg.table, "dbpulse"),
            freq,
            write_timeout: WRITE_TIMEOUT,
            init_error_wait: INIT_ERROR_WAIT,
            read_only_wait: READ_ONLY_WAIT,
        })
    }

    /// Override the retry waits; tests compress them.
    pub fn with_waits(
        mut self,
        write_timeout: Duration,
        init_error_wait: Duration,
        read_only_wait: Duration,
    ) -> Self {
        self.write_timeout = write_timeout;
        self.init_error_wait = init_error_wait;
        self.read_only_wait = read_only_wait;
        self
    }

    /// Write heartbeats until `stop` is cancelled. Blocking; run it in its
    /// own task.
    pub async fn write(&self, stop: CancellationToken) {
        if !self.bootstrap(&stop).await {
            tracing::debug!(monitor_id = %self.monitor_id, "heartbeat writer stopped during bootstrap");
            return;
        }

        // The real heartbeat: a bare UPDATE, one round trip. The bootstrap
        // row guarantees it matches.
        let sql = format!("UPDATE {} SET ts=NOW(3) WHERE monitor_id = ?", self.table);
        let params = [Param::from(self.monitor_id.as_str())];

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.freq) => {}
            }

            match tokio::time::timeout(self.write_timeout, self.db.exec(&sql, &params)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_read_only() => {
                    tracing::debug!(
                        monitor_id = %self.monitor_id,
                        "instance is read-only, heartbeat sleeping {:?}", self.read_only_wait
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(self.read_only_wait) => {}
                    }
                }
                Ok(Err(e)) => {
                    // Keep writing at freq; no extra sleep for random errors.
                    tracing::warn!(monitor_id = %self.monitor_id, error = %e, "heartbeat write failed");
                }
                Err(_) => {
                    tracing::warn!(
                        monitor_id = %self.monitor_id,
                        "heartbeat write timed out after {:?}", self.write_timeout
                    );
                }
            }

            if stop.is_cancelled() {
                break;
            }
        }
        tracing::debug!(monitor_id = %self.monitor_id, "heartbeat writer stopped");
    }

    /// First write: upsert the row so the steady-state UPDATE always
    /// matches. Retries until success; returns false when stopped first.
    async fn bootstrap(&self, stop: &CancellationToken) -> bool {
        let sql = format!(
            "INSERT INTO {} (monitor_id, ts, freq) VALUES (?, NOW(3), ?) \
             ON DUPLICATE KEY UPDATE ts=NOW(3), freq=?",
            self.table
        );
        let freq_ms = self.freq.as_millis() as u64;
        let params = [
            Param::from(self.monitor_id.as_str()),
            Param::UInt(freq_ms),
            Param::UInt(freq_ms),
        ];

        loop {
            let wait = match tokio::time::timeout(self.write_timeout, self.db.exec(&sql, &params))
                .await
            {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) if e.is_read_only() => {
                    tracing::debug!(
                        monitor_id = %self.monitor_id,
                        "instance is read-only, heartbeat init sleeping {:?}", self.read_only_wait
                    );
                    self.read_only_wait
                }
                Ok(Err(e)) => {
                    tracing::warn!(monitor_id = %self.monitor_id, error = %e, "heartbeat init failed");
                    self.init_error_wait
                }
                Err(_) => {
                    tracing::warn!(
                        monitor_id = %self.monitor_id,
                        "heartbeat init timed out after {:?}", self.write_timeout
                    );
                    self.init_error_wait
                }
            };

            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dbpulse_db::{DbError, Row};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Scripted `DbConn`: pops one result per exec, then succeeds forever.
    #[derive(Default)]
    struct ScriptedDb {
        script: Mutex<VecDeque<Result<u64, DbError>>>,
        execs: Mutex<Vec<String>>,
    }

    impl ScriptedDb {
        fn with_script(script: Vec<Result<u64, DbError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                execs: Mutex::new(Vec::new()),
            })
        }

        fn exec_count(&self) -> usize {
            self.execs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DbConn for ScriptedDb {
        async fn ping(&self) -> Result<(), DbError> {
            Ok(())
        }
        async fn query(&self, _sql: &str, _params: &[Param]) -> Result<Vec<Row>, DbError> {
            Ok(Vec::new())
        }
        async fn exec(&self, sql: &str, _params: &[Param]) -> Result<u64, DbError> {
            self.execs.lock().unwrap().push(sql.to_string());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(1))
        }
    }

    fn writer(db: Arc<ScriptedDb>) -> Writer {
        Writer::new(
            "db1",
            db,
            &HeartbeatConfig {
                freq: "1s".to_string(),
                table: "heartbeat".to_string(),
            },
        )
        .unwrap()
    }

    #[test]
    fn new_requires_freq_and_table() {
        let db = ScriptedDb::with_script(vec![]);
        assert!(Writer::new("db1", db.clone(), &HeartbeatConfig::default()).is_err());
        assert!(Writer::new(
            "db1",
            db,
            &HeartbeatConfig { freq: "2s".to_string(), table: String::new() }
        )
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_upsert_then_steady_updates() {
        let db = ScriptedDb::with_script(vec![Ok(1), Ok(1), Ok(1), Ok(1)]);
        let w = writer(db.clone());
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let stop = stop.clone();
            async move { w.write(stop).await }
        });

        // Bootstrap + three steady writes at 1s each.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop.cancel();
        task.await.unwrap();

        let execs = db.execs.lock().unwrap().clone();
        assert!(execs.len() >= 4, "expected bootstrap + 3 updates, got {}", execs.len());
        assert!(execs[0].starts_with("INSERT INTO `dbpulse`.`heartbeat`"));
        assert!(execs[0].contains("ON DUPLICATE KEY UPDATE"));
        assert!(execs[1].starts_with("UPDATE `dbpulse`.`heartbeat` SET ts=NOW(3)"));
    }

    #[tokio::test(start_paused = true)]
    async fn read_only_waits_longer_than_generic_errors() {
        // Two read-only failures, then success: the writer must dwell
        // read_only_wait (not init_error_wait) between attempts.
        let db = ScriptedDb::with_script(vec![
            Err(DbError::ReadOnly("super_read_only".into())),
            Err(DbError::ReadOnly("super_read_only".into())),
            Ok(1),
        ]);
        let w = writer(db.clone()).with_waits(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
        );
        let stop = CancellationToken::new();

        let start = Instant::now();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move { w.write(stop).await }
        });

        // Wait until the bootstrap has retried through both read-only
        // dwells (2 x 20s) and succeeded.
        while db.exec_count() < 3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(40), "dwelled only {elapsed:?}");
        assert!(elapsed < Duration::from_secs(60), "dwelled too long: {elapsed:?}");

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn generic_init_error_uses_medium_wait() {
        let db = ScriptedDb::with_script(vec![
            Err(DbError::Query("table missing".into())),
            Ok(1),
        ]);
        let w = writer(db.clone()).with_waits(
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20),
        );
        let stop = CancellationToken::new();

        let start = Instant::now();
        let task = tokio::spawn({
            let stop = stop.clone();
            async move { w.write(stop).await }
        });

        while db.exec_count() < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(20), "used the read-only wait: {elapsed:?}");

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn steady_state_error_keeps_cadence() {
        // Bootstrap ok, then one failed update: the next write happens one
        // freq later, with no extra dwell.
        let db = ScriptedDb::with_script(vec![
            Ok(1),
            Err(DbError::Unavailable("gone".into())),
            Ok(1),
        ]);
        let w = writer(db.clone());
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let stop = stop.clone();
            async move { w.write(stop).await }
        });

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(db.exec_count() >= 3, "got {}", db.exec_count());

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_bootstrap_returns_promptly() {
        let db = ScriptedDb::with_script(vec![Err(DbError::Unavailable("down".into()))]);
        let w = writer(db.clone());
        let stop = CancellationToken::new();
        stop.cancel();

        w.write(stop).await;
        assert_eq!(db.exec_count(), 1);
    }
}
