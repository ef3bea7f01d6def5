//! The `log` sink: one JSON line per record on stdout.

use crate::Sink;
use anyhow::Result;
use async_trait::async_trait;
use dbpulse_common::types::MetricRecord;

pub struct LogSink {
    monitor_id: String,
}

impl LogSink {
    pub fn new(monitor_id: &str) -> Self {
        Self {
            monitor_id: monitor_id.to_string(),
        }
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, metrics: &MetricRecord) -> Result<()> {
        println!("{}", serde_json::to_string(metrics)?);
        Ok(())
    }

    fn monitor_id(&self) -> &str {
        &self.monitor_id
    }
}
