//! Process-wide event stream.
//!
//! Components emit named events for the notable moments of the control
//! plane (plan changes, state changes, monitor lifecycle). Every event is
//! logged through `tracing` and broadcast to any subscribers, so tests and
//! embedders can observe control-plane activity without scraping logs.

use chrono::{DateTime, Utc};
use std::sync::OnceLock;
use tokio::sync::broadcast;

// Plan change (LPC)
pub const CHANGE_PLAN_BEGIN: &str = "change-plan-begin";
pub const CHANGE_PLAN_ERROR: &str = "change-plan-error";
pub const CHANGE_PLAN_SUCCESS: &str = "change-plan-success";
pub const LPC_BLOCKED: &str = "lpc-blocked";
pub const LPC_PANIC: &str = "lpc-panic";
pub const ENGINE_COLLECT_ERROR: &str = "engine-collect-error";

// State change (LPA)
pub const STATE_CHANGE_BEGIN: &str = "state-change-begin";
pub const STATE_CHANGE_ABORT: &str = "state-change-abort";
pub const STATE_CHANGE_END: &str = "state-change-end";

// Engine
pub const ENGINE_PREPARE_PLAN: &str = "engine-prepare-plan";
pub const ENGINE_CONNECTING: &str = "engine-connecting";
pub const ENGINE_CONNECTED: &str = "engine-connected";

// Monitor loader
pub const MONITORS_LOADING: &str = "monitors-loading";
pub const MONITORS_LOADED: &str = "monitors-loaded";
pub const MONITORS_STARTING: &str = "monitors-starting";
pub const MONITORS_STARTED: &str = "monitors-started";
pub const MONITOR_STOPPED: &str = "monitor-stopped";
pub const MONITORS_STOPLOSS: &str = "monitors-stop-loss";
pub const MONITORS_RELOAD_ERROR: &str = "monitors-reload-error";

// Registries
pub const REGISTER_METRICS: &str = "register-metrics";
pub const REGISTER_SINKS: &str = "register-sinks";

/// One control-plane event.
#[derive(Debug, Clone)]
pub struct Event {
    pub ts: DateTime<Utc>,
    /// Empty for agent-wide events (loader, registries).
    pub monitor_id: String,
    pub name: &'static str,
    pub message: String,
    pub error: bool,
}

const BUS_CAPACITY: usize = 1024;

fn bus() -> &'static broadcast::Sender<Event> {
    static BUS: OnceLock<broadcast::Sender<Event>> = OnceLock::new();
    BUS.get_or_init(|| broadcast::channel(BUS_CAPACITY).0)
}

/// Subscribe to the event stream. Slow subscribers lag, they never block
/// emitters.
pub fn subscribe() -> broadcast::Receiver<Event> {
    bus().subscribe()
}

fn emit(monitor_id: &str, name: &'static str, message: String, error: bool) {
    if error {
        tracing::warn!(monitor_id, event = name, "{message}");
    } else {
        tracing::info!(monitor_id, event = name, "{message}");
    }
    let _ = bus().send(Event {
        ts: Utc::now(),
        monitor_id: monitor_id.to_string(),
        name,
        message,
        error,
    });
}

/// Emit an agent-wide event.
pub fn send(name: &'static str, message: impl Into<String>) {
    emit("", name, message.into(), false);
}

/// Emit an agent-wide error event.
pub fn error(name: &'static str, message: impl Into<String>) {
    emit("", name, message.into(), true);
}

/// Emits events on behalf of one monitor.
#[derive(Debug, Clone)]
pub struct MonitorEmitter {
    pub monitor_id: String,
}

impl MonitorEmitter {
    pub fn new(monitor_id: impl Into<String>) -> Self {
        Self { monitor_id: monitor_id.into() }
    }

    pub fn send(&self, name: &'static str, message: impl Into<String>) {
        emit(&self.monitor_id, name, message.into(), false);
    }

    pub fn error(&self, name: &'static str, message: impl Into<String>) {
        emit(&self.monitor_id, name, message.into(), true);
    }
}
