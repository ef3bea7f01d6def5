//! The level adjuster (LPA): changes the plan when the instance's state
//! changes.
//!
//! Once per second it probes the instance state. A state change is not
//! applied immediately: it dwells as `pending` for the configured
//! per-state `after` duration, which keeps transient replication or HA
//! flaps from thrashing plans. An empty plan name for a state means
//! "pause": collect nothing while the instance is unusable.

use crate::ha::HaManager;
use crate::level_collector::CollectorControl;
use chrono::{DateTime, Utc};
use dbpulse_common::config::{parse_duration, PlanAdjustConfig};
use dbpulse_common::event::{self, MonitorEmitter};
use dbpulse_common::types::State;
use dbpulse_db::DbConn;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// The probe must never hang the check loop; a probe that cannot answer
/// quickly means the instance is effectively offline.
const PROBE_TIMEOUT: Duration = Duration::from_millis(400);

const READ_ONLY_QUERY: &str = "SELECT @@read_only, @@super_read_only";

/// Dwell and target plan for one state.
#[derive(Debug, Clone, Default)]
struct Change {
    after: Duration,
    plan: String,
}

/// A state the adjuster has applied or is dwelling on.
#[derive(Debug, Clone, PartialEq)]
struct Applied {
    state: State,
    plan: String,
    ts: DateTime<Utc>,
}

pub struct LevelAdjusterArgs {
    pub monitor_id: String,
    pub config: PlanAdjustConfig,
    pub db: Arc<dyn DbConn>,
    pub lpc: Arc<dyn CollectorControl>,
    pub ha: Arc<dyn HaManager>,
}

pub struct LevelAdjuster {
    monitor_id: String,
    db: Arc<dyn DbConn>,
    lpc: Arc<dyn CollectorControl>,
    ha: Arc<dyn HaManager>,
    emitter: MonitorEmitter,
    states: HashMap<State, Change>,
    prev: Option<Applied>,
    curr: Applied,
    pending: Option<Applied>,
    first: bool,
}

impl LevelAdjuster {
    pub fn new(args: LevelAdjusterArgs) -> Self {
        let change = |sc: &dbpulse_common::config::StateChangeConfig| Change {
            // `after` is validated with the monitor config; default 0.
            after: parse_duration(&sc.after).unwrap_or(Duration::ZERO),
            plan: sc.plan.clone(),
        };
        let states = HashMap::from([
            (State::Offline, change(&args.config.offline)),
            (State::Standby, change(&args.config.standby)),
            (State::ReadOnly, change(&args.config.read_only)),
            (State::Active, change(&args.config.active)),
        ]);
        Self {
            emitter: MonitorEmitter::new(args.monitor_id.clone()),
            monitor_id: args.monitor_id,
            db: args.db,
            lpc: args.lpc,
            ha: args.ha,
            states,
            prev: None,
            curr: Applied {
                state: State::Offline,
                plan: String::new(),
                ts: Utc::now(),
            },
            pending: None,
            first: true,
        }
    }

    /// Check state once per second until `stop` is cancelled. Blocking;
    /// run it in its own task.
    pub async fn run(mut self, stop: CancellationToken) {
        tracing::debug!(monitor_id = %self.monitor_id, "level adjuster running");
        loop {
            if stop.is_cancelled() {
                break;
            }
            let observed = self.observe().await;
            self.apply_observation(observed, Utc::now()).await;
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            }
        }
        tracing::debug!(monitor_id = %self.monitor_id, "level adjuster stopped");
    }

    /// The debounce state machine, separated from the probe so tests can
    /// inject observations and timestamps.
    pub async fn apply_observation(&mut self, observed: State, now: DateTime<Utc>) {
        if observed == self.curr.state {
            // Back to (or still in) the current state; a pending change,
            // if any, was transient.
            if self.pending.take().is_some() {
                self.emitter.send(event::STATE_CHANGE_ABORT, observed.as_str());
            }
        } else if self.pending.as_ref().map(|p| p.state) == Some(observed) {
            // Still in the pending state; commit once it has dwelled long
            // enough.
            let pending = self.pending.as_ref().expect("pending is set");
            let dwell = self.states[&pending.state].after;
            if now.signed_duration_since(pending.ts).to_std().unwrap_or(Duration::ZERO) < dwell {
                return;
            }
            let pending = self.pending.take().expect("pending is set");
            self.change_plan(pending.state, &pending.plan).await;
            self.prev = Some(std::mem::replace(&mut self.curr, pending));
            self.emitter.send(event::STATE_CHANGE_END, observed.as_str());
        } else if self.first && self.curr.state == State::Offline {
            // Bootstrap: apply the first observed state with no dwell.
            self.first = false;
            let plan = self.states[&observed].plan.clone();
            self.change_plan(observed, &plan).await;
            self.prev = Some(std::mem::replace(
                &mut self.curr,
                Applied { state: observed, plan, ts: now },
            ));
            self.emitter.send(event::STATE_CHANGE_END, observed.as_str());
        } else {
            // A new state: start dwelling on it.
            let plan = self.states[&observed].plan.clone();
            self.pending = Some(Applied { state: observed, plan, ts: now });
            self.emitter.send(event::STATE_CHANGE_BEGIN, observed.as_str());
        }
    }

    async fn change_plan(&self, state: State, plan: &str) {
        if plan.is_empty() {
            self.lpc.pause();
            return;
        }
        if let Err(e) = self.lpc.change_plan(state, plan).await {
            tracing::warn!(monitor_id = %self.monitor_id, error = %e, "change plan refused");
        }
    }

    /// Probe the instance state. Standby comes from the HA provider; the
    /// rest from a short-timeout read-only query. Any error means
    /// offline.
    async fn observe(&self) -> State {
        if self.ha.standby() {
            return State::Standby;
        }
        match tokio::time::timeout(PROBE_TIMEOUT, self.db.query(READ_ONLY_QUERY, &[])).await {
            Ok(Ok(rows)) => match rows.first().and_then(|r| r.first()) {
                Some(read_only) if read_only == "1" => State::ReadOnly,
                Some(_) => State::Active,
                None => State::Offline,
            },
            Ok(Err(e)) => {
                tracing::debug!(monitor_id = %self.monitor_id, error = %e, "state probe failed");
                State::Offline
            }
            Err(_) => {
                tracing::debug!(monitor_id = %self.monitor_id, "state probe timed out");
                State::Offline
            }
        }
    }
}
