//! Shared types for the dbpulse agent: metric records, instance state,
//! monitor configuration, and the process-wide event stream.

pub mod config;
pub mod event;
pub mod types;
