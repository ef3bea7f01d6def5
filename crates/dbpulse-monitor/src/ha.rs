//! High-availability provider hook.
//!
//! An external HA manager can declare an instance to be a standby, which
//! short-circuits the adjuster's state probe. The default is no HA
//! integration.

use std::sync::Arc;

pub trait HaManager: Send + Sync {
    /// True when the HA provider says this instance is a standby.
    fn standby(&self) -> bool;
}

/// HA integration disabled: never standby.
pub struct Disabled;

impl HaManager for Disabled {
    fn standby(&self) -> bool {
        false
    }
}

pub fn disabled() -> Arc<dyn HaManager> {
    Arc::new(Disabled)
}
