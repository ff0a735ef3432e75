//! Process-wide logging initialization.
//!
//! The runtime emits structured `tracing` events throughout; embedders that
//! install their own subscriber can skip this. `init` is idempotent so the
//! engine can call it unconditionally at construction.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs a global subscriber reading `EDGELM_LOG` (falling back to
/// `warn`). Does nothing if a subscriber is already set.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env("EDGELM_LOG")
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
