//! Multi-client synchronization kernel for the shared watch organization and
//! its patrols: versioned aggregate operations, dual-store persistence with
//! asymmetric authority, a fire-and-forget broadcast channel, conflict
//! classification and resolution, and debounced patrol persistence.

pub mod aggregate;
pub mod authority;
pub mod channel;
pub mod conflict;
pub mod coordinator;
pub mod memory;
pub mod patrol;
pub mod store;

mod errors;

pub use errors::{ChannelError, StoreError, SyncError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Advisory wall-clock stamp in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
