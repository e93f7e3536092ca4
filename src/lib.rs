// lib.rs - stargrid core: viewport windowing + offline sync

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod checksum;
pub mod gesture;
pub mod store;
pub mod sync;
pub mod viewport;

use serde::{Deserialize, Serialize};

pub use gesture::{
    FrameTicket, GestureConfig, GestureError, GesturePhase, ReleaseOutcome, ScrollGesture,
};
pub use store::{DurableStorage, FileStorage, MemoryStorage, StoreError};
pub use sync::{
    ApplyOutcome, ConflictId, ConflictPolicy, ConnectivitySignal, FailureReason, MetricsSnapshot,
    OfflineStatus, OpId, OpKind, OpStatus, Priority, RemoteError, RemoteStore, Resolution,
    Severity, SharedConnectivity, SyncConfig, SyncConflict, SyncEngine, SyncError, SyncOperation,
    SyncReport,
};
pub use viewport::{
    Align, RenderCache, RowDescriptor, ViewportError, ViewportWindow, VisibleItems, VisibleRange,
};

pub const DEFAULT_OVERSCAN: usize = 5;
pub const DEFAULT_CLEANUP_BUFFER: usize = 10;
pub const DEFAULT_FRICTION: f64 = 0.95;
pub const DEFAULT_SAMPLE_WINDOW_MS: u64 = 100;
pub const DEFAULT_DOUBLE_TAP_WINDOW_MS: u64 = 300;
pub const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_MAX_ENTRY_AGE_MS: u64 = 24 * 60 * 60 * 1000;
pub const DEFAULT_MAX_STORE_BYTES: usize = 4 * 1024 * 1024;
pub const BASE_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const JITTER_MAX_MS: u64 = 1_000;

/// Unix timestamp in milliseconds. Every time-dependent operation takes one
/// of these explicitly; the engine never reads a global clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn saturating_sub(self, ms: u64) -> Self {
        Self(self.0.saturating_sub(ms))
    }
}
