//! Synchronization settings
//!
//! Timing knobs for the session channel, awareness sweep, and the
//! lifecycle manager's branch-switch settling.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine-wide synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Reconnect backoff settings.
    pub reconnect: ReconnectSettings,
    /// How long a freshly connected channel waits for a peer's sync
    /// response before treating the room as carrying no prior state.
    pub sync_timeout_ms: u64,
    /// Awareness records older than this are swept out.
    pub awareness_grace_ms: u64,
    /// Interval between awareness staleness sweeps.
    pub awareness_sweep_ms: u64,
    /// Pause between tearing down one document triple and building the
    /// next during a branch switch, letting in-flight teardown drain.
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    /// First retry delay; doubles on each consecutive failure.
    pub base_ms: u64,
    /// Upper bound on the retry delay.
    pub cap_ms: u64,
    /// Consecutive failures before the user is notified.
    pub notice_threshold: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectSettings {
                base_ms: 500,
                cap_ms: 32_000,
                notice_threshold: 3,
            },
            sync_timeout_ms: 5_000,
            awareness_grace_ms: 30_000,
            awareness_sweep_ms: 5_000,
            settle_delay_ms: 250,
        }
    }
}

impl SyncSettings {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn awareness_grace(&self) -> Duration {
        Duration::from_millis(self.awareness_grace_ms)
    }

    pub fn awareness_sweep(&self) -> Duration {
        Duration::from_millis(self.awareness_sweep_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl ReconnectSettings {
    /// Delay before the next reconnect attempt: base * 2^failures,
    /// capped at `cap_ms`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.min(16);
        let ms = self
            .base_ms
            .saturating_mul(1u64 << exp)
            .min(self.cap_ms);
        Duration::from_millis(ms)
    }
}
