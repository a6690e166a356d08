//! Tunables for a document session.
//!
//! Every field is public; override with struct-update syntax:
//!
//! ```
//! use std::time::Duration;
//! use tandem_sync::SyncConfig;
//!
//! let config = SyncConfig {
//!     save_debounce: Duration::from_millis(200),
//!     ..SyncConfig::default()
//! };
//! assert_eq!(config.save_timeout, Duration::from_secs(8));
//! ```

use std::time::Duration;

/// Reconnect policy for the transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// First retry delay.
    pub base: Duration,
    /// Upper bound on any retry delay.
    pub cap: Duration,
    /// A connection that lasts this long resets the delay to `base`.
    pub stable_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
            stable_after: Duration::from_secs(5),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last local edit before an auto save.
    pub save_debounce: Duration,
    /// A save without confirmation after this long fails.
    pub save_timeout: Duration,
    /// How long `success`/`error` stay visible before reverting to `idle`.
    pub status_window: Duration,
    /// Peers silent for longer than this are dropped.
    pub presence_timeout: Duration,
    /// Period of the expiry sweep; the local record is re-broadcast at the same rate.
    pub presence_sweep: Duration,
    /// Minimum interval between local cursor broadcasts.
    pub presence_throttle: Duration,
    /// Malformed operations tolerated from one peer before a full resync.
    pub malformed_threshold: u32,
    /// Frames buffered while disconnected.
    pub queue_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(600),
            save_timeout: Duration::from_secs(8),
            status_window: Duration::from_secs(3),
            presence_timeout: Duration::from_secs(30),
            presence_sweep: Duration::from_secs(10),
            presence_throttle: Duration::from_millis(50),
            malformed_threshold: 5,
            queue_capacity: 10_000,
            backoff: BackoffConfig::default(),
        }
    }
}
