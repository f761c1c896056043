//! Shared constants for the coordination backend.
//!
//! The prefix characters and the lock timing values are part of the wire
//! contract with the coordination service and with other processes running
//! the same backend; changing them breaks mixed-version deployments.

use std::time::Duration;

/// Leaf prefix for value nodes. The coordination service still lists
/// `.`-prefixed entries, so values remain visible in directory listings.
pub const VALUE_NODE_PREFIX: &str = ".";

/// Leaf prefix for lock-queue directories. The coordination service excludes
/// `_`-prefixed entries from directory listings, which keeps the lock
/// hierarchy out of user-visible enumeration.
pub const LOCK_NODE_PREFIX: &str = "_";

/// Delimiter between coordination-service endpoints in the `address`
/// configuration value.
pub const ENDPOINT_DELIMITER: char = ',';

/// TTL applied to every lock-queue entry. The backend never renews it;
/// holds expected to outlive this must be refreshed out-of-band.
pub const LOCK_TTL_SECONDS: u64 = 15;

/// Pause between retries of a failed single-key watch.
pub const WATCH_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Number of watch attempts before lock loss is declared conservatively.
pub const WATCH_RETRY_MAX: u32 = 5;

/// Root prefix used when the configuration supplies none.
pub const DEFAULT_ROOT_PATH: &str = "/vault";

/// Endpoint used when the configuration supplies none.
pub const DEFAULT_ENDPOINT: &str = "http://128.0.0.1:4001";

/// Error codes in the coordination service's API error space.
pub mod codes {
    /// Requested key does not exist.
    pub const KEY_NOT_FOUND: u32 = 100;
    /// Operation requires a file but the key is a directory.
    pub const NOT_A_FILE: u32 = 102;
    /// Operation requires a directory but the key is a file.
    pub const NOT_A_DIR: u32 = 104;
}
