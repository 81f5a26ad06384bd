//! Cluster membership constants.

/// A service whose last heartbeat is older than this is considered down.
pub const SERVICE_DOWN_TIME_SECS: u64 = 60;

/// Binary name used when a cluster is created without one.
pub const DEFAULT_CLUSTER_BINARY: &str = "cinder-volume";

/// `race_preventer` value carried by every live cluster row.
pub const LIVE_RACE_PREVENTER: i64 = 0;
