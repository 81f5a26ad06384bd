//! Quota defaults and resource names.

/// Hard-limit sentinel meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Name of the quota class whose rows override the configured defaults.
pub const DEFAULT_QUOTA_CLASS: &str = "default";

pub const RESOURCE_VOLUMES: &str = "volumes";
pub const RESOURCE_SNAPSHOTS: &str = "snapshots";
pub const RESOURCE_GIGABYTES: &str = "gigabytes";
pub const RESOURCE_BACKUPS: &str = "backups";
pub const RESOURCE_BACKUP_GIGABYTES: &str = "backup_gigabytes";
pub const RESOURCE_GROUPS: &str = "groups";
/// Absolute (non-reservable) limit on the size of a single volume.
pub const RESOURCE_PER_VOLUME_GIGABYTES: &str = "per_volume_gigabytes";

pub const DEFAULT_QUOTA_VOLUMES: i64 = 10;
pub const DEFAULT_QUOTA_SNAPSHOTS: i64 = 10;
pub const DEFAULT_QUOTA_GIGABYTES: i64 = 1000;
pub const DEFAULT_QUOTA_BACKUPS: i64 = 10;
pub const DEFAULT_QUOTA_BACKUP_GIGABYTES: i64 = 1000;
pub const DEFAULT_QUOTA_GROUPS: i64 = 10;
pub const DEFAULT_PER_VOLUME_SIZE_LIMIT: i64 = UNLIMITED;

/// Seconds until an unsettled reservation is considered abandoned.
pub const DEFAULT_RESERVATION_EXPIRE_SECS: u64 = 86_400;

/// Reservations permitted before a usage row is forcibly resynced (0 = never).
pub const DEFAULT_UNTIL_REFRESH: i64 = 0;

/// Seconds between forced usage resyncs (0 = never).
pub const DEFAULT_MAX_AGE_SECS: u64 = 0;

/// How often the expiry sweep runs in the daemon.
pub const RESERVATION_SWEEP_INTERVAL_SECS: u64 = 60;
