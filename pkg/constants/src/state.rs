//! State store key layout and retry constants.

/// Prefix for per-project quota override rows: `<prefix><project>/<resource>`.
pub const QUOTA_LIMITS_PREFIX: &str = "/registry/quotas/limits/";

/// Prefix for quota class rows: `<prefix><class>/<resource>`.
pub const QUOTA_CLASSES_PREFIX: &str = "/registry/quotas/classes/";

/// Prefix for per-project ledger documents (usages + outstanding reservations).
pub const QUOTA_LEDGERS_PREFIX: &str = "/registry/quotas/ledgers/";

/// Prefix for cluster rows: `<prefix><name>/<race_preventer>`.
pub const CLUSTERS_PREFIX: &str = "/registry/clusters/";

/// Prefix for service rows: `<prefix><id>`.
pub const SERVICES_PREFIX: &str = "/registry/services/";

/// Prefix for monotonically increasing id counters: `<prefix><kind>`.
pub const SEQUENCES_PREFIX: &str = "/registry/sequences/";

/// How many times a transient store failure is attempted before surfacing.
pub const STORE_RETRY_MAX_ATTEMPTS: u32 = 5;

/// Pause between transient-failure attempts, in milliseconds.
pub const STORE_RETRY_INTERVAL_MS: u64 = 100;

/// Upper bound on compare-and-put rounds when allocating a sequence id.
pub const SEQUENCE_CAS_ATTEMPTS: u32 = 64;
