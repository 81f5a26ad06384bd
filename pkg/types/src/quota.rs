use chrono::{DateTime, Utc};
use pkg_constants::quota::UNLIMITED;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum allowed cumulative usage of a resource. `-1` means unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct HardLimit(i64);

impl HardLimit {
    pub const UNLIMITED: HardLimit = HardLimit(UNLIMITED);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 < 0
    }

    /// The numeric limit, or `None` when unlimited.
    pub fn value(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some(self.0)
        }
    }

    /// Raw stored value (negative for unlimited).
    pub fn raw(&self) -> i64 {
        self.0
    }

    /// Whether `total` fits inside this limit.
    pub fn admits(&self, total: i64) -> bool {
        self.value().is_none_or(|limit| total <= limit)
    }
}

impl From<i64> for HardLimit {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for HardLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value() {
            Some(v) => write!(f, "{}", v),
            None => write!(f, "unlimited"),
        }
    }
}

/// Project-level override of a resource's hard limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectQuota {
    pub project_id: String,
    pub resource: String,
    pub hard_limit: HardLimit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Class-level default for a resource's hard limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaClass {
    pub class_name: String,
    pub resource: String,
    pub hard_limit: HardLimit,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Running counters for one `(project, resource)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaUsage {
    pub id: String,
    pub project_id: String,
    pub resource: String,
    pub in_use: i64,
    pub reserved: i64,
    /// Reservations left before a forced resync; `None` disables the countdown.
    #[serde(default)]
    pub until_refresh: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaUsage {
    /// `in_use + reserved`, saturating at `i64::MAX`.
    pub fn total(&self) -> i64 {
        self.in_use.saturating_add(self.reserved)
    }

    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            in_use: self.in_use,
            reserved: self.reserved,
        }
    }
}

/// `in_use` / `reserved` snapshot returned by usage queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UsageTotals {
    pub in_use: i64,
    pub reserved: i64,
}

/// A provisional hold against a quota awaiting settlement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub uuid: String,
    pub usage_id: String,
    pub project_id: String,
    pub resource: String,
    pub delta: i64,
    pub expire: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// Amount this reservation holds in the owning usage's `reserved` counter.
    /// Releases (negative deltas) never hold capacity.
    pub fn held(&self) -> i64 {
        self.delta.max(0)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire < now
    }
}

/// Terminal and non-terminal states of a reservation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReservationState {
    Outstanding,
    Committed,
    RolledBack,
    Expired,
}

impl ReservationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationState::Outstanding)
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationState::Outstanding => write!(f, "outstanding"),
            ReservationState::Committed => write!(f, "committed"),
            ReservationState::RolledBack => write!(f, "rolled_back"),
            ReservationState::Expired => write!(f, "expired"),
        }
    }
}

/// All usage rows and outstanding reservations of one project.
///
/// Persisted as a single document so that a reservation batch or a
/// settlement lands in one atomic write.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectLedger {
    pub project_id: String,
    #[serde(default)]
    pub usages: BTreeMap<String, QuotaUsage>,
    /// Outstanding reservations keyed by uuid.
    #[serde(default)]
    pub reservations: BTreeMap<String, Reservation>,
}

impl ProjectLedger {
    pub fn new(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            ..Default::default()
        }
    }

    pub fn totals(&self) -> BTreeMap<String, UsageTotals> {
        self.usages
            .iter()
            .map(|(resource, usage)| (resource.clone(), usage.totals()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.usages.is_empty() && self.reservations.is_empty()
    }
}
