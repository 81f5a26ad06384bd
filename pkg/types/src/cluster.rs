use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Persisted Cluster object ---

/// A named group of services of the same binary.
///
/// `(name, race_preventer)` is unique. Live rows carry `race_preventer = 0`;
/// on destroy it is rewritten to the row's own id so the name can be reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub binary: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    pub race_preventer: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterCreate {
    pub name: String,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
}

/// Mutable cluster fields; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterUpdate {
    #[serde(default)]
    pub disabled: Option<bool>,
    /// `Some(None)` clears the reason.
    #[serde(default)]
    pub disabled_reason: Option<Option<String>>,
}

/// Aggregates derived from a cluster's member services at query time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterSummary {
    pub num_hosts: usize,
    pub num_down_hosts: usize,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ClusterSummary {
    pub fn is_up(&self) -> bool {
        self.num_hosts > self.num_down_hosts
    }
}

/// A cluster as returned by queries, with optionally loaded membership data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterView {
    pub cluster: Cluster,
    #[serde(default)]
    pub summary: Option<ClusterSummary>,
    #[serde(default)]
    pub services: Option<Vec<Service>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadDeleted {
    #[default]
    No,
    Yes,
    Only,
}

impl ReadDeleted {
    pub fn admits(&self, deleted: bool) -> bool {
        match self {
            ReadDeleted::No => !deleted,
            ReadDeleted::Yes => true,
            ReadDeleted::Only => deleted,
        }
    }
}

/// Filters accepted by cluster queries. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterFilters {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    /// Cluster has at least one service heartbeating inside the liveness window.
    #[serde(default)]
    pub is_up: Option<bool>,
    #[serde(default)]
    pub num_hosts: Option<usize>,
    #[serde(default)]
    pub num_down_hosts: Option<usize>,
    #[serde(default)]
    pub read_deleted: ReadDeleted,
    /// Attach a `ClusterSummary` to each result.
    #[serde(default)]
    pub services_summary: bool,
    /// Attach the member services to each result.
    #[serde(default)]
    pub services: bool,
}

impl ClusterFilters {
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn by_name(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    /// Whether any filter needs the derived membership aggregates.
    pub fn needs_summary(&self) -> bool {
        self.services_summary
            || self.is_up.is_some()
            || self.num_hosts.is_some()
            || self.num_down_hosts.is_some()
    }
}

// --- Persisted Service object ---

/// A running volume/backup/scheduler service process on a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub id: i64,
    pub host: String,
    pub binary: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Service {
    pub fn is_up(&self, now: DateTime<Utc>, down_time: std::time::Duration) -> bool {
        let age = now
            .signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or_default();
        age <= down_time
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCreate {
    pub host: String,
    pub binary: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub disabled_reason: Option<Option<String>>,
    /// `Some(None)` detaches the service from its cluster.
    #[serde(default)]
    pub cluster_name: Option<Option<String>>,
}

/// Filters accepted by `service_get_all`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceFilters {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub binary: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub disabled: Option<bool>,
    #[serde(default)]
    pub read_deleted: ReadDeleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn make_service(age_secs: i64) -> Service {
        let now = Utc::now();
        Service {
            id: 1,
            host: "host-a".to_string(),
            binary: "cinder-volume".to_string(),
            topic: None,
            cluster_name: Some("c1".to_string()),
            disabled: false,
            disabled_reason: None,
            created_at: now,
            last_heartbeat: now - chrono::Duration::seconds(age_secs),
            deleted: false,
            deleted_at: None,
        }
    }

    #[test]
    fn test_service_liveness_window() {
        let window = Duration::from_secs(60);
        assert!(make_service(10).is_up(Utc::now(), window));
        assert!(!make_service(120).is_up(Utc::now(), window));
    }

    #[test]
    fn test_read_deleted() {
        assert!(ReadDeleted::No.admits(false));
        assert!(!ReadDeleted::No.admits(true));
        assert!(ReadDeleted::Yes.admits(true));
        assert!(ReadDeleted::Only.admits(true));
        assert!(!ReadDeleted::Only.admits(false));
    }

    #[test]
    fn test_summary_is_up() {
        let summary = ClusterSummary {
            num_hosts: 2,
            num_down_hosts: 2,
            last_heartbeat: None,
        };
        assert!(!summary.is_up());
        assert!(!ClusterSummary::default().is_up());
        let summary = ClusterSummary {
            num_hosts: 2,
            num_down_hosts: 1,
            last_heartbeat: None,
        };
        assert!(summary.is_up());
    }
}
