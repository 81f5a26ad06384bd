//! Cluster rows and their race guard.
//!
//! A cluster lives under `<prefix><name>/<race_preventer>`, so the key itself is
//! the `(name, race_preventer)` unique index. Live rows always use
//! race_preventer 0, which makes two creates of one name collide on the same
//! key. The live row is written with the store's conditional insert, so the
//! collision holds across processes sharing one store. Destroying a cluster
//! moves its row to `<name>/<id>`, freeing slot 0 for a later create without
//! clobbering the tombstone.

use chrono::Utc;
use pkg_constants::cluster::{DEFAULT_CLUSTER_BINARY, LIVE_RACE_PREVENTER};
use pkg_constants::state::CLUSTERS_PREFIX;
use pkg_state::kv::{compare_and_put_json, get_json, list_json, next_sequence, put_json};
use pkg_state::{KvStore, RetryPolicy, retry_transient};
use pkg_types::cluster::{
    Cluster, ClusterCreate, ClusterFilters, ClusterSummary, ClusterUpdate, ClusterView,
    ReadDeleted, Service, ServiceFilters,
};
use pkg_types::config::ClusterConfig;
use pkg_types::context::RequestContext;
use pkg_types::validate::validate_key_segment;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};

pub(crate) fn cluster_key(name: &str, race_preventer: i64) -> String {
    format!("{}{}/{}", CLUSTERS_PREFIX, name, race_preventer)
}

fn name_prefix(name: &str) -> String {
    format!("{}{}/", CLUSTERS_PREFIX, name)
}

/// Cluster and service bookkeeping over a [`KvStore`].
pub struct ClusterRegistry {
    pub(crate) store: Arc<dyn KvStore>,
    /// Serializes writes from this process. Creates in other processes are
    /// caught by the conditional insert of the live row.
    pub(crate) write_lock: Mutex<()>,
    pub(crate) retry: RetryPolicy,
    down_time: Duration,
}

impl ClusterRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: &ClusterConfig, retry: RetryPolicy) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
            retry,
            down_time: config.service_down_time(),
        }
    }

    /// Services whose last heartbeat is older than this count as down.
    pub fn service_down_time(&self) -> Duration {
        self.down_time
    }

    pub(crate) fn require_admin(&self, ctx: &RequestContext, what: &str) -> Result<()> {
        if ctx.is_admin {
            Ok(())
        } else {
            Err(ClusterError::NotAuthorized(format!(
                "{} requires an admin context",
                what
            )))
        }
    }

    /// Create a live cluster. Fails with `ClusterExists` when a live cluster
    /// with the same name is already present.
    pub async fn cluster_create(&self, ctx: &RequestContext, values: ClusterCreate) -> Result<Cluster> {
        self.require_admin(ctx, "cluster_create")?;
        validate_key_segment("cluster name", &values.name)
            .map_err(|e| ClusterError::Invalid(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        let values = &values;
        let cluster = retry_transient(&self.retry, "cluster_create", move || async move {
            self.insert_live(values).await
        })
        .await?;
        info!(
            "Created cluster {} (id={}, binary={})",
            cluster.name, cluster.id, cluster.binary
        );
        Ok(cluster)
    }

    async fn insert_live(&self, values: &ClusterCreate) -> Result<Cluster> {
        let key = cluster_key(&values.name, LIVE_RACE_PREVENTER);
        let exists = || ClusterError::ClusterExists {
            name: values.name.clone(),
        };
        // Skips burning a sequence id when the slot is visibly taken.
        if self.store.get(&key).await?.is_some() {
            return Err(exists());
        }
        let now = Utc::now();
        let cluster = Cluster {
            id: next_sequence(self.store.as_ref(), "clusters").await?,
            name: values.name.clone(),
            binary: values
                .binary
                .clone()
                .unwrap_or_else(|| DEFAULT_CLUSTER_BINARY.to_string()),
            disabled: values.disabled,
            disabled_reason: values.disabled_reason.clone(),
            race_preventer: LIVE_RACE_PREVENTER,
            created_at: now,
            updated_at: now,
            deleted: false,
            deleted_at: None,
        };
        if !compare_and_put_json(self.store.as_ref(), &key, None, &cluster).await? {
            debug!("Cluster create for {} lost the race", values.name);
            return Err(exists());
        }
        Ok(cluster)
    }

    /// First cluster matching `filters`, or `ClusterNotFound`.
    pub async fn cluster_get(&self, ctx: &RequestContext, filters: &ClusterFilters) -> Result<ClusterView> {
        self.cluster_get_all(ctx, filters)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::ClusterNotFound(describe(filters)))
    }

    /// Every cluster matching `filters`, ordered by name then race_preventer.
    ///
    /// Summary aggregates are computed from the member services on each call;
    /// nothing derived is stored on the cluster row.
    pub async fn cluster_get_all(&self, ctx: &RequestContext, filters: &ClusterFilters) -> Result<Vec<ClusterView>> {
        self.require_admin(ctx, "cluster_get_all")?;
        let prefix = match &filters.name {
            Some(name) => name_prefix(name),
            None => CLUSTERS_PREFIX.to_string(),
        };
        let clusters: Vec<Cluster> = list_json::<Cluster, _>(self.store.as_ref(), &prefix)
            .await?
            .into_iter()
            .map(|(_, cluster)| cluster)
            .filter(|c| matches_row(c, filters))
            .collect();
        if clusters.is_empty() {
            return Ok(Vec::new());
        }

        let members = if filters.needs_summary() || filters.services {
            self.members_by_cluster().await?
        } else {
            HashMap::new()
        };
        let now = Utc::now();

        let mut views = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            // A tombstone's name may belong to a newer live cluster whose
            // members are not its own.
            if cluster.deleted {
                if matches_summary(&ClusterSummary::default(), filters) {
                    views.push(ClusterView {
                        cluster,
                        summary: None,
                        services: None,
                    });
                }
                continue;
            }
            let services = members.get(&cluster.name).cloned().unwrap_or_default();
            let summary = summarize(&services, now, self.down_time);
            if !matches_summary(&summary, filters) {
                continue;
            }
            views.push(ClusterView {
                summary: filters.services_summary.then_some(summary),
                services: filters.services.then_some(services),
                cluster,
            });
        }
        Ok(views)
    }

    /// Non-deleted services grouped by the cluster they reference.
    async fn members_by_cluster(&self) -> Result<HashMap<String, Vec<Service>>> {
        let mut members: HashMap<String, Vec<Service>> = HashMap::new();
        for service in self.list_services(&ServiceFilters::default()).await? {
            if let Some(name) = service.cluster_name.clone() {
                members.entry(name).or_default().push(service);
            }
        }
        Ok(members)
    }

    async fn live_cluster_by_id(&self, id: i64) -> Result<(String, Cluster)> {
        list_json::<Cluster, _>(self.store.as_ref(), CLUSTERS_PREFIX)
            .await?
            .into_iter()
            .find(|(_, c)| c.id == id && !c.deleted)
            .ok_or_else(|| ClusterError::ClusterNotFound(format!("id={}", id)))
    }

    pub async fn cluster_update(&self, ctx: &RequestContext, id: i64, values: ClusterUpdate) -> Result<Cluster> {
        self.require_admin(ctx, "cluster_update")?;
        let _guard = self.write_lock.lock().await;
        let (key, mut cluster) = self.live_cluster_by_id(id).await?;
        if let Some(disabled) = values.disabled {
            cluster.disabled = disabled;
        }
        if let Some(reason) = values.disabled_reason {
            cluster.disabled_reason = reason;
        }
        cluster.updated_at = Utc::now();

        let (key, cluster) = (&key, &cluster);
        retry_transient(&self.retry, "cluster_update", move || async move {
            put_json(self.store.as_ref(), key, cluster).await
        })
        .await?;
        info!(
            "Updated cluster {} (disabled={})",
            cluster.name, cluster.disabled
        );
        Ok(cluster.clone())
    }

    /// Soft-delete a cluster, moving its row off the live slot.
    ///
    /// Refused with `ClusterHasHosts` while any non-deleted service still
    /// names the cluster.
    pub async fn cluster_destroy(&self, ctx: &RequestContext, id: i64) -> Result<Cluster> {
        self.require_admin(ctx, "cluster_destroy")?;
        let _guard = self.write_lock.lock().await;
        let (live_key, cluster) = self.live_cluster_by_id(id).await?;

        let filters = ServiceFilters {
            cluster_name: Some(cluster.name.clone()),
            ..Default::default()
        };
        let hosts = self.list_services(&filters).await?;
        if !hosts.is_empty() {
            warn!(
                "Refusing to destroy cluster {}: {} services still attached",
                cluster.name,
                hosts.len()
            );
            return Err(ClusterError::ClusterHasHosts { name: cluster.name });
        }

        let now = Utc::now();
        let tombstone = Cluster {
            race_preventer: cluster.id,
            deleted: true,
            deleted_at: Some(now),
            updated_at: now,
            ..cluster
        };
        let tomb_key = cluster_key(&tombstone.name, tombstone.race_preventer);

        // Tombstone first: a failure in between leaves the live row in place.
        let (live_key, tomb_key, record) = (&live_key, &tomb_key, &tombstone);
        retry_transient(&self.retry, "cluster_destroy", move || async move {
            put_json(self.store.as_ref(), tomb_key, record).await?;
            self.store.delete(live_key).await
        })
        .await?;
        info!("Destroyed cluster {} (id={})", tombstone.name, tombstone.id);
        Ok(tombstone)
    }

    /// Tombstoned rows of a name, newest first.
    pub async fn cluster_history(&self, ctx: &RequestContext, name: &str) -> Result<Vec<Cluster>> {
        let filters = ClusterFilters {
            name: Some(name.to_string()),
            read_deleted: ReadDeleted::Only,
            ..Default::default()
        };
        let mut rows: Vec<Cluster> = self
            .cluster_get_all(ctx, &filters)
            .await?
            .into_iter()
            .map(|v| v.cluster)
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    pub(crate) async fn load_cluster(&self, name: &str) -> Result<Option<Cluster>> {
        Ok(get_json(self.store.as_ref(), &cluster_key(name, LIVE_RACE_PREVENTER)).await?)
    }
}

fn matches_row(cluster: &Cluster, filters: &ClusterFilters) -> bool {
    filters.read_deleted.admits(cluster.deleted)
        && filters.id.is_none_or(|id| cluster.id == id)
        && filters.name.as_ref().is_none_or(|n| &cluster.name == n)
        && filters.binary.as_ref().is_none_or(|b| &cluster.binary == b)
        && filters.disabled.is_none_or(|d| cluster.disabled == d)
}

fn matches_summary(summary: &ClusterSummary, filters: &ClusterFilters) -> bool {
    filters.is_up.is_none_or(|up| summary.is_up() == up)
        && filters.num_hosts.is_none_or(|n| summary.num_hosts == n)
        && filters
            .num_down_hosts
            .is_none_or(|n| summary.num_down_hosts == n)
}

pub(crate) fn summarize(
    services: &[Service],
    now: chrono::DateTime<Utc>,
    down_time: Duration,
) -> ClusterSummary {
    ClusterSummary {
        num_hosts: services.len(),
        num_down_hosts: services.iter().filter(|s| !s.is_up(now, down_time)).count(),
        last_heartbeat: services.iter().map(|s| s.last_heartbeat).max(),
    }
}

fn describe(filters: &ClusterFilters) -> String {
    match (&filters.name, filters.id) {
        (Some(name), _) => name.clone(),
        (None, Some(id)) => format!("id={}", id),
        (None, None) => "matching filters".to_string(),
    }
}
