//! The quota/reservation ledger.
//!
//! Every project's usage rows and outstanding reservations live in one
//! [`ProjectLedger`] document. Mutations take the project's lock, reload the
//! document, validate, and write it back with a single put, so a reservation
//! batch or a settlement is either fully visible or not at all. The write-back
//! is a compare-and-put against the bytes that were read, so a writer in
//! another process surfaces as a transient conflict. Transient store failures
//! rerun the whole read-modify-write under [`RetryPolicy`].

use chrono::{DateTime, Utc};
use pkg_constants::state::{QUOTA_LEDGERS_PREFIX, QUOTA_LIMITS_PREFIX};
use pkg_metrics::MetricsRegistry;
use pkg_state::kv::{compare_and_put_json, get_json, get_json_versioned, list_json};
use pkg_state::{KvStore, RetryPolicy, retry_transient};
use pkg_types::context::RequestContext;
use pkg_types::quota::{
    HardLimit, ProjectLedger, QuotaUsage, Reservation, ReservationState, UsageTotals,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OverQuota, OverQuotaResource, QuotaError, Result};
use crate::resources::ResourceRegistry;

pub const METRIC_RESERVATIONS: &str = "quota_reservations_total";
pub const METRIC_SETTLEMENTS: &str = "quota_settlements_total";
pub const METRIC_OVER_QUOTA: &str = "quota_over_quota_total";
pub const METRIC_REFRESHES: &str = "quota_usage_refresh_total";
pub const METRIC_OUTSTANDING: &str = "quota_outstanding_reservations";

/// When a cached `in_use` must be recomputed before it is trusted.
#[derive(Debug, Clone, Copy)]
pub struct ReservePolicy {
    /// Absolute time after which an unsettled reservation is abandoned.
    pub expire: DateTime<Utc>,
    /// Reservations allowed before a forced resync; `0` disables the countdown.
    pub until_refresh: i64,
    /// Resync rows at least this old; zero disables age-based refresh.
    pub max_age: Duration,
}

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Per-project async locks. An entry lives while some task holds or waits
/// on it and is dropped with the last guard.
#[derive(Default)]
struct ProjectLocks {
    locks: Arc<StdMutex<LockMap>>,
}

impl ProjectLocks {
    async fn lock(&self, project_id: &str) -> ProjectGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(project_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        ProjectGuard {
            guard: Some(guard),
            lock,
            project_id: project_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct ProjectGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    project_id: String,
    locks: Arc<StdMutex<LockMap>>,
}

impl Drop for ProjectGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and this guard still reference the lock.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.project_id);
        }
    }
}

pub(crate) fn ledger_key(project_id: &str) -> String {
    format!("{}{}", QUOTA_LEDGERS_PREFIX, project_id)
}

pub(crate) fn limits_prefix(project_id: &str) -> String {
    format!("{}{}/", QUOTA_LIMITS_PREFIX, project_id)
}

pub struct QuotaLedger {
    pub(crate) store: Arc<dyn KvStore>,
    locks: ProjectLocks,
    pub(crate) retry: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn KvStore>, retry: RetryPolicy, metrics: Arc<MetricsRegistry>) -> Self {
        metrics.register_counter(METRIC_RESERVATIONS, "Reservations created");
        metrics.register_counter(METRIC_SETTLEMENTS, "Reservations settled, by outcome");
        metrics.register_counter(METRIC_OVER_QUOTA, "Reservation batches rejected over quota");
        metrics.register_counter(METRIC_REFRESHES, "Usage rows resynced from their source");
        metrics.register_gauge(METRIC_OUTSTANDING, "Reservations awaiting settlement");
        Self {
            store,
            locks: ProjectLocks::default(),
            retry,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub(crate) fn authorize_project(&self, ctx: &RequestContext, project_id: &str) -> Result<()> {
        if ctx.can_access_project(project_id) {
            Ok(())
        } else {
            Err(QuotaError::NotAuthorized(format!(
                "project {} is not accessible from this context",
                project_id
            )))
        }
    }

    pub(crate) fn require_admin(&self, ctx: &RequestContext, what: &str) -> Result<()> {
        if ctx.is_admin {
            Ok(())
        } else {
            Err(QuotaError::NotAuthorized(format!("{} requires an admin context", what)))
        }
    }

    fn resolve_project<'a>(&self, ctx: &'a RequestContext, project_id: Option<&'a str>) -> Result<&'a str> {
        let project_id = ctx.resolve_project(project_id).ok_or_else(|| {
            QuotaError::NotAuthorized("no project given and the context has none".to_string())
        })?;
        self.authorize_project(ctx, project_id)?;
        Ok(project_id)
    }

    async fn load_ledger(&self, project_id: &str) -> Result<Option<ProjectLedger>> {
        Ok(get_json(self.store.as_ref(), &ledger_key(project_id)).await?)
    }

    /// Load a ledger for update, keeping the stored bytes for `save_ledger`.
    async fn load_ledger_for_update(&self, project_id: &str) -> Result<Option<(ProjectLedger, Vec<u8>)>> {
        Ok(get_json_versioned(self.store.as_ref(), &ledger_key(project_id)).await?)
    }

    /// Write a ledger back unless it changed since `read` was loaded.
    async fn save_ledger(&self, ledger: &ProjectLedger, read: Option<&[u8]>) -> Result<()> {
        let key = ledger_key(&ledger.project_id);
        if !compare_and_put_json(self.store.as_ref(), &key, read, ledger).await? {
            return Err(anyhow::anyhow!(
                "Ledger of project {} changed concurrently",
                ledger.project_id
            )
            .into());
        }
        Ok(())
    }

    async fn ledger_projects(&self) -> Result<Vec<String>> {
        let entries = self.store.list_prefix(QUOTA_LEDGERS_PREFIX).await?;
        Ok(entries
            .into_iter()
            .map(|(key, _)| key[QUOTA_LEDGERS_PREFIX.len()..].to_string())
            .collect())
    }

    /// Usage row of one resource.
    pub async fn quota_usage_get(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        resource: &str,
    ) -> Result<QuotaUsage> {
        self.authorize_project(ctx, project_id)?;
        self.load_ledger(project_id)
            .await?
            .and_then(|mut ledger| ledger.usages.remove(resource))
            .ok_or_else(|| QuotaError::QuotaUsageNotFound {
                project_id: project_id.to_string(),
            })
    }

    /// `{resource: {in_use, reserved}}` for every usage row of a project.
    pub async fn quota_usage_get_all_by_project(
        &self,
        ctx: &RequestContext,
        project_id: &str,
    ) -> Result<BTreeMap<String, UsageTotals>> {
        self.authorize_project(ctx, project_id)?;
        Ok(self
            .load_ledger(project_id)
            .await?
            .map(|ledger| ledger.totals())
            .unwrap_or_default())
    }

    /// Outstanding reservations of a project, oldest first.
    pub async fn reservation_get_all_by_project(
        &self,
        ctx: &RequestContext,
        project_id: &str,
    ) -> Result<Vec<Reservation>> {
        self.authorize_project(ctx, project_id)?;
        let mut reservations: Vec<Reservation> = self
            .load_ledger(project_id)
            .await?
            .map(|ledger| ledger.reservations.into_values().collect())
            .unwrap_or_default();
        reservations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uuid.cmp(&b.uuid)));
        Ok(reservations)
    }

    /// Validate `deltas` against `quotas` and, if every resource fits, record
    /// one reservation per resource. Returns the reservation uuids.
    ///
    /// Either all resources are reserved or none are; a rejection names every
    /// offending resource.
    pub async fn quota_reserve(
        &self,
        ctx: &RequestContext,
        resources: &ResourceRegistry,
        quotas: &BTreeMap<String, HardLimit>,
        deltas: &BTreeMap<String, i64>,
        policy: ReservePolicy,
        project_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let project_id = self.resolve_project(ctx, project_id)?;

        let mut unknown: Vec<String> = deltas
            .keys()
            .filter(|res| !resources.contains(res) || !quotas.contains_key(*res))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            return Err(QuotaError::UnknownResources(unknown));
        }

        let _guard = self.locks.lock(project_id).await;
        retry_transient(&self.retry, "quota_reserve", move || {
            self.reserve_locked(ctx, resources, quotas, deltas, policy, project_id)
        })
        .await
    }

    async fn reserve_locked(
        &self,
        ctx: &RequestContext,
        resources: &ResourceRegistry,
        quotas: &BTreeMap<String, HardLimit>,
        deltas: &BTreeMap<String, i64>,
        policy: ReservePolicy,
        project_id: &str,
    ) -> Result<Vec<String>> {
        let now = Utc::now();
        let elevated = ctx.elevated();
        let until_refresh = (policy.until_refresh > 0).then_some(policy.until_refresh);
        let (mut ledger, read) = match self.load_ledger_for_update(project_id).await? {
            Some((ledger, raw)) => (ledger, Some(raw)),
            None => (ProjectLedger::new(project_id), None),
        };

        for resource in deltas.keys() {
            let refresh = match ledger.usages.get_mut(resource) {
                None => {
                    ledger.usages.insert(
                        resource.clone(),
                        QuotaUsage {
                            id: Uuid::new_v4().to_string(),
                            project_id: project_id.to_string(),
                            resource: resource.clone(),
                            in_use: 0,
                            reserved: 0,
                            until_refresh,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                    true
                }
                Some(usage) if usage.in_use < 0 => true,
                Some(usage) => match usage.until_refresh.as_mut() {
                    Some(countdown) => {
                        *countdown -= 1;
                        *countdown <= 0
                    }
                    None => {
                        !policy.max_age.is_zero()
                            && now
                                .signed_duration_since(usage.updated_at)
                                .to_std()
                                .unwrap_or_default()
                                >= policy.max_age
                    }
                },
            };

            if refresh {
                // Checked by the caller before taking the lock.
                let Some(descriptor) = resources.get(resource) else {
                    continue;
                };
                let in_use = descriptor
                    .syncer
                    .current_usage(&elevated, project_id)
                    .await
                    .map_err(|e| e.context(format!("syncing {} usage for {}", resource, project_id)))?;
                if let Some(usage) = ledger.usages.get_mut(resource) {
                    debug!(
                        "Resynced {} usage for project {}: {} -> {}",
                        resource, project_id, usage.in_use, in_use
                    );
                    usage.in_use = in_use.max(0);
                    usage.until_refresh = until_refresh;
                    usage.updated_at = now;
                }
                self.metrics
                    .counter_inc(METRIC_REFRESHES, &[("resource", resource.as_str())]);
            }
        }

        let mut overs = Vec::new();
        for (resource, &delta) in deltas {
            let (Some(usage), Some(limit)) = (ledger.usages.get(resource), quotas.get(resource)) else {
                continue;
            };
            if delta < 0 && usage.in_use.saturating_add(delta) < 0 {
                warn!(
                    "Change will make usage less than 0 for project {} resource {}: in_use={}, delta={}",
                    project_id, resource, usage.in_use, delta
                );
            }
            if delta < 0 {
                continue;
            }
            let Some(requested_total) = delta.checked_add(usage.total()) else {
                return Err(QuotaError::InvalidQuotaValue {
                    resource: resource.clone(),
                    reason: format!(
                        "delta {} on top of {} in use and {} reserved overflows",
                        delta, usage.in_use, usage.reserved
                    ),
                });
            };
            if !limit.admits(requested_total) {
                overs.push(OverQuotaResource {
                    resource: resource.clone(),
                    requested: delta,
                    in_use: usage.in_use,
                    reserved: usage.reserved,
                    limit: *limit,
                });
            }
        }

        if !overs.is_empty() {
            let err = OverQuota {
                project_id: project_id.to_string(),
                overs,
            };
            warn!("{}", err);
            self.metrics.counter_inc(METRIC_OVER_QUOTA, &[]);
            return Err(err.into());
        }

        let mut ids = Vec::with_capacity(deltas.len());
        let mut reservations = Vec::with_capacity(deltas.len());
        for (resource, &delta) in deltas {
            let Some(usage) = ledger.usages.get_mut(resource) else {
                continue;
            };
            let reservation = Reservation {
                uuid: Uuid::new_v4().to_string(),
                usage_id: usage.id.clone(),
                project_id: project_id.to_string(),
                resource: resource.clone(),
                delta,
                expire: policy.expire,
                created_at: now,
            };
            usage.reserved = usage.reserved.saturating_add(reservation.held());
            usage.updated_at = now;
            ids.push(reservation.uuid.clone());
            reservations.push(reservation);
        }
        for reservation in reservations {
            ledger
                .reservations
                .insert(reservation.uuid.clone(), reservation);
        }

        self.save_ledger(&ledger, read.as_deref()).await?;

        self.metrics
            .counter_add(METRIC_RESERVATIONS, &[], ids.len() as u64);
        self.metrics
            .gauge_add(METRIC_OUTSTANDING, &[], ids.len() as i64);
        debug!(
            "Reserved {:?} for project {} ({} reservations)",
            deltas,
            project_id,
            ids.len()
        );
        Ok(ids)
    }

    /// Fold reservations into `in_use`. Unknown or already settled ids are ignored.
    pub async fn reservation_commit(
        &self,
        ctx: &RequestContext,
        reservation_ids: &[String],
        project_id: Option<&str>,
    ) -> Result<()> {
        self.settle_ids(ctx, reservation_ids, project_id, ReservationState::Committed)
            .await
    }

    /// Release reservations without touching `in_use`. Unknown or already
    /// settled ids are ignored.
    pub async fn reservation_rollback(
        &self,
        ctx: &RequestContext,
        reservation_ids: &[String],
        project_id: Option<&str>,
    ) -> Result<()> {
        self.settle_ids(ctx, reservation_ids, project_id, ReservationState::RolledBack)
            .await
    }

    /// Roll back every outstanding reservation whose expiry has passed.
    /// Returns how many were reclaimed.
    pub async fn reservation_expire(&self, ctx: &RequestContext) -> Result<usize> {
        self.require_admin(ctx, "reservation_expire")?;
        let now = Utc::now();
        let mut reclaimed = 0;
        for project_id in self.ledger_projects().await? {
            let project_id = project_id.as_str();
            let _guard = self.locks.lock(project_id).await;
            reclaimed += retry_transient(&self.retry, "reservation_expire", move || {
                self.settle_locked(project_id, ReservationState::Expired, move |r| {
                    r.is_expired(now)
                })
            })
            .await?;
        }
        if reclaimed > 0 {
            info!("Expired {} stale reservations", reclaimed);
        }
        Ok(reclaimed)
    }

    async fn settle_ids(
        &self,
        ctx: &RequestContext,
        reservation_ids: &[String],
        project_id: Option<&str>,
        outcome: ReservationState,
    ) -> Result<()> {
        if reservation_ids.is_empty() {
            return Ok(());
        }
        let projects = match ctx.resolve_project(project_id) {
            Some(project_id) => {
                self.authorize_project(ctx, project_id)?;
                vec![project_id.to_string()]
            }
            None => {
                self.require_admin(ctx, "settling reservations without a project")?;
                self.ledger_projects().await?
            }
        };

        let mut settled = 0;
        for project_id in &projects {
            let project_id = project_id.as_str();
            let _guard = self.locks.lock(project_id).await;
            settled += retry_transient(&self.retry, "reservation settlement", move || {
                self.settle_locked(project_id, outcome, move |r| {
                    reservation_ids.iter().any(|id| *id == r.uuid)
                })
            })
            .await?;
        }
        if settled < reservation_ids.len() {
            debug!(
                "{} of {} reservations were already settled or unknown",
                reservation_ids.len() - settled,
                reservation_ids.len()
            );
        }
        Ok(())
    }

    /// Remove the reservations matching `select` from a project's ledger and
    /// apply `outcome` to their usage rows. Caller holds the project lock.
    async fn settle_locked<F>(&self, project_id: &str, outcome: ReservationState, select: F) -> Result<usize>
    where
        F: Fn(&Reservation) -> bool,
    {
        let Some((mut ledger, read)) = self.load_ledger_for_update(project_id).await? else {
            return Ok(0);
        };
        let selected: Vec<String> = ledger
            .reservations
            .values()
            .filter(|r| select(r))
            .map(|r| r.uuid.clone())
            .collect();
        if selected.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        for uuid in &selected {
            let Some(reservation) = ledger.reservations.remove(uuid) else {
                continue;
            };
            match ledger.usages.get_mut(&reservation.resource) {
                Some(usage) => {
                    usage.reserved = usage.reserved.saturating_sub(reservation.held()).max(0);
                    if outcome == ReservationState::Committed {
                        let in_use = usage.in_use.saturating_add(reservation.delta);
                        if in_use < 0 {
                            warn!(
                                "Commit of {} would make {} usage negative for project {} ({}); clamping to 0",
                                reservation.uuid, reservation.resource, project_id, in_use
                            );
                        }
                        usage.in_use = in_use.max(0);
                    }
                    usage.updated_at = now;
                }
                None => warn!(
                    "Reservation {} references missing {} usage for project {}",
                    reservation.uuid, reservation.resource, project_id
                ),
            }
            debug!(
                "Reservation {} ({} {:+}) {}",
                reservation.uuid, reservation.resource, reservation.delta, outcome
            );
        }

        self.save_ledger(&ledger, Some(read.as_slice())).await?;

        let label = outcome.to_string();
        self.metrics.counter_add(
            METRIC_SETTLEMENTS,
            &[("outcome", label.as_str())],
            selected.len() as u64,
        );
        self.metrics
            .gauge_add(METRIC_OUTSTANDING, &[], -(selected.len() as i64));
        Ok(selected.len())
    }

    /// Remove every limit, usage row and outstanding reservation of a project.
    pub async fn quota_destroy_by_project(&self, ctx: &RequestContext, project_id: &str) -> Result<()> {
        self.require_admin(ctx, "quota_destroy_by_project")?;
        let _guard = self.locks.lock(project_id).await;
        retry_transient(&self.retry, "quota_destroy_by_project", move || async move {
            let limits = self.store.list_prefix(&limits_prefix(project_id)).await?;
            for (key, _) in limits {
                self.store.delete(&key).await?;
            }
            let outstanding = self
                .load_ledger(project_id)
                .await?
                .map(|ledger| ledger.reservations.len())
                .unwrap_or(0);
            self.store.delete(&ledger_key(project_id)).await?;
            if outstanding > 0 {
                self.metrics
                    .gauge_add(METRIC_OUTSTANDING, &[], -(outstanding as i64));
            }
            Ok::<_, QuotaError>(())
        })
        .await?;
        info!("Destroyed all quota state for project {}", project_id);
        Ok(())
    }

    /// Outstanding reservations across all projects, for rebuilding the gauge
    /// after a restart.
    pub async fn count_outstanding(&self) -> Result<usize> {
        let ledgers: Vec<(String, ProjectLedger)> =
            list_json(self.store.as_ref(), QUOTA_LEDGERS_PREFIX).await?;
        let total = ledgers.iter().map(|(_, l)| l.reservations.len()).sum();
        self.metrics.gauge_set(METRIC_OUTSTANDING, &[], total as i64);
        Ok(total)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::ResourceSyncer;
    use async_trait::async_trait;
    use pkg_state::MemoryStore;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    /// Syncer returning a settable value and counting its invocations.
    #[derive(Default)]
    pub struct FixedSyncer {
        pub value: AtomicI64,
        pub calls: AtomicU32,
    }

    #[async_trait]
    impl ResourceSyncer for FixedSyncer {
        async fn current_usage(&self, _ctx: &RequestContext, _project_id: &str) -> anyhow::Result<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.load(Ordering::SeqCst))
        }
    }

    pub fn make_ledger(store: Arc<MemoryStore>) -> QuotaLedger {
        QuotaLedger::new(
            store,
            RetryPolicy {
                max_attempts: 3,
                interval: Duration::ZERO,
            },
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn registry(names: &[&str]) -> (ResourceRegistry, Arc<FixedSyncer>) {
        let syncer = Arc::new(FixedSyncer::default());
        let mut registry = ResourceRegistry::new();
        for name in names {
            registry.register(name, syncer.clone());
        }
        (registry, syncer)
    }

    fn map<V: Copy>(pairs: &[(&str, V)]) -> BTreeMap<String, V> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn limits(pairs: &[(&str, i64)]) -> BTreeMap<String, HardLimit> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), HardLimit::new(*v)))
            .collect()
    }

    fn policy() -> ReservePolicy {
        ReservePolicy {
            expire: Utc::now() + chrono::Duration::days(1),
            until_refresh: 0,
            max_age: Duration::ZERO,
        }
    }

    fn totals(in_use: i64, reserved: i64) -> UsageTotals {
        UsageTotals { in_use, reserved }
    }

    struct Fixture {
        ledger: QuotaLedger,
        registry: ResourceRegistry,
        quotas: BTreeMap<String, HardLimit>,
        ctx: RequestContext,
    }

    fn fixture() -> Fixture {
        let (registry, _) = registry(&["volumes", "gigabytes"]);
        Fixture {
            ledger: make_ledger(Arc::new(MemoryStore::new())),
            registry,
            quotas: limits(&[("volumes", 1), ("gigabytes", 2)]),
            ctx: RequestContext::for_project("p1", "alice"),
        }
    }

    impl Fixture {
        async fn reserve(&self, deltas: &[(&str, i64)]) -> Result<Vec<String>> {
            self.ledger
                .quota_reserve(
                    &self.ctx,
                    &self.registry,
                    &self.quotas,
                    &map(deltas),
                    policy(),
                    None,
                )
                .await
        }

        async fn usage(&self) -> BTreeMap<String, UsageTotals> {
            self.ledger
                .quota_usage_get_all_by_project(&self.ctx, "p1")
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_reserve_then_commit() {
        let f = fixture();
        let ids = f.reserve(&[("volumes", 1), ("gigabytes", 2)]).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(
            f.usage().await,
            map(&[("gigabytes", totals(0, 2)), ("volumes", totals(0, 1))])
        );

        f.ledger
            .reservation_commit(&f.ctx, &ids, Some("p1"))
            .await
            .unwrap();
        assert_eq!(
            f.usage().await,
            map(&[("gigabytes", totals(2, 0)), ("volumes", totals(1, 0))])
        );
        assert_eq!(
            f.ledger
                .metrics()
                .counter_value(METRIC_SETTLEMENTS, &[("outcome", "committed")]),
            2
        );
    }

    #[tokio::test]
    async fn test_reserve_then_rollback() {
        let f = fixture();
        let ids = f.reserve(&[("volumes", 1), ("gigabytes", 2)]).await.unwrap();
        f.ledger
            .reservation_rollback(&f.ctx, &ids, None)
            .await
            .unwrap();
        assert_eq!(
            f.usage().await,
            map(&[("gigabytes", totals(0, 0)), ("volumes", totals(0, 0))])
        );
        assert!(
            f.ledger
                .reservation_get_all_by_project(&f.ctx, "p1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let f = fixture();
        let ids = f.reserve(&[("volumes", 1)]).await.unwrap();
        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();
        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();
        f.ledger.reservation_rollback(&f.ctx, &ids, None).await.unwrap();
        f.ledger
            .reservation_commit(&f.ctx, &["no-such-id".to_string()], None)
            .await
            .unwrap();
        assert_eq!(f.usage().await["volumes"], totals(1, 0));
    }

    #[tokio::test]
    async fn test_over_quota_is_all_or_nothing() {
        let f = fixture();
        let err = f
            .reserve(&[("volumes", 1), ("gigabytes", 3)])
            .await
            .unwrap_err();
        match err {
            QuotaError::OverQuota(over) => {
                assert_eq!(over.resources(), vec!["gigabytes"]);
                let g = over.get("gigabytes").unwrap();
                assert_eq!(g.requested, 3);
                assert_eq!(g.limit, HardLimit::new(2));
                assert_eq!(g.remaining(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.usage().await.is_empty());
        assert_eq!(f.ledger.metrics().counter_value(METRIC_OVER_QUOTA, &[]), 1);
    }

    #[tokio::test]
    async fn test_over_quota_names_every_resource() {
        let f = fixture();
        f.reserve(&[("volumes", 1), ("gigabytes", 2)]).await.unwrap();
        let err = f
            .reserve(&[("volumes", 1), ("gigabytes", 1)])
            .await
            .unwrap_err();
        let QuotaError::OverQuota(over) = err else {
            panic!("expected over quota");
        };
        assert_eq!(over.resources(), vec!["gigabytes", "volumes"]);
        assert_eq!(over.get("volumes").unwrap().reserved, 1);
        assert_eq!(f.usage().await["volumes"], totals(0, 1));
    }

    #[tokio::test]
    async fn test_unlimited_and_releases_are_not_checked() {
        let mut f = fixture();
        f.quotas = limits(&[("volumes", -1), ("gigabytes", 0)]);
        f.reserve(&[("volumes", 1000)]).await.unwrap();
        // Releases always pass, even against a zero limit.
        let ids = f.reserve(&[("gigabytes", -5)]).await.unwrap();
        assert_eq!(f.usage().await["gigabytes"], totals(0, 0));
        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();
        assert_eq!(f.usage().await["gigabytes"], totals(0, 0));
    }

    #[tokio::test]
    async fn test_unknown_resource_is_rejected() {
        let f = fixture();
        let err = f.reserve(&[("volumes", 1), ("widgets", 1)]).await.unwrap_err();
        assert!(matches!(err, QuotaError::UnknownResources(ref r) if r == &vec!["widgets".to_string()]));
        assert!(f.usage().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_project_is_not_authorized() {
        let f = fixture();
        let err = f
            .ledger
            .quota_reserve(
                &f.ctx,
                &f.registry,
                &f.quotas,
                &map(&[("volumes", 1)]),
                policy(),
                Some("p2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::NotAuthorized(_)));
        assert!(
            f.ledger
                .reservation_expire(&f.ctx)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_expire_reclaims_like_rollback() {
        let f = fixture();
        let stale = f
            .ledger
            .quota_reserve(
                &f.ctx,
                &f.registry,
                &f.quotas,
                &map(&[("gigabytes", 1)]),
                ReservePolicy {
                    expire: Utc::now() - chrono::Duration::seconds(1),
                    ..policy()
                },
                None,
            )
            .await
            .unwrap();
        let fresh = f.reserve(&[("gigabytes", 1)]).await.unwrap();
        assert_eq!(f.usage().await["gigabytes"], totals(0, 2));

        let reclaimed = f
            .ledger
            .reservation_expire(&RequestContext::admin())
            .await
            .unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(f.usage().await["gigabytes"], totals(0, 1));

        // A late commit of the expired reservation is a no-op.
        f.ledger.reservation_commit(&f.ctx, &stale, None).await.unwrap();
        f.ledger.reservation_commit(&f.ctx, &fresh, None).await.unwrap();
        assert_eq!(f.usage().await["gigabytes"], totals(1, 0));
        assert_eq!(
            f.ledger
                .metrics()
                .counter_value(METRIC_SETTLEMENTS, &[("outcome", "expired")]),
            1
        );
    }

    #[tokio::test]
    async fn test_new_usage_rows_sync_from_source() {
        let (registry, syncer) = registry(&["volumes"]);
        syncer.value.store(1, Ordering::SeqCst);
        let ledger = make_ledger(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::for_project("p1", "alice");
        let quotas = limits(&[("volumes", 2)]);

        ledger
            .quota_reserve(&ctx, &registry, &quotas, &map(&[("volumes", 1)]), policy(), None)
            .await
            .unwrap();
        assert_eq!(syncer.calls.load(Ordering::SeqCst), 1);
        let usage = ledger.quota_usage_get(&ctx, "p1", "volumes").await.unwrap();
        assert_eq!(usage.in_use, 1);
        assert_eq!(usage.reserved, 1);

        // Cached row is trusted: no sync and the limit is now reached.
        let err = ledger
            .quota_reserve(&ctx, &registry, &quotas, &map(&[("volumes", 1)]), policy(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::OverQuota(_)));
        assert_eq!(syncer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_until_refresh_countdown_forces_sync() {
        let (registry, syncer) = registry(&["volumes"]);
        let ledger = make_ledger(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::for_project("p1", "alice");
        let quotas = limits(&[("volumes", 100)]);
        let policy = ReservePolicy {
            until_refresh: 2,
            ..policy()
        };

        for _ in 0..3 {
            let ids = ledger
                .quota_reserve(&ctx, &registry, &quotas, &map(&[("volumes", 1)]), policy, None)
                .await
                .unwrap();
            ledger.reservation_commit(&ctx, &ids, None).await.unwrap();
        }
        // First touch syncs, then 2 -> 1, then 1 -> 0 triggers a resync.
        assert_eq!(syncer.calls.load(Ordering::SeqCst), 2);
        let usage = ledger.quota_usage_get(&ctx, "p1", "volumes").await.unwrap();
        assert_eq!(usage.until_refresh, Some(2));
        // The resync saw 0 live volumes before the third commit.
        assert_eq!(usage.in_use, 1);
    }

    #[tokio::test]
    async fn test_max_age_forces_sync() {
        let (registry, syncer) = registry(&["volumes"]);
        let ledger = make_ledger(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::for_project("p1", "alice");
        let quotas = limits(&[("volumes", 100)]);
        let aged = ReservePolicy {
            max_age: Duration::from_nanos(1),
            ..policy()
        };

        ledger
            .quota_reserve(&ctx, &registry, &quotas, &map(&[("volumes", 1)]), policy(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        ledger
            .quota_reserve(&ctx, &registry, &quotas, &map(&[("volumes", 1)]), aged, None)
            .await
            .unwrap();
        assert_eq!(syncer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let f = Fixture {
            ledger: make_ledger(store.clone()),
            ..fixture()
        };
        store.fail_next_writes(2);
        let ids = f.reserve(&[("volumes", 1)]).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(f.usage().await["volumes"], totals(0, 1));

        store.fail_next_writes(5);
        let err = f.reserve(&[("gigabytes", 1)]).await.unwrap_err();
        assert!(matches!(err, QuotaError::Store(_)));
        assert_eq!(f.usage().await.get("gigabytes"), None);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_overcommit() {
        let (registry, _) = registry(&["gigabytes"]);
        let ledger = Arc::new(make_ledger(Arc::new(MemoryStore::new())));
        let registry = Arc::new(registry);
        let quotas = Arc::new(limits(&[("gigabytes", 10)]));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            let registry = registry.clone();
            let quotas = quotas.clone();
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::for_project("p1", "alice");
                ledger
                    .quota_reserve(&ctx, &registry, &quotas, &map(&[("gigabytes", 3)]), policy(), None)
                    .await
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        let ctx = RequestContext::for_project("p1", "alice");
        let usage = ledger.quota_usage_get(&ctx, "p1", "gigabytes").await.unwrap();
        assert_eq!(usage.total(), 9);
        assert_eq!(ledger.metrics().gauge_value(METRIC_OUTSTANDING, &[]), 3);
    }

    #[tokio::test]
    async fn test_destroy_by_project() {
        let f = fixture();
        f.reserve(&[("volumes", 1)]).await.unwrap();
        let admin = RequestContext::admin();
        f.ledger
            .quota_create(&admin, "p1", "volumes", HardLimit::new(5))
            .await
            .unwrap();
        assert!(f.ledger.quota_destroy_by_project(&f.ctx, "p1").await.is_err());
        f.ledger.quota_destroy_by_project(&admin, "p1").await.unwrap();
        assert!(f.usage().await.is_empty());
        assert!(
            f.ledger
                .quota_get_all_by_project(&admin, "p1")
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(f.ledger.count_outstanding().await.unwrap(), 0);
    }

    fn shared_ledger(store: Arc<MemoryStore>, max_attempts: u32) -> Arc<QuotaLedger> {
        Arc::new(QuotaLedger::new(
            store,
            RetryPolicy {
                max_attempts,
                interval: Duration::ZERO,
            },
            Arc::new(MetricsRegistry::new()),
        ))
    }

    #[tokio::test]
    async fn test_overflowing_reservation_is_rejected() {
        let mut f = fixture();
        f.quotas = limits(&[("volumes", -1), ("gigabytes", 10)]);
        f.reserve(&[("gigabytes", 1)]).await.unwrap();

        let err = f.reserve(&[("gigabytes", i64::MAX)]).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidQuotaValue { ref resource, .. } if resource == "gigabytes"));
        assert_eq!(f.usage().await["gigabytes"], totals(0, 1));

        // Unlimited resources still refuse a sum that does not fit in i64.
        let ids = f.reserve(&[("volumes", i64::MAX)]).await.unwrap();
        let err = f.reserve(&[("volumes", 1)]).await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidQuotaValue { .. }));
        assert_eq!(f.usage().await["volumes"], totals(0, i64::MAX));

        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();
        assert_eq!(f.usage().await["volumes"], totals(i64::MAX, 0));
    }

    #[tokio::test]
    async fn test_huge_delta_on_fresh_project_is_over_quota() {
        let f = fixture();
        let err = f.reserve(&[("gigabytes", i64::MAX)]).await.unwrap_err();
        let QuotaError::OverQuota(over) = err else {
            panic!("expected over quota");
        };
        let g = over.get("gigabytes").unwrap();
        assert_eq!(g.requested, i64::MAX);
        assert_eq!(g.remaining(), 2);
        assert!(f.usage().await.values().all(|t| t.reserved == 0));
    }

    #[tokio::test]
    async fn test_most_negative_delta_clamps_on_commit() {
        let f = fixture();
        let ids = f.reserve(&[("volumes", 1)]).await.unwrap();
        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();

        let ids = f.reserve(&[("volumes", i64::MIN)]).await.unwrap();
        assert_eq!(f.usage().await["volumes"], totals(1, 0));
        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();
        assert_eq!(f.usage().await["volumes"], totals(0, 0));
    }

    #[tokio::test]
    async fn test_commit_racing_expire_settles_once() {
        let store = Arc::new(MemoryStore::new());
        // Separate ledgers share only the store, like two server processes.
        let committer = shared_ledger(store.clone(), 3);
        let sweeper = shared_ledger(store, 3);
        let (registry, _) = registry(&["gigabytes"]);
        let quotas = limits(&[("gigabytes", -1)]);
        let ctx = RequestContext::for_project("p1", "alice");
        let admin = RequestContext::admin();
        let stale = ReservePolicy {
            expire: Utc::now() - chrono::Duration::seconds(1),
            ..policy()
        };

        let rounds = 20;
        for _ in 0..rounds {
            let ids = committer
                .quota_reserve(&ctx, &registry, &quotas, &map(&[("gigabytes", 1)]), stale, None)
                .await
                .unwrap();
            let commit = {
                let committer = committer.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { committer.reservation_commit(&ctx, &ids, None).await })
            };
            let expire = {
                let sweeper = sweeper.clone();
                let admin = admin.clone();
                tokio::spawn(async move { sweeper.reservation_expire(&admin).await })
            };
            commit.await.unwrap().unwrap();
            expire.await.unwrap().unwrap();
        }

        let committed = committer
            .metrics()
            .counter_value(METRIC_SETTLEMENTS, &[("outcome", "committed")]);
        let expired = sweeper
            .metrics()
            .counter_value(METRIC_SETTLEMENTS, &[("outcome", "expired")]);
        assert_eq!(committed + expired, rounds);

        let usage = committer.quota_usage_get(&ctx, "p1", "gigabytes").await.unwrap();
        assert_eq!(usage.in_use, committed as i64);
        assert_eq!(usage.reserved, 0);
        assert!(
            committer
                .reservation_get_all_by_project(&ctx, "p1")
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_ledgers_sharing_a_store_never_overcommit() {
        let store = Arc::new(MemoryStore::new());
        let ledgers = [shared_ledger(store.clone(), 50), shared_ledger(store, 50)];
        let (registry, _) = registry(&["gigabytes"]);
        let registry = Arc::new(registry);
        let quotas = Arc::new(limits(&[("gigabytes", 10)]));

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = ledgers[i % 2].clone();
            let registry = registry.clone();
            let quotas = quotas.clone();
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::for_project("p1", "alice");
                ledger
                    .quota_reserve(&ctx, &registry, &quotas, &map(&[("gigabytes", 3)]), policy(), None)
                    .await
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        let ctx = RequestContext::for_project("p1", "alice");
        let usage = ledgers[0].quota_usage_get(&ctx, "p1", "gigabytes").await.unwrap();
        assert_eq!(usage.total(), 9);
    }

    #[tokio::test]
    async fn test_project_locks_are_released() {
        let f = fixture();
        let ids = f.reserve(&[("volumes", 1)]).await.unwrap();
        f.ledger.reservation_commit(&f.ctx, &ids, None).await.unwrap();
        f.ledger.reservation_expire(&RequestContext::admin()).await.unwrap();
        assert_eq!(f.ledger.locks.len(), 0);

        let locks = Arc::new(ProjectLocks::default());
        let held = locks.lock("p1").await;
        let other = locks.lock("p2").await;
        assert_eq!(locks.len(), 2);
        drop(other);
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("p1").await;
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_admin_settles_without_project() {
        let f = fixture();
        let ids = f.reserve(&[("volumes", 1)]).await.unwrap();
        f.ledger
            .reservation_commit(&RequestContext::admin(), &ids, None)
            .await
            .unwrap();
        assert_eq!(f.usage().await["volumes"], totals(1, 0));
    }
}
