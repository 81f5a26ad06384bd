use async_trait::async_trait;
use pkg_constants::quota::{
    RESOURCE_BACKUP_GIGABYTES, RESOURCE_BACKUPS, RESOURCE_GIGABYTES, RESOURCE_GROUPS,
    RESOURCE_SNAPSHOTS, RESOURCE_VOLUMES,
};
use pkg_quota::resources::volume_type_resource;
use pkg_quota::{ObjectKind, ObjectTotals, QuotaLedger, UsageSource};
use pkg_types::context::RequestContext;
use std::sync::Arc;

/// Usage source for deployments with no external object inventory: the
/// ledger's own committed `in_use` counters are taken as the truth.
///
/// A resync through this source reads back the value it is meant to check,
/// so `until_refresh` and `max_age` cannot correct drift here. The daemon
/// only sweeps and reports, and since resyncs run only inside a reservation
/// it never consults this source. Embedders that reserve must supply a
/// source that counts the real objects.
pub struct LedgerUsageSource {
    ledger: Arc<QuotaLedger>,
}

impl LedgerUsageSource {
    pub fn new(ledger: Arc<QuotaLedger>) -> Self {
        Self { ledger }
    }
}

/// Resource names carrying the count and the size of an object kind.
fn resource_names(kind: ObjectKind, volume_type: Option<&str>) -> (String, Option<String>) {
    let (count, size) = match kind {
        ObjectKind::Volume => (RESOURCE_VOLUMES, Some(RESOURCE_GIGABYTES)),
        ObjectKind::Snapshot => (RESOURCE_SNAPSHOTS, None),
        ObjectKind::Backup => (RESOURCE_BACKUPS, Some(RESOURCE_BACKUP_GIGABYTES)),
        ObjectKind::Group => (RESOURCE_GROUPS, None),
    };
    match volume_type {
        Some(t) => (
            volume_type_resource(count, t),
            size.map(|s| volume_type_resource(s, t)),
        ),
        None => (count.to_string(), size.map(str::to_string)),
    }
}

#[async_trait]
impl UsageSource for LedgerUsageSource {
    async fn totals(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        kind: ObjectKind,
        volume_type: Option<&str>,
    ) -> anyhow::Result<ObjectTotals> {
        let usages = self
            .ledger
            .quota_usage_get_all_by_project(ctx, project_id)
            .await?;
        let (count, size) = resource_names(kind, volume_type);
        let in_use = |name: &str| usages.get(name).map(|u| u.in_use).unwrap_or(0);
        Ok(ObjectTotals {
            count: in_use(&count),
            gigabytes: size.as_deref().map(in_use).unwrap_or(0),
        })
    }
}
