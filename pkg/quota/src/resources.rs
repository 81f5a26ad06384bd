//! Reservable resources and the sync callbacks that recompute their usage.
//!
//! A resource's cached `in_use` counter can drift from the truth (crashed
//! workers, manual cleanup). Each resource carries a [`ResourceSyncer`] that
//! counts the live objects directly, and the ledger consults it whenever the
//! refresh policy says the cached value can no longer be trusted.

use async_trait::async_trait;
use pkg_constants::quota::{
    RESOURCE_BACKUP_GIGABYTES, RESOURCE_BACKUPS, RESOURCE_GIGABYTES, RESOURCE_GROUPS,
    RESOURCE_SNAPSHOTS, RESOURCE_VOLUMES,
};
use pkg_types::context::RequestContext;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Recomputes the authoritative usage of one resource for a project.
#[async_trait]
pub trait ResourceSyncer: Send + Sync {
    async fn current_usage(&self, ctx: &RequestContext, project_id: &str) -> anyhow::Result<i64>;
}

/// Totals of one kind of live object for a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectTotals {
    pub count: i64,
    pub gigabytes: i64,
}

/// The kinds of object whose live totals feed the stock syncers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Volume,
    Snapshot,
    Backup,
    Group,
}

/// Source of truth for live objects (the volume/snapshot/backup tables).
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Totals for `kind` in `project_id`, restricted to `volume_type` when given.
    async fn totals(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        kind: ObjectKind,
        volume_type: Option<&str>,
    ) -> anyhow::Result<ObjectTotals>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measure {
    Count,
    Gigabytes,
}

/// Stock syncer: one measure of one object kind, optionally per volume type.
pub struct SourceSyncer {
    source: Arc<dyn UsageSource>,
    kind: ObjectKind,
    measure: Measure,
    volume_type: Option<String>,
}

impl SourceSyncer {
    pub fn new(
        source: Arc<dyn UsageSource>,
        kind: ObjectKind,
        measure: Measure,
        volume_type: Option<&str>,
    ) -> Self {
        Self {
            source,
            kind,
            measure,
            volume_type: volume_type.map(str::to_string),
        }
    }
}

#[async_trait]
impl ResourceSyncer for SourceSyncer {
    async fn current_usage(&self, ctx: &RequestContext, project_id: &str) -> anyhow::Result<i64> {
        let totals = self
            .source
            .totals(ctx, project_id, self.kind, self.volume_type.as_deref())
            .await?;
        Ok(match self.measure {
            Measure::Count => totals.count,
            Measure::Gigabytes => totals.gigabytes,
        })
    }
}

/// A named resource that can be reserved against.
#[derive(Clone)]
pub struct ReservableResource {
    pub name: String,
    pub syncer: Arc<dyn ResourceSyncer>,
}

impl std::fmt::Debug for ReservableResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservableResource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Name of the per-type variant of a resource, e.g. `gigabytes_ssd`.
pub fn volume_type_resource(base: &str, volume_type: &str) -> String {
    format!("{}_{}", base, volume_type)
}

/// Resource name → descriptor.
#[derive(Clone, Default, Debug)]
pub struct ResourceRegistry {
    resources: BTreeMap<String, ReservableResource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in volume, snapshot, backup and group resources.
    pub fn standard(source: Arc<dyn UsageSource>) -> Self {
        let mut registry = Self::new();
        let stock = [
            (RESOURCE_VOLUMES, ObjectKind::Volume, Measure::Count),
            (RESOURCE_GIGABYTES, ObjectKind::Volume, Measure::Gigabytes),
            (RESOURCE_SNAPSHOTS, ObjectKind::Snapshot, Measure::Count),
            (RESOURCE_BACKUPS, ObjectKind::Backup, Measure::Count),
            (RESOURCE_BACKUP_GIGABYTES, ObjectKind::Backup, Measure::Gigabytes),
            (RESOURCE_GROUPS, ObjectKind::Group, Measure::Count),
        ];
        for (name, kind, measure) in stock {
            registry.register(
                name,
                Arc::new(SourceSyncer::new(source.clone(), kind, measure, None)),
            );
        }
        registry
    }

    pub fn register(&mut self, name: &str, syncer: Arc<dyn ResourceSyncer>) {
        self.resources.insert(
            name.to_string(),
            ReservableResource {
                name: name.to_string(),
                syncer,
            },
        );
    }

    /// Add `volumes_<t>`, `gigabytes_<t>` and `snapshots_<t>` for a volume type.
    /// Returns the names registered.
    pub fn register_volume_type(&mut self, source: Arc<dyn UsageSource>, volume_type: &str) -> Vec<String> {
        let per_type = [
            (RESOURCE_VOLUMES, ObjectKind::Volume, Measure::Count),
            (RESOURCE_GIGABYTES, ObjectKind::Volume, Measure::Gigabytes),
            (RESOURCE_SNAPSHOTS, ObjectKind::Snapshot, Measure::Count),
        ];
        let mut names = Vec::with_capacity(per_type.len());
        for (base, kind, measure) in per_type {
            let name = volume_type_resource(base, volume_type);
            self.register(
                &name,
                Arc::new(SourceSyncer::new(
                    source.clone(),
                    kind,
                    measure,
                    Some(volume_type),
                )),
            );
            names.push(name);
        }
        names
    }

    pub fn get(&self, name: &str) -> Option<&ReservableResource> {
        self.resources.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
