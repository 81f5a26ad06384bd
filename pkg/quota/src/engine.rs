//! Limit resolution on top of the ledger.
//!
//! Effective limit of a resource for a project, lowest precedence first:
//! 1. the configured default (unlimited for per-volume-type resources)
//! 2. the `default` quota class, when `use_default_quota_class` is set
//! 3. the caller's quota class
//! 4. the project's own override
//!
//! Per-volume-type resources (`gigabytes_<t>`) are independent keys: a
//! reservation carrying both `gigabytes` and `gigabytes_<t>` must fit both.

use chrono::{DateTime, Utc};
use pkg_constants::quota::{RESOURCE_GIGABYTES, RESOURCE_SNAPSHOTS, RESOURCE_VOLUMES};
use pkg_types::config::QuotaConfig;
use pkg_types::context::RequestContext;
use pkg_types::quota::{HardLimit, UsageTotals};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{OverQuota, OverQuotaResource, QuotaError, Result};
use crate::ledger::{QuotaLedger, ReservePolicy};
use crate::resources::{ResourceRegistry, UsageSource, volume_type_resource};

/// When a new reservation expires.
#[derive(Debug, Clone, Copy)]
pub enum Expiry {
    After(Duration),
    At(DateTime<Utc>),
}

/// Limit of a resource with, optionally, its current usage.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QuotaView {
    pub limit: HardLimit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageTotals>,
}

pub struct QuotaEngine {
    ledger: Arc<QuotaLedger>,
    source: Arc<dyn UsageSource>,
    resources: ResourceRegistry,
    config: QuotaConfig,
}

impl QuotaEngine {
    pub fn new(ledger: Arc<QuotaLedger>, source: Arc<dyn UsageSource>, config: QuotaConfig) -> Self {
        let resources = ResourceRegistry::standard(source.clone());
        Self {
            ledger,
            source,
            resources,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Make `volumes_<t>`, `gigabytes_<t>` and `snapshots_<t>` reservable.
    pub fn register_volume_type(&mut self, volume_type: &str) -> Vec<String> {
        self.resources
            .register_volume_type(self.source.clone(), volume_type)
    }

    /// Copy the volume/gigabyte/snapshot deltas onto their per-type keys.
    pub fn add_volume_type_opts(&self, deltas: &mut BTreeMap<String, i64>, volume_type: Option<&str>) {
        let Some(volume_type) = volume_type else {
            return;
        };
        for base in [RESOURCE_VOLUMES, RESOURCE_GIGABYTES, RESOURCE_SNAPSHOTS] {
            if let Some(&delta) = deltas.get(base) {
                let name = volume_type_resource(base, volume_type);
                if self.resources.contains(&name) {
                    deltas.insert(name, delta);
                }
            }
        }
    }

    /// Default limit of every known resource.
    pub async fn get_defaults(&self, ctx: &RequestContext) -> Result<BTreeMap<String, HardLimit>> {
        let configured = self.config.defaults();
        let mut defaults: BTreeMap<String, HardLimit> = configured
            .iter()
            .map(|(name, &limit)| (name.clone(), HardLimit::new(limit)))
            .collect();
        for name in self.resources.names() {
            defaults
                .entry(name.to_string())
                .or_insert(HardLimit::UNLIMITED);
        }
        if self.config.use_default_quota_class {
            let class_rows = self.ledger.quota_class_get_defaults(ctx).await?;
            overlay(&mut defaults, class_rows);
        }
        Ok(defaults)
    }

    /// Limits of a quota class, with defaults filled in for missing rows.
    pub async fn get_class_quotas(&self, ctx: &RequestContext, class_name: &str) -> Result<BTreeMap<String, HardLimit>> {
        let mut limits = self.get_defaults(ctx).await?;
        let class_rows = self.ledger.quota_class_get_all_by_name(ctx, class_name).await?;
        overlay(&mut limits, class_rows);
        Ok(limits)
    }

    /// Effective limit of every known resource for a project.
    pub async fn effective_limits(&self, ctx: &RequestContext, project_id: &str) -> Result<BTreeMap<String, HardLimit>> {
        let mut limits = match self.quota_class_for(ctx, project_id) {
            Some(class_name) => self.get_class_quotas(ctx, class_name).await?,
            None => self.get_defaults(ctx).await?,
        };
        let overrides = self.ledger.quota_get_all_by_project(ctx, project_id).await?;
        overlay(&mut limits, overrides);
        Ok(limits)
    }

    /// Effective limits of a project, with usage when `usages` is set.
    pub async fn get_project_quotas(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        usages: bool,
    ) -> Result<BTreeMap<String, QuotaView>> {
        let limits = self.effective_limits(ctx, project_id).await?;
        let totals = if usages {
            Some(
                self.ledger
                    .quota_usage_get_all_by_project(ctx, project_id)
                    .await?,
            )
        } else {
            None
        };
        Ok(limits
            .into_iter()
            .map(|(name, limit)| {
                let usage = totals
                    .as_ref()
                    .map(|t| t.get(&name).copied().unwrap_or_default());
                (name, QuotaView { limit, usage })
            })
            .collect())
    }

    /// Reserve `deltas` against the project's effective limits.
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        deltas: &BTreeMap<String, i64>,
        expiry: Option<Expiry>,
        project_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let project_id = ctx
            .resolve_project(project_id)
            .ok_or_else(|| QuotaError::NotAuthorized("no project to reserve against".to_string()))?;

        let now = Utc::now();
        let expire = match expiry.unwrap_or(Expiry::After(self.config.reservation_expire())) {
            Expiry::After(d) => {
                let d = chrono::Duration::from_std(d)
                    .map_err(|e| QuotaError::InvalidReservationExpiration(e.to_string()))?;
                now + d
            }
            Expiry::At(at) if at > now => at,
            Expiry::At(at) => {
                return Err(QuotaError::InvalidReservationExpiration(format!(
                    "{} is not in the future",
                    at
                )));
            }
        };

        let quotas = self.effective_limits(ctx, project_id).await?;
        let policy = ReservePolicy {
            expire,
            until_refresh: self.config.until_refresh,
            max_age: self.config.max_age(),
        };
        self.ledger
            .quota_reserve(ctx, &self.resources, &quotas, deltas, policy, Some(project_id))
            .await
    }

    pub async fn commit(&self, ctx: &RequestContext, reservations: &[String], project_id: Option<&str>) -> Result<()> {
        self.ledger
            .reservation_commit(ctx, reservations, project_id)
            .await
    }

    pub async fn rollback(&self, ctx: &RequestContext, reservations: &[String], project_id: Option<&str>) -> Result<()> {
        self.ledger
            .reservation_rollback(ctx, reservations, project_id)
            .await
    }

    pub async fn expire(&self, ctx: &RequestContext) -> Result<usize> {
        self.ledger.reservation_expire(ctx).await
    }

    pub async fn destroy_by_project(&self, ctx: &RequestContext, project_id: &str) -> Result<()> {
        self.ledger.quota_destroy_by_project(ctx, project_id).await
    }

    /// Check absolute values (e.g. `per_volume_gigabytes`) against their limits.
    /// Nothing is reserved.
    pub async fn limit_check(
        &self,
        ctx: &RequestContext,
        values: &BTreeMap<String, i64>,
        project_id: Option<&str>,
    ) -> Result<()> {
        let project_id = ctx
            .resolve_project(project_id)
            .ok_or_else(|| QuotaError::NotAuthorized("no project to check against".to_string()))?;

        if let Some((resource, value)) = values.iter().find(|(_, v)| **v < 0) {
            return Err(QuotaError::InvalidQuotaValue {
                resource: resource.clone(),
                reason: format!("{} is negative", value),
            });
        }

        let limits = self.effective_limits(ctx, project_id).await?;
        let unknown: Vec<String> = values
            .keys()
            .filter(|name| self.resources.contains(name) || !limits.contains_key(*name))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(QuotaError::UnknownResources(unknown));
        }

        let overs: Vec<OverQuotaResource> = values
            .iter()
            .filter_map(|(name, &value)| {
                let limit = limits.get(name)?;
                (!limit.admits(value)).then(|| OverQuotaResource {
                    resource: name.clone(),
                    requested: value,
                    in_use: 0,
                    reserved: 0,
                    limit: *limit,
                })
            })
            .collect();
        if overs.is_empty() {
            Ok(())
        } else {
            Err(OverQuota {
                project_id: project_id.to_string(),
                overs,
            }
            .into())
        }
    }

    fn quota_class_for<'a>(&self, ctx: &'a RequestContext, project_id: &str) -> Option<&'a str> {
        if ctx.project_id.as_deref() == Some(project_id) {
            ctx.quota_class.as_deref()
        } else {
            None
        }
    }
}

/// Replace entries of `base` with `rows`, ignoring resources `base` does not know.
fn overlay(base: &mut BTreeMap<String, HardLimit>, rows: BTreeMap<String, HardLimit>) {
    for (name, limit) in rows {
        if let Some(slot) = base.get_mut(&name) {
            *slot = limit;
        }
    }
}
