//! Hard-limit rows: per-project overrides and quota classes.

use chrono::Utc;
use pkg_constants::quota::DEFAULT_QUOTA_CLASS;
use pkg_constants::state::{QUOTA_CLASSES_PREFIX, QUOTA_LIMITS_PREFIX};
use pkg_state::kv::{get_json, list_json, put_json};
use pkg_state::retry_transient;
use pkg_types::context::RequestContext;
use pkg_types::quota::{HardLimit, ProjectQuota, QuotaClass};
use pkg_types::validate::{validate_key_segment, validate_resource_name};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::{QuotaError, Result};
use crate::ledger::{QuotaLedger, limits_prefix};

fn limit_key(project_id: &str, resource: &str) -> String {
    format!("{}{}/{}", QUOTA_LIMITS_PREFIX, project_id, resource)
}

fn class_prefix(class_name: &str) -> String {
    format!("{}{}/", QUOTA_CLASSES_PREFIX, class_name)
}

fn class_key(class_name: &str, resource: &str) -> String {
    format!("{}{}/{}", QUOTA_CLASSES_PREFIX, class_name, resource)
}

fn invalid(resource: &str, e: anyhow::Error) -> QuotaError {
    QuotaError::InvalidQuotaValue {
        resource: resource.to_string(),
        reason: e.to_string(),
    }
}

impl QuotaLedger {
    async fn put_with_retry<T: serde::Serialize + Sync>(&self, what: &str, key: &str, value: &T) -> Result<()> {
        retry_transient(&self.retry, what, move || async move {
            put_json(self.store.as_ref(), key, value).await
        })
        .await?;
        Ok(())
    }

    async fn delete_with_retry(&self, what: &str, key: &str) -> Result<()> {
        retry_transient(&self.retry, what, move || self.store.delete(key)).await?;
        Ok(())
    }

    // --- Project overrides ---

    pub async fn quota_create(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        resource: &str,
        hard_limit: HardLimit,
    ) -> Result<ProjectQuota> {
        self.require_admin(ctx, "quota_create")?;
        validate_key_segment("project id", project_id).map_err(|e| invalid(resource, e))?;
        validate_resource_name(resource).map_err(|e| invalid(resource, e))?;

        let key = limit_key(project_id, resource);
        let now = Utc::now();
        let created_at = get_json::<ProjectQuota, _>(self.store.as_ref(), &key)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        let quota = ProjectQuota {
            project_id: project_id.to_string(),
            resource: resource.to_string(),
            hard_limit,
            created_at,
            updated_at: now,
        };
        self.put_with_retry("quota_create", &key, &quota).await?;
        info!(
            "Set {} quota for project {} to {}",
            resource, project_id, hard_limit
        );
        Ok(quota)
    }

    pub async fn quota_get(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        resource: &str,
    ) -> Result<ProjectQuota> {
        self.authorize_project(ctx, project_id)?;
        get_json(self.store.as_ref(), &limit_key(project_id, resource))
            .await?
            .ok_or_else(|| QuotaError::ProjectQuotaNotFound {
                project_id: project_id.to_string(),
                resource: resource.to_string(),
            })
    }

    /// Every override of a project, by resource.
    pub async fn quota_get_all_by_project(
        &self,
        ctx: &RequestContext,
        project_id: &str,
    ) -> Result<BTreeMap<String, HardLimit>> {
        self.authorize_project(ctx, project_id)?;
        let rows: Vec<(String, ProjectQuota)> =
            list_json(self.store.as_ref(), &limits_prefix(project_id)).await?;
        Ok(rows
            .into_iter()
            .map(|(_, q)| (q.resource, q.hard_limit))
            .collect())
    }

    pub async fn quota_update(
        &self,
        ctx: &RequestContext,
        project_id: &str,
        resource: &str,
        hard_limit: HardLimit,
    ) -> Result<ProjectQuota> {
        self.require_admin(ctx, "quota_update")?;
        let mut quota = self.quota_get(ctx, project_id, resource).await?;
        quota.hard_limit = hard_limit;
        quota.updated_at = Utc::now();
        self.put_with_retry("quota_update", &limit_key(project_id, resource), &quota)
            .await?;
        Ok(quota)
    }

    /// Drop a project override so the class/default limit applies again.
    pub async fn quota_destroy(&self, ctx: &RequestContext, project_id: &str, resource: &str) -> Result<()> {
        self.require_admin(ctx, "quota_destroy")?;
        self.quota_get(ctx, project_id, resource).await?;
        self.delete_with_retry("quota_destroy", &limit_key(project_id, resource))
            .await
    }

    // --- Quota classes ---

    pub async fn quota_class_create(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        resource: &str,
        hard_limit: HardLimit,
    ) -> Result<QuotaClass> {
        self.require_admin(ctx, "quota_class_create")?;
        validate_key_segment("quota class", class_name).map_err(|e| invalid(resource, e))?;
        validate_resource_name(resource).map_err(|e| invalid(resource, e))?;

        let now = Utc::now();
        let class = QuotaClass {
            class_name: class_name.to_string(),
            resource: resource.to_string(),
            hard_limit,
            created_at: now,
            updated_at: now,
        };
        self.put_with_retry("quota_class_create", &class_key(class_name, resource), &class)
            .await?;
        Ok(class)
    }

    pub async fn quota_class_get(
        &self,
        _ctx: &RequestContext,
        class_name: &str,
        resource: &str,
    ) -> Result<QuotaClass> {
        get_json(self.store.as_ref(), &class_key(class_name, resource))
            .await?
            .ok_or_else(|| QuotaError::QuotaClassNotFound {
                class_name: class_name.to_string(),
            })
    }

    /// Rows of a class by resource; empty when the class has no rows.
    pub async fn quota_class_get_all_by_name(
        &self,
        _ctx: &RequestContext,
        class_name: &str,
    ) -> Result<BTreeMap<String, HardLimit>> {
        let rows: Vec<(String, QuotaClass)> =
            list_json(self.store.as_ref(), &class_prefix(class_name)).await?;
        Ok(rows
            .into_iter()
            .map(|(_, c)| (c.resource, c.hard_limit))
            .collect())
    }

    /// Rows of the `default` class.
    pub async fn quota_class_get_defaults(&self, ctx: &RequestContext) -> Result<BTreeMap<String, HardLimit>> {
        self.quota_class_get_all_by_name(ctx, DEFAULT_QUOTA_CLASS).await
    }

    pub async fn quota_class_update(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        resource: &str,
        hard_limit: HardLimit,
    ) -> Result<QuotaClass> {
        self.require_admin(ctx, "quota_class_update")?;
        let mut class = self.quota_class_get(ctx, class_name, resource).await?;
        class.hard_limit = hard_limit;
        class.updated_at = Utc::now();
        self.put_with_retry("quota_class_update", &class_key(class_name, resource), &class)
            .await?;
        Ok(class)
    }

    /// Rename a resource in every class, e.g. after a volume type rename.
    /// Returns how many rows moved.
    pub async fn quota_class_update_resource(
        &self,
        ctx: &RequestContext,
        old_resource: &str,
        new_resource: &str,
    ) -> Result<usize> {
        self.require_admin(ctx, "quota_class_update_resource")?;
        validate_resource_name(new_resource).map_err(|e| invalid(new_resource, e))?;
        let rows: Vec<(String, QuotaClass)> =
            list_json(self.store.as_ref(), QUOTA_CLASSES_PREFIX).await?;
        let mut moved = 0;
        for (key, mut class) in rows {
            if class.resource != old_resource {
                continue;
            }
            class.resource = new_resource.to_string();
            class.updated_at = Utc::now();
            self.put_with_retry(
                "quota_class_update_resource",
                &class_key(&class.class_name, new_resource),
                &class,
            )
            .await?;
            self.delete_with_retry("quota_class_update_resource", &key)
                .await?;
            moved += 1;
        }
        Ok(moved)
    }

    pub async fn quota_class_destroy(&self, ctx: &RequestContext, class_name: &str, resource: &str) -> Result<()> {
        self.require_admin(ctx, "quota_class_destroy")?;
        self.quota_class_get(ctx, class_name, resource).await?;
        self.delete_with_retry("quota_class_destroy", &class_key(class_name, resource))
            .await
    }

    pub async fn quota_class_destroy_all_by_name(&self, ctx: &RequestContext, class_name: &str) -> Result<()> {
        self.require_admin(ctx, "quota_class_destroy_all_by_name")?;
        let rows = self.store.list_prefix(&class_prefix(class_name)).await?;
        for (key, _) in rows {
            self.delete_with_retry("quota_class_destroy_all_by_name", &key)
                .await?;
        }
        Ok(())
    }
}
