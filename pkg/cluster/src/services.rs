//! Service rows: registration, heartbeats and cluster membership.

use chrono::Utc;
use pkg_constants::state::SERVICES_PREFIX;
use pkg_state::kv::{get_json, list_json, next_sequence, put_json};
use pkg_state::retry_transient;
use pkg_types::cluster::{Service, ServiceCreate, ServiceFilters, ServiceUpdate};
use pkg_types::context::RequestContext;
use pkg_types::validate::validate_key_segment;
use tracing::{debug, info};

use crate::error::{ClusterError, Result};
use crate::registry::ClusterRegistry;

pub(crate) fn service_key(id: i64) -> String {
    format!("{}{:020}", SERVICES_PREFIX, id)
}

fn invalid(e: anyhow::Error) -> ClusterError {
    ClusterError::Invalid(e.to_string())
}

fn service_matches(service: &Service, filters: &ServiceFilters) -> bool {
    filters.read_deleted.admits(service.deleted)
        && filters.host.as_ref().is_none_or(|h| &service.host == h)
        && filters.binary.as_ref().is_none_or(|b| &service.binary == b)
        && filters
            .cluster_name
            .as_ref()
            .is_none_or(|c| service.cluster_name.as_ref() == Some(c))
        && filters.disabled.is_none_or(|d| service.disabled == d)
}

impl ClusterRegistry {
    pub(crate) async fn list_services(&self, filters: &ServiceFilters) -> Result<Vec<Service>> {
        Ok(list_json::<Service, _>(self.store.as_ref(), SERVICES_PREFIX)
            .await?
            .into_iter()
            .map(|(_, s)| s)
            .filter(|s| service_matches(s, filters))
            .collect())
    }

    async fn live_service(&self, id: i64) -> Result<Service> {
        get_json::<Service, _>(self.store.as_ref(), &service_key(id))
            .await?
            .filter(|s| !s.deleted)
            .ok_or(ClusterError::ServiceNotFound(id))
    }

    async fn save_service(&self, what: &str, service: &Service) -> Result<()> {
        let key = service_key(service.id);
        let key = &key;
        retry_transient(&self.retry, what, move || async move {
            put_json(self.store.as_ref(), key, service).await
        })
        .await?;
        Ok(())
    }

    /// Register a service process. The cluster it names need not exist yet.
    pub async fn service_create(&self, ctx: &RequestContext, values: ServiceCreate) -> Result<Service> {
        self.require_admin(ctx, "service_create")?;
        validate_key_segment("host", &values.host).map_err(invalid)?;
        validate_key_segment("binary", &values.binary).map_err(invalid)?;
        if let Some(cluster) = &values.cluster_name {
            validate_key_segment("cluster name", cluster).map_err(invalid)?;
        }

        let _guard = self.write_lock.lock().await;
        let id = retry_transient(&self.retry, "service_create", move || {
            next_sequence(self.store.as_ref(), "services")
        })
        .await?;
        let now = Utc::now();
        let service = Service {
            id,
            host: values.host,
            binary: values.binary,
            topic: values.topic,
            cluster_name: values.cluster_name,
            disabled: false,
            disabled_reason: None,
            created_at: now,
            last_heartbeat: now,
            deleted: false,
            deleted_at: None,
        };
        self.save_service("service_create", &service).await?;
        info!(
            "Registered service {} on {} (id={}, cluster={})",
            service.binary,
            service.host,
            service.id,
            service.cluster_name.as_deref().unwrap_or("-")
        );
        Ok(service)
    }

    pub async fn service_get(&self, ctx: &RequestContext, id: i64) -> Result<Service> {
        self.require_admin(ctx, "service_get")?;
        self.live_service(id).await
    }

    pub async fn service_get_all(&self, ctx: &RequestContext, filters: &ServiceFilters) -> Result<Vec<Service>> {
        self.require_admin(ctx, "service_get_all")?;
        self.list_services(filters).await
    }

    /// Record a heartbeat from a running service.
    pub async fn service_heartbeat(&self, ctx: &RequestContext, id: i64) -> Result<Service> {
        self.require_admin(ctx, "service_heartbeat")?;
        let _guard = self.write_lock.lock().await;
        let mut service = self.live_service(id).await?;
        service.last_heartbeat = Utc::now();
        self.save_service("service_heartbeat", &service).await?;
        debug!("Heartbeat from service {} on {}", service.id, service.host);
        Ok(service)
    }

    pub async fn service_update(&self, ctx: &RequestContext, id: i64, values: ServiceUpdate) -> Result<Service> {
        self.require_admin(ctx, "service_update")?;
        if let Some(Some(cluster)) = &values.cluster_name {
            validate_key_segment("cluster name", cluster).map_err(invalid)?;
        }

        let _guard = self.write_lock.lock().await;
        let mut service = self.live_service(id).await?;
        if let Some(disabled) = values.disabled {
            service.disabled = disabled;
        }
        if let Some(reason) = values.disabled_reason {
            service.disabled_reason = reason;
        }
        if let Some(cluster_name) = values.cluster_name {
            service.cluster_name = cluster_name;
        }
        self.save_service("service_update", &service).await?;
        info!(
            "Updated service {} (disabled={}, cluster={})",
            service.id,
            service.disabled,
            service.cluster_name.as_deref().unwrap_or("-")
        );
        Ok(service)
    }

    /// Soft-delete a service so it stops counting toward its cluster.
    pub async fn service_destroy(&self, ctx: &RequestContext, id: i64) -> Result<Service> {
        self.require_admin(ctx, "service_destroy")?;
        let _guard = self.write_lock.lock().await;
        let mut service = self.live_service(id).await?;
        service.deleted = true;
        service.deleted_at = Some(Utc::now());
        self.save_service("service_destroy", &service).await?;
        info!("Destroyed service {} on {}", service.id, service.host);
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::make_registry;
    use pkg_state::MemoryStore;
    use pkg_types::cluster::{ClusterCreate, ClusterFilters, ReadDeleted};
    use std::sync::Arc;

    fn create(host: &str, binary: &str, cluster: Option<&str>) -> ServiceCreate {
        ServiceCreate {
            host: host.to_string(),
            binary: binary.to_string(),
            topic: None,
            cluster_name: cluster.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_create_and_filter() {
        let registry = make_registry(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::admin();
        let a = registry
            .service_create(&ctx, create("a", "cinder-volume", Some("c1")))
            .await
            .unwrap();
        registry
            .service_create(&ctx, create("b", "cinder-backup", None))
            .await
            .unwrap();
        assert_eq!(a.id, 1);

        let all = registry
            .service_get_all(&ctx, &ServiceFilters::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let in_c1 = ServiceFilters {
            cluster_name: Some("c1".to_string()),
            ..Default::default()
        };
        let found = registry.service_get_all(&ctx, &in_c1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "a");

        let backups = ServiceFilters {
            binary: Some("cinder-backup".to_string()),
            ..Default::default()
        };
        assert_eq!(registry.service_get_all(&ctx, &backups).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_advances() {
        let registry = make_registry(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::admin();
        let svc = registry
            .service_create(&ctx, create("a", "cinder-volume", None))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let beat = registry.service_heartbeat(&ctx, svc.id).await.unwrap();
        assert!(beat.last_heartbeat > svc.last_heartbeat);
        assert_eq!(
            registry.service_get(&ctx, svc.id).await.unwrap().last_heartbeat,
            beat.last_heartbeat
        );
    }

    #[tokio::test]
    async fn test_move_between_clusters() {
        let registry = make_registry(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::admin();
        let c1 = registry
            .cluster_create(
                &ctx,
                ClusterCreate {
                    name: "c1".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let svc = registry
            .service_create(&ctx, create("a", "cinder-volume", Some("c1")))
            .await
            .unwrap();

        let moved = registry
            .service_update(
                &ctx,
                svc.id,
                ServiceUpdate {
                    disabled: Some(true),
                    cluster_name: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(moved.disabled);
        assert!(moved.cluster_name.is_none());

        let summary = ClusterFilters {
            name: Some("c1".to_string()),
            services_summary: true,
            ..Default::default()
        };
        let view = registry.cluster_get(&ctx, &summary).await.unwrap();
        assert_eq!(view.summary.unwrap().num_hosts, 0);
        registry.cluster_destroy(&ctx, c1.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroyed_service_is_gone() {
        let registry = make_registry(Arc::new(MemoryStore::new()));
        let ctx = RequestContext::admin();
        let svc = registry
            .service_create(&ctx, create("a", "cinder-volume", None))
            .await
            .unwrap();
        let gone = registry.service_destroy(&ctx, svc.id).await.unwrap();
        assert!(gone.deleted);

        let err = registry.service_heartbeat(&ctx, svc.id).await.unwrap_err();
        assert!(matches!(err, ClusterError::ServiceNotFound(id) if id == svc.id));
        assert!(
            registry
                .service_get_all(&ctx, &ServiceFilters::default())
                .await
                .unwrap()
                .is_empty()
        );

        let deleted = ServiceFilters {
            read_deleted: ReadDeleted::Only,
            ..Default::default()
        };
        assert_eq!(registry.service_get_all(&ctx, &deleted).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_host_rejected() {
        let registry = make_registry(Arc::new(MemoryStore::new()));
        let err = registry
            .service_create(&RequestContext::admin(), create("a/b", "cinder-volume", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Invalid(_)));
    }
}
