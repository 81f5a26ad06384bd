use pkg_constants::{cluster, quota, state};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// data-dir: /var/lib/quota/data
/// metrics-port: 9464
/// sweep-interval-secs: 60
/// quota:
///   quota-volumes: 20
///   reservation-expire-secs: 3600
/// cluster:
///   service-down-time-secs: 90
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigFile {
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "metrics-port")]
    pub metrics_port: Option<u16>,
    #[serde(default, alias = "sweep-interval-secs")]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub quota: Option<QuotaConfig>,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Quota defaults and refresh policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    #[serde(alias = "quota-volumes")]
    pub quota_volumes: i64,
    #[serde(alias = "quota-snapshots")]
    pub quota_snapshots: i64,
    #[serde(alias = "quota-gigabytes")]
    pub quota_gigabytes: i64,
    #[serde(alias = "quota-backups")]
    pub quota_backups: i64,
    #[serde(alias = "quota-backup-gigabytes")]
    pub quota_backup_gigabytes: i64,
    #[serde(alias = "quota-groups")]
    pub quota_groups: i64,
    #[serde(alias = "per-volume-size-limit")]
    pub per_volume_size_limit: i64,
    #[serde(alias = "reservation-expire-secs")]
    pub reservation_expire_secs: u64,
    #[serde(alias = "until-refresh")]
    pub until_refresh: i64,
    #[serde(alias = "max-age-secs")]
    pub max_age_secs: u64,
    /// Let rows of the `default` quota class override the numbers above.
    #[serde(alias = "use-default-quota-class")]
    pub use_default_quota_class: bool,
    /// Extra resources with a fixed default limit, e.g. `gigabytes_ssd: 500`.
    #[serde(alias = "extra-defaults")]
    pub extra_defaults: BTreeMap<String, i64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            quota_volumes: quota::DEFAULT_QUOTA_VOLUMES,
            quota_snapshots: quota::DEFAULT_QUOTA_SNAPSHOTS,
            quota_gigabytes: quota::DEFAULT_QUOTA_GIGABYTES,
            quota_backups: quota::DEFAULT_QUOTA_BACKUPS,
            quota_backup_gigabytes: quota::DEFAULT_QUOTA_BACKUP_GIGABYTES,
            quota_groups: quota::DEFAULT_QUOTA_GROUPS,
            per_volume_size_limit: quota::DEFAULT_PER_VOLUME_SIZE_LIMIT,
            reservation_expire_secs: quota::DEFAULT_RESERVATION_EXPIRE_SECS,
            until_refresh: quota::DEFAULT_UNTIL_REFRESH,
            max_age_secs: quota::DEFAULT_MAX_AGE_SECS,
            use_default_quota_class: true,
            extra_defaults: BTreeMap::new(),
        }
    }
}

impl QuotaConfig {
    pub fn reservation_expire(&self) -> Duration {
        Duration::from_secs(self.reservation_expire_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Configured default limit for each built-in resource.
    pub fn defaults(&self) -> BTreeMap<String, i64> {
        let mut defaults: BTreeMap<String, i64> = [
            (quota::RESOURCE_VOLUMES, self.quota_volumes),
            (quota::RESOURCE_SNAPSHOTS, self.quota_snapshots),
            (quota::RESOURCE_GIGABYTES, self.quota_gigabytes),
            (quota::RESOURCE_BACKUPS, self.quota_backups),
            (quota::RESOURCE_BACKUP_GIGABYTES, self.quota_backup_gigabytes),
            (quota::RESOURCE_GROUPS, self.quota_groups),
            (quota::RESOURCE_PER_VOLUME_GIGABYTES, self.per_volume_size_limit),
        ]
        .into_iter()
        .map(|(name, limit)| (name.to_string(), limit))
        .collect();
        defaults.extend(self.extra_defaults.clone());
        defaults
    }
}

/// Cluster liveness policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    #[serde(alias = "service-down-time-secs")]
    pub service_down_time_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            service_down_time_secs: cluster::SERVICE_DOWN_TIME_SECS,
        }
    }
}

impl ClusterConfig {
    pub fn service_down_time(&self) -> Duration {
        Duration::from_secs(self.service_down_time_secs)
    }
}

/// Bounded retry policy for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(alias = "max-attempts")]
    pub max_attempts: u32,
    #[serde(alias = "interval-ms")]
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: state::STORE_RETRY_MAX_ATTEMPTS,
            interval_ms: state::STORE_RETRY_INTERVAL_MS,
        }
    }
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
