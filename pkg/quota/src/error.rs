use pkg_state::Transient;
use pkg_types::quota::HardLimit;
use serde::{Deserialize, Serialize};

pub type Result<T, E = QuotaError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error(transparent)]
    OverQuota(#[from] OverQuota),

    #[error("Unknown quota resources: {}", .0.join(", "))]
    UnknownResources(Vec<String>),

    #[error("Quota for project {project_id} resource {resource} could not be found")]
    ProjectQuotaNotFound { project_id: String, resource: String },

    #[error("Quota class {class_name} could not be found")]
    QuotaClassNotFound { class_name: String },

    #[error("Quota usage for project {project_id} could not be found")]
    QuotaUsageNotFound { project_id: String },

    #[error("Invalid quota value for {resource}: {reason}")]
    InvalidQuotaValue { resource: String, reason: String },

    #[error("Invalid reservation expiration: {0}")]
    InvalidReservationExpiration(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Transient for QuotaError {
    fn is_transient(&self) -> bool {
        match self {
            QuotaError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// One resource that would exceed its hard limit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverQuotaResource {
    pub resource: String,
    pub requested: i64,
    pub in_use: i64,
    pub reserved: i64,
    pub limit: HardLimit,
}

impl OverQuotaResource {
    pub fn consumed(&self) -> i64 {
        self.in_use.saturating_add(self.reserved)
    }

    /// Capacity still available before the limit, never negative.
    pub fn remaining(&self) -> i64 {
        self.limit
            .value()
            .map(|limit| limit.saturating_sub(self.consumed()).max(0))
            .unwrap_or(i64::MAX)
    }
}

impl std::fmt::Display for OverQuotaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (requested {}, consumed {} of {})",
            self.resource,
            self.requested,
            self.consumed(),
            self.limit
        )
    }
}

/// A reservation batch or limit check rejected by one or more hard limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverQuota {
    pub project_id: String,
    /// Offending resources, sorted by name.
    pub overs: Vec<OverQuotaResource>,
}

impl OverQuota {
    pub fn resources(&self) -> Vec<&str> {
        self.overs.iter().map(|o| o.resource.as_str()).collect()
    }

    pub fn get(&self, resource: &str) -> Option<&OverQuotaResource> {
        self.overs.iter().find(|o| o.resource == resource)
    }
}

impl std::fmt::Display for OverQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let details: Vec<String> = self.overs.iter().map(ToString::to_string).collect();
        write!(
            f,
            "Quota exceeded for project {}: {}",
            self.project_id,
            details.join("; ")
        )
    }
}

impl std::error::Error for OverQuota {}

#[cfg(test)]
mod tests {
    use super::*;

    fn over(resource: &str, requested: i64, in_use: i64, reserved: i64, limit: i64) -> OverQuotaResource {
        OverQuotaResource {
            resource: resource.to_string(),
            requested,
            in_use,
            reserved,
            limit: HardLimit::new(limit),
        }
    }

    #[test]
    fn test_remaining_never_negative() {
        assert_eq!(over("gigabytes", 5, 3, 1, 6).remaining(), 2);
        assert_eq!(over("gigabytes", 5, 8, 0, 6).remaining(), 0);
    }

    #[test]
    fn test_message_names_every_resource() {
        let err = QuotaError::from(OverQuota {
            project_id: "p1".to_string(),
            overs: vec![over("gigabytes", 5, 3, 0, 4), over("volumes", 1, 1, 0, 1)],
        });
        let msg = err.to_string();
        assert!(msg.contains("gigabytes (requested 5, consumed 3 of 4)"));
        assert!(msg.contains("volumes (requested 1, consumed 1 of 1)"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_only_store_errors_are_transient() {
        assert!(QuotaError::Store(anyhow::anyhow!("lock timeout")).is_transient());
        assert!(!QuotaError::UnknownResources(vec!["x".to_string()]).is_transient());

        let decode = serde_json::from_slice::<i64>(b"{").unwrap_err();
        let corrupt = pkg_state::CorruptRecord {
            key: "/registry/quotas/ledgers/p1".to_string(),
            source: decode,
        };
        assert!(!QuotaError::Store(corrupt.into()).is_transient());
    }
}
