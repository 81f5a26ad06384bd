use pkg_state::Transient;

pub type Result<T, E = ClusterError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Another live cluster already holds the name.
    #[error("Cluster {name} already exists")]
    ClusterExists { name: String },

    #[error("Cluster {0} could not be found")]
    ClusterNotFound(String),

    #[error("Cluster {name} still has hosts")]
    ClusterHasHosts { name: String },

    #[error("Service {0} could not be found")]
    ServiceNotFound(i64),

    #[error("Invalid cluster request: {0}")]
    Invalid(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl Transient for ClusterError {
    fn is_transient(&self) -> bool {
        match self {
            ClusterError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
