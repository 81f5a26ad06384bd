use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of the caller on whose behalf a ledger or cluster operation runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
    /// Quota class consulted between the defaults and the project overrides.
    #[serde(default)]
    pub quota_class: Option<String>,
}

impl RequestContext {
    /// Context for a regular tenant user scoped to one project.
    pub fn for_project(project_id: &str, user_id: &str) -> Self {
        Self {
            request_id: new_request_id(),
            user_id: Some(user_id.to_string()),
            project_id: Some(project_id.to_string()),
            is_admin: false,
            quota_class: None,
        }
    }

    /// Context for internal housekeeping (periodic sweeps, CLI tools).
    pub fn admin() -> Self {
        Self {
            request_id: new_request_id(),
            user_id: None,
            project_id: None,
            is_admin: true,
            quota_class: None,
        }
    }

    pub fn with_quota_class(mut self, quota_class: &str) -> Self {
        self.quota_class = Some(quota_class.to_string());
        self
    }

    /// Admin copy of this context, keeping the request id for log correlation.
    pub fn elevated(&self) -> Self {
        Self {
            is_admin: true,
            ..self.clone()
        }
    }

    /// Whether this context may read or mutate `project_id`'s quota state.
    pub fn can_access_project(&self, project_id: &str) -> bool {
        self.is_admin || self.project_id.as_deref() == Some(project_id)
    }

    /// Resolve an explicit project id, falling back to the context's own project.
    pub fn resolve_project<'a>(&'a self, project_id: Option<&'a str>) -> Option<&'a str> {
        project_id.or(self.project_id.as_deref())
    }
}

fn new_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}
