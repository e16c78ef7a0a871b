use serde::{Deserialize, Serialize};

const ANONYMOUS_USER: &str = "anonymous";

/// The caller a query is accounted to.
///
/// Authentication happens upstream; the router only needs identities for
/// quota accounting and for user/project scoped cache invalidation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantContext {
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl Default for TenantContext {
    fn default() -> Self {
        Self::anonymous()
    }
}

impl TenantContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: ANONYMOUS_USER.to_string(),
            project_id: None,
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Key under which quotas are tracked. A project, when present, owns the quota.
    pub fn quota_key(&self) -> String {
        match &self.project_id {
            Some(project) => format!("project:{}", project),
            None => format!("user:{}", self.user_id),
        }
    }

    /// Cache tags for user- and project-scoped invalidation.
    pub fn cache_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("user:{}", self.user_id)];
        if let Some(project) = &self.project_id {
            tags.push(format!("project:{}", project));
        }
        tags
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS_USER && self.project_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_key_prefers_project() {
        let user = TenantContext::user("alice");
        assert_eq!(user.quota_key(), "user:alice");

        let scoped = TenantContext::user("alice").with_project("crawl-42");
        assert_eq!(scoped.quota_key(), "project:crawl-42");
    }

    #[test]
    fn test_cache_tags() {
        let tenant = TenantContext::user("bob").with_project("p1");
        assert_eq!(tenant.cache_tags(), vec!["user:bob", "project:p1"]);
        assert!(TenantContext::default().is_anonymous());
        assert!(!tenant.is_anonymous());
    }
}
