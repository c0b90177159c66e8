//! Managed resource references

use serde::{Deserialize, Serialize};

/// A managed resource, identified by `(res_id, res_type)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub res_id: String,
    pub res_type: String,
}

impl ResourceRef {
    pub fn new(res_id: impl Into<String>, res_type: impl Into<String>) -> Self {
        Self {
            res_id: res_id.into(),
            res_type: res_type.into(),
        }
    }

    /// Store key: `res_type:res_id`
    pub fn key(&self) -> String {
        format!("{}:{}", self.res_type, self.res_id)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.res_type, self.res_id)
    }
}

/// Sub-resources touched by a flow (e.g. the backend targets of a load balancer)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResources {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub res_type: String,
}

impl SubResources {
    pub fn new(res_type: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            ids,
            res_type: res_type.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Business operation performed on a resource (`add_rs`, `remove_rs`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(kind: &str) -> Self {
        Self(kind.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key() {
        let lb = ResourceRef::new("lb-1", "LB");
        assert_eq!(lb.key(), "LB:lb-1");
        assert_eq!(lb.to_string(), "LB/lb-1");
    }
}
