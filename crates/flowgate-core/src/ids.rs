//! String identifiers used across flowgate records

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifier of an action, unique within its flow (`a1`, `a2`, ...)
    ActionId
);

string_id!(
    /// Identifier of a flow assigned by the flow engine
    FlowId
);

string_id!(
    /// Identifier of a business-level task
    TaskManagementId
);

string_id!(
    /// Identifier of one unit of work inside a task
    TaskDetailId
);

impl FlowId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl TaskManagementId {
    pub fn generate() -> Self {
        Self(format!("tm-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl TaskDetailId {
    pub fn generate() -> Self {
        Self(format!("td-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl ActionId {
    /// Numeric position encoded in a sequence-issued id (`a3` -> 3)
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix('a').and_then(|n| n.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_serde_are_transparent() {
        let id = FlowId::new("f-1");
        assert_eq!(id.to_string(), "f-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"f-1\"");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(FlowId::generate(), FlowId::generate());
        assert!(TaskDetailId::generate().as_str().starts_with("td-"));
    }

    #[test]
    fn test_action_id_sequence() {
        assert_eq!(ActionId::new("a12").sequence(), Some(12));
        assert_eq!(ActionId::new("watch").sequence(), None);
    }
}
