//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from an existing string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a new random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Identifier of a sandboxed task.
    TaskId
);

string_id!(
    /// Identifier of the agent that owns tasks and requests training.
    AgentId
);

string_id!(
    /// Identifier of a worker node in the training network.
    NodeId
);

string_id!(
    /// Identifier of one training cycle.
    CycleId
);

string_id!(
    /// Identifier of a training request as submitted by an agent.
    RequestId
);

impl TaskId {
    /// Task ids embed the owning agent so audit logs stay greppable.
    pub fn for_agent(agent_id: &AgentId) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", agent_id, &suffix[..12]))
    }
}
