//! Data model shared by every synchronized domain.
//!
//! Tasks are owned by the remote store and only mirrored here. Scope windows,
//! inbox items and timeline overrides are collaborative records that the
//! domain stores reconcile between cache and remote.

mod inbox;
mod scope;
mod session;
mod task;
mod timeline;

pub use inbox::InboxItem;
pub use inbox::InboxSnapshot;
pub use inbox::InboxStatus;
pub use scope::CompletionStatus;
pub use scope::ScopeMember;
pub use scope::ScopeRole;
pub use scope::ScopeWindow;
pub use scope::ScopeWindowsState;
pub use scope::Visibility;
pub use scope::WEEKLY_SCOPE_PREFIX;
pub use scope::weekly_scope_id;
pub use scope::week_start;
pub use session::RequestContext;
pub use session::Session;
pub use session::TenantRole;
pub use task::ActivityEntry;
pub use task::Attachment;
pub use task::BoardSelector;
pub use task::ChecklistItem;
pub use task::Comment;
pub use task::NewTask;
pub use task::Priority;
pub use task::SourceType;
pub use task::Task;
pub use task::TaskPatch;
pub use task::TaskStatus;
pub use timeline::TimelineOverride;
pub use timeline::TimelineOverrides;

use serde::Deserialize;
use serde::Serialize;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

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
    /// Isolation boundary ("huddle"). Every domain record is partitioned by it.
    TenantId
);
string_id!(UserId);
string_id!(
    /// Server-assigned task identity. The client never invents one.
    TaskId
);
string_id!(BoardId);
string_id!(ScopeId);
string_id!(InboxItemId);
string_id!(
    /// Identity of this running client, used to drop self-originated broadcasts.
    ClientId
);

impl ClientId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
