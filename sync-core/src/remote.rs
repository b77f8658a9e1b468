//! Boundary to the authoritative remote store.
//!
//! The sync core only depends on the shapes below; `huddle-backend-client`
//! provides the HTTP implementation and `testing::MemoryRemote` (behind the
//! `test-utils` feature) an in-process one.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::model::BoardId;
use crate::model::BoardSelector;
use crate::model::InboxSnapshot;
use crate::model::NewTask;
use crate::model::RequestContext;
use crate::model::ScopeWindowsState;
use crate::model::Task;
use crate::model::TaskId;
use crate::model::TaskPatch;
use crate::model::TaskStatus;
use crate::model::TenantId;
use crate::model::TimelineOverrides;

/// Failure of a remote read, write or command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Remote unreachable or the connection broke mid-request.
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote answered with a non-2xx status.
    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },

    /// Response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

/// How a failure should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Network trouble; background sync swallows it.
    Transport,
    /// Authorization or row-policy rejection; shown as a calm notice.
    Permission,
    /// Any other rejection of the request.
    Rejected,
}

const PERMISSION_KEYWORDS: &[&str] = &[
    "permission",
    "policy",
    "not authorized",
    "unauthorized",
    "forbidden",
    "row-level security",
    "access denied",
];

impl RemoteError {
    pub fn classify(&self) -> FailureClass {
        match self {
            RemoteError::Transport(_) | RemoteError::Decode(_) => FailureClass::Transport,
            RemoteError::Status { status, message } => {
                if matches!(status, 401 | 403) || mentions_permission(message) {
                    FailureClass::Permission
                } else {
                    FailureClass::Rejected
                }
            }
        }
    }
}

fn mentions_permission(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMISSION_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

/// Single authoritative state transition on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TaskCommand {
    Create {
        task: NewTask,
    },
    UpdateStatus {
        task_id: TaskId,
        status: TaskStatus,
    },
    UpdateDetails {
        task_id: TaskId,
        patch: TaskPatch,
    },
    Delete {
        task_id: TaskId,
    },
    AssignToBoard {
        task_id: TaskId,
        board_id: BoardId,
    },
    AssignToTenant {
        task_id: TaskId,
        tenant_id: TenantId,
    },
    SetFavorite {
        task_id: TaskId,
        favorite: bool,
    },
}

impl TaskCommand {
    /// Human-readable verb used in logs and user notices.
    pub fn action(&self) -> &'static str {
        match self {
            TaskCommand::Create { .. } => "create the task",
            TaskCommand::UpdateStatus { .. } => "change the task status",
            TaskCommand::UpdateDetails { .. } => "update the task",
            TaskCommand::Delete { .. } => "delete the task",
            TaskCommand::AssignToBoard { .. } => "move the task to another board",
            TaskCommand::AssignToTenant { .. } => "move the task to another huddle",
            TaskCommand::SetFavorite { .. } => "update favorites",
        }
    }
}

/// Authoritative remote store, one tenant per request.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_inbox(&self, ctx: &RequestContext) -> Result<InboxSnapshot, RemoteError>;

    async fn put_inbox(
        &self,
        ctx: &RequestContext,
        inbox: &InboxSnapshot,
    ) -> Result<(), RemoteError>;

    async fn fetch_scopes(&self, ctx: &RequestContext) -> Result<ScopeWindowsState, RemoteError>;

    async fn put_scopes(
        &self,
        ctx: &RequestContext,
        scopes: &ScopeWindowsState,
    ) -> Result<(), RemoteError>;

    async fn fetch_timeline(&self, ctx: &RequestContext)
    -> Result<TimelineOverrides, RemoteError>;

    async fn put_timeline(
        &self,
        ctx: &RequestContext,
        overrides: &TimelineOverrides,
    ) -> Result<(), RemoteError>;

    async fn list_tasks(
        &self,
        ctx: &RequestContext,
        board: &BoardSelector,
    ) -> Result<Vec<Task>, RemoteError>;

    /// Execute a task command. Returns the resulting task when the remote
    /// sends one back (always for `Create`).
    async fn execute(
        &self,
        ctx: &RequestContext,
        command: &TaskCommand,
    ) -> Result<Option<Task>, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn status(status: u16, message: &str) -> RemoteError {
        RemoteError::Status {
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn classifies_by_status_and_keywords() {
        assert_eq!(status(403, "nope").classify(), FailureClass::Permission);
        assert_eq!(status(401, "").classify(), FailureClass::Permission);
        assert_eq!(
            status(400, "new row violates row-level security policy").classify(),
            FailureClass::Permission
        );
        assert_eq!(
            status(500, "Permission Denied for table tasks").classify(),
            FailureClass::Permission
        );
        assert_eq!(status(409, "conflict").classify(), FailureClass::Rejected);
        assert_eq!(
            RemoteError::Transport("connection refused".into()).classify(),
            FailureClass::Transport
        );
    }

    #[test]
    fn command_wire_shape() {
        let command = TaskCommand::UpdateStatus {
            task_id: TaskId::new("t1"),
            status: TaskStatus::Done,
        };
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            serde_json::json!({"command": "update_status", "task_id": "t1", "status": "DONE"})
        );
    }
}
