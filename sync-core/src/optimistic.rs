//! Optimistic mutations: apply locally, confirm remotely, roll back on
//! failure.
//!
//! Every user-initiated edit goes through [`run_optimistic`] so that status
//! changes, reschedules, scope membership edits and favorites share one
//! rollback and broadcast path. Failures are the only sync errors that reach
//! the user; [`MutationError::notice`] renders them.

use std::future::Future;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::bridge::BroadcastKind;
use crate::bridge::ChangePublisher;
use crate::domain::ScopeStore;
use crate::domain::TimelineStore;
use crate::model::BoardId;
use crate::model::NewTask;
use crate::model::RequestContext;
use crate::model::ScopeId;
use crate::model::Session;
use crate::model::Task;
use crate::model::TaskId;
use crate::model::TaskPatch;
use crate::model::TaskStatus;
use crate::model::TenantId;
use crate::model::TimelineOverride;
use crate::remote::FailureClass;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;
use crate::remote::TaskCommand;
use crate::task_board::TaskBoard;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("no active huddle")]
    NoActiveTenant,

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("task {0} is synced from an external source and is read-only")]
    ReadOnly(TaskId),

    #[error("scope {0} not found")]
    ScopeNotFound(ScopeId),

    #[error("scope {0} is completed and can no longer change")]
    ScopeClosed(ScopeId),

    #[error("could not {action}: {source}")]
    Remote {
        action: &'static str,
        class: FailureClass,
        #[source]
        source: RemoteError,
    },
}

impl MutationError {
    pub fn remote(action: &'static str, source: RemoteError) -> Self {
        MutationError::Remote {
            action,
            class: source.classify(),
            source,
        }
    }

    pub fn class(&self) -> Option<FailureClass> {
        match self {
            MutationError::Remote { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// Text shown to the user after the local change was undone.
    pub fn notice(&self) -> String {
        match self {
            MutationError::Remote {
                action,
                class: FailureClass::Permission,
                ..
            } => format!("You don't have permission to {action}. Nothing was changed."),
            MutationError::Remote {
                action,
                class: FailureClass::Transport,
                ..
            } => format!("Couldn't reach the server to {action}. Your change was undone."),
            MutationError::Remote {
                action,
                class: FailureClass::Rejected,
                source,
            } => format!("Couldn't {action} ({source}). Your change was undone."),
            other => other.to_string(),
        }
    }
}

/// Apply `mutate`, run `command`, and run `revert` if the command fails.
///
/// The three futures are lazy: nothing runs before this is awaited, and
/// `revert` only runs on failure.
pub async fn run_optimistic<T, M, C, R>(mutate: M, command: C, revert: R) -> Result<T, RemoteError>
where
    M: Future<Output = ()>,
    C: Future<Output = Result<T, RemoteError>>,
    R: Future<Output = ()>,
{
    mutate.await;
    match command.await {
        Ok(value) => Ok(value),
        Err(e) => {
            revert.await;
            Err(e)
        }
    }
}

pub struct OptimisticMutator {
    remote: Arc<dyn RemoteStore>,
    board: Arc<TaskBoard>,
    scopes: Arc<ScopeStore>,
    timeline: Arc<TimelineStore>,
    publisher: Arc<dyn ChangePublisher>,
}

impl OptimisticMutator {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        board: Arc<TaskBoard>,
        scopes: Arc<ScopeStore>,
        timeline: Arc<TimelineStore>,
        publisher: Arc<dyn ChangePublisher>,
    ) -> Self {
        Self {
            remote,
            board,
            scopes,
            timeline,
            publisher,
        }
    }

    async fn writable_task(&self, session: &Session, id: &TaskId) -> Result<(RequestContext, Task), MutationError> {
        let ctx = session.context().ok_or(MutationError::NoActiveTenant)?;
        let task = self
            .board
            .task(&ctx.tenant_id, id)
            .await
            .ok_or_else(|| MutationError::TaskNotFound(id.clone()))?;
        if task.source_type.is_read_only() {
            return Err(MutationError::ReadOnly(id.clone()));
        }
        Ok((ctx, task))
    }

    async fn finish<T>(
        &self,
        tenant: &TenantId,
        command: &TaskCommand,
        kind: BroadcastKind,
        result: Result<T, RemoteError>,
    ) -> Result<T, MutationError> {
        match result {
            Ok(value) => {
                self.publisher.announce(tenant, kind).await;
                Ok(value)
            }
            Err(e) => {
                tracing::warn!("Failed to {}: {e}; local change rolled back", command.action());
                Err(MutationError::remote(command.action(), e))
            }
        }
    }

    /// Move a task to another status column.
    pub async fn apply_status_change(
        &self,
        session: &Session,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), MutationError> {
        let (ctx, task) = self.writable_task(session, task_id).await?;
        let previous = task.status;
        if previous == status {
            return Ok(());
        }
        let tenant = &ctx.tenant_id;
        let command = TaskCommand::UpdateStatus {
            task_id: task_id.clone(),
            status,
        };
        let result = run_optimistic(
            async {
                self.board
                    .update_task(tenant, task_id, |task| task.status = status)
                    .await;
            },
            async { self.remote.execute(&ctx, &command).await.map(drop) },
            async {
                self.board
                    .update_task(tenant, task_id, |task| task.status = previous)
                    .await;
            },
        )
        .await;
        self.finish(tenant, &command, BroadcastKind::TaskUpdate, result).await
    }

    /// Drag-to-reschedule on the timeline. The due date and the timeline
    /// override move together and roll back together. The override is only
    /// written to the remote once the due-date command succeeded.
    pub async fn reschedule(
        &self,
        session: &Session,
        task_id: &TaskId,
        due_date: Option<NaiveDate>,
        timeline: Option<TimelineOverride>,
    ) -> Result<(), MutationError> {
        let (ctx, task) = self.writable_task(session, task_id).await?;
        let tenant = &ctx.tenant_id;
        let previous_due = task.due_date;
        let previous_override = self.timeline.override_for(tenant, task_id).await;
        let command = TaskCommand::UpdateDetails {
            task_id: task_id.clone(),
            patch: TaskPatch::due_date(due_date),
        };

        let result = run_optimistic(
            async move {
                self.board
                    .update_task(tenant, task_id, |task| task.due_date = due_date)
                    .await;
                self.timeline.put_override(tenant, task_id, timeline).await;
            },
            async { self.remote.execute(&ctx, &command).await.map(drop) },
            async move {
                self.board
                    .update_task(tenant, task_id, |task| task.due_date = previous_due)
                    .await;
                self.timeline
                    .put_override(tenant, task_id, previous_override)
                    .await;
            },
        )
        .await;

        if result.is_ok() {
            self.timeline.persist(session).await;
        }
        self.finish(tenant, &command, BroadcastKind::TaskUpdate, result).await
    }

    pub async fn set_favorite(
        &self,
        session: &Session,
        task_id: &TaskId,
        favorite: bool,
    ) -> Result<(), MutationError> {
        let ctx = session.context().ok_or(MutationError::NoActiveTenant)?;
        let tenant = &ctx.tenant_id;
        let task = self
            .board
            .task(tenant, task_id)
            .await
            .ok_or_else(|| MutationError::TaskNotFound(task_id.clone()))?;
        let previous = task.is_favorite;
        let command = TaskCommand::SetFavorite {
            task_id: task_id.clone(),
            favorite,
        };
        let result = run_optimistic(
            async {
                self.board
                    .update_task(tenant, task_id, |task| task.is_favorite = favorite)
                    .await;
            },
            async { self.remote.execute(&ctx, &command).await.map(drop) },
            async {
                self.board
                    .update_task(tenant, task_id, |task| task.is_favorite = previous)
                    .await;
            },
        )
        .await;
        self.finish(tenant, &command, BroadcastKind::TaskUpdate, result).await
    }

    pub async fn update_details(
        &self,
        session: &Session,
        task_id: &TaskId,
        patch: TaskPatch,
    ) -> Result<(), MutationError> {
        let (ctx, previous) = self.writable_task(session, task_id).await?;
        let tenant = &ctx.tenant_id;
        let command = TaskCommand::UpdateDetails {
            task_id: task_id.clone(),
            patch: patch.clone(),
        };
        let result = run_optimistic(
            async {
                self.board
                    .update_task(tenant, task_id, |task| patch.apply_to(task))
                    .await;
            },
            async { self.remote.execute(&ctx, &command).await.map(drop) },
            async {
                self.board
                    .update_task(tenant, task_id, |task| *task = previous.clone())
                    .await;
            },
        )
        .await;
        self.finish(tenant, &command, BroadcastKind::TaskUpdate, result).await
    }

    pub async fn delete_task(&self, session: &Session, task_id: &TaskId) -> Result<(), MutationError> {
        let (ctx, _) = self.writable_task(session, task_id).await?;
        let tenant = &ctx.tenant_id;
        let command = TaskCommand::Delete {
            task_id: task_id.clone(),
        };
        let removed = tokio::sync::Mutex::new(None);
        let result = run_optimistic(
            async {
                *removed.lock().await = self.board.remove_task(tenant, task_id).await;
            },
            async { self.remote.execute(&ctx, &command).await.map(drop) },
            async {
                if let Some(task) = removed.lock().await.take() {
                    self.board.insert_task(task).await;
                    self.board.sync_scope_tasks(tenant).await;
                }
            },
        )
        .await;
        self.finish(tenant, &command, BroadcastKind::TaskUpdate, result).await
    }

    /// Create a task. Not optimistic: the server assigns the id.
    pub async fn create_task(&self, session: &Session, new_task: NewTask) -> Result<Task, MutationError> {
        let ctx = session.context().ok_or(MutationError::NoActiveTenant)?;
        let command = TaskCommand::Create { task: new_task };
        let result = match self.remote.execute(&ctx, &command).await {
            Ok(Some(task)) => Ok(task),
            Ok(None) => Err(RemoteError::Decode("create returned no task".to_string())),
            Err(e) => Err(e),
        };
        let task = self
            .finish(&ctx.tenant_id, &command, BroadcastKind::TaskUpdate, result)
            .await?;
        self.board.insert_task(task.clone()).await;
        Ok(task)
    }

    /// Move a task to another board. The mirrors follow on the next refresh.
    pub async fn assign_to_board(
        &self,
        session: &Session,
        task_id: &TaskId,
        board_id: BoardId,
    ) -> Result<(), MutationError> {
        let (ctx, _) = self.writable_task(session, task_id).await?;
        let command = TaskCommand::AssignToBoard {
            task_id: task_id.clone(),
            board_id,
        };
        let result = self.remote.execute(&ctx, &command).await.map(drop);
        self.finish(&ctx.tenant_id, &command, BroadcastKind::TaskUpdate, result)
            .await?;
        self.board.refresh(session).await;
        Ok(())
    }

    /// Hand a task over to another tenant. It leaves this tenant's mirrors.
    pub async fn assign_to_tenant(
        &self,
        session: &Session,
        task_id: &TaskId,
        tenant_id: TenantId,
    ) -> Result<(), MutationError> {
        let (ctx, _) = self.writable_task(session, task_id).await?;
        let command = TaskCommand::AssignToTenant {
            task_id: task_id.clone(),
            tenant_id,
        };
        let result = self.remote.execute(&ctx, &command).await.map(drop);
        self.finish(&ctx.tenant_id, &command, BroadcastKind::TaskUpdate, result)
            .await?;
        self.board.remove_task(&ctx.tenant_id, task_id).await;
        Ok(())
    }

    pub async fn add_to_scope(
        &self,
        session: &Session,
        scope_id: &ScopeId,
        task_id: &TaskId,
    ) -> Result<(), MutationError> {
        self.edit_membership(session, scope_id, task_id, true).await
    }

    pub async fn remove_from_scope(
        &self,
        session: &Session,
        scope_id: &ScopeId,
        task_id: &TaskId,
    ) -> Result<(), MutationError> {
        self.edit_membership(session, scope_id, task_id, false).await
    }

    async fn edit_membership(
        &self,
        session: &Session,
        scope_id: &ScopeId,
        task_id: &TaskId,
        add: bool,
    ) -> Result<(), MutationError> {
        let tenant = session
            .tenant_id
            .clone()
            .ok_or(MutationError::NoActiveTenant)?;
        let scope = self
            .scopes
            .scope(&tenant, scope_id)
            .await
            .ok_or_else(|| MutationError::ScopeNotFound(scope_id.clone()))?;
        if !scope.is_open() {
            return Err(MutationError::ScopeClosed(scope_id.clone()));
        }
        let previous = scope.task_ids;
        let changed = self
            .scopes
            .update(&tenant, |state| {
                state.get_mut(scope_id).is_some_and(|scope| {
                    if add {
                        scope.push_task(task_id.clone())
                    } else {
                        scope.remove_task(task_id)
                    }
                })
            })
            .await;
        if !changed {
            return Ok(());
        }

        let result = run_optimistic(
            async {},
            self.scopes.commit(session),
            async {
                self.scopes
                    .update(&tenant, |state| {
                        if let Some(scope) = state.get_mut(scope_id) {
                            scope.task_ids.clone_from(&previous);
                        }
                    })
                    .await;
            },
        )
        .await;
        self.board.sync_scope_tasks(&tenant).await;

        let action = if add {
            "add the task to the scope"
        } else {
            "remove the task from the scope"
        };
        match result {
            Ok(()) => {
                self.publisher.announce(&tenant, BroadcastKind::ScopeUpdate).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to {action}: {e}; local change rolled back");
                Err(MutationError::remote(action, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn revert_runs_only_on_failure() {
        let log = tokio::sync::Mutex::new(Vec::new());

        let ok: Result<u8, RemoteError> = run_optimistic(
            async { log.lock().await.push("apply") },
            async { Ok(1) },
            async { log.lock().await.push("revert") },
        )
        .await;
        assert_eq!(ok, Ok(1));

        let err: Result<u8, RemoteError> = run_optimistic(
            async { log.lock().await.push("apply") },
            async { Err(RemoteError::Transport("down".into())) },
            async { log.lock().await.push("revert") },
        )
        .await;
        assert!(err.is_err());
        assert_eq!(*log.lock().await, vec!["apply", "apply", "revert"]);
    }

    #[test]
    fn permission_failures_get_a_calm_notice() {
        let err = MutationError::remote(
            "change the task status",
            RemoteError::Status {
                status: 403,
                message: "row-level security".into(),
            },
        );
        assert_eq!(err.class(), Some(FailureClass::Permission));
        assert_eq!(
            err.notice(),
            "You don't have permission to change the task status. Nothing was changed."
        );

        let err = MutationError::remote("delete the task", RemoteError::Transport("reset".into()));
        assert_eq!(
            err.notice(),
            "Couldn't reach the server to delete the task. Your change was undone."
        );
        assert_eq!(
            MutationError::ReadOnly(TaskId::new("t1")).notice(),
            "task t1 is synced from an external source and is read-only"
        );
    }
}
