//! Scope window lifecycle: Open → Completed, terminal.
//!
//! Closing a scope with open tasks hands them to a target scope. The weekly
//! scope cannot be completed by hand; it is provisioned lazily each week under
//! a deterministic id, so concurrent clients converge on one record.

use std::sync::Arc;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;

use crate::bridge::BroadcastKind;
use crate::bridge::ChangePublisher;
use crate::domain::ScopeStore;
use crate::model::CompletionStatus;
use crate::model::ScopeId;
use crate::model::ScopeWindow;
use crate::model::Session;
use crate::model::TaskId;
use crate::model::weekly_scope_id;
use crate::optimistic::MutationError;
use crate::optimistic::run_optimistic;
use crate::task_board::TaskBoard;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("no active huddle")]
    NoActiveTenant,

    #[error("scope {0} not found")]
    ScopeNotFound(ScopeId),

    #[error("scope {0} is already completed")]
    AlreadyCompleted(ScopeId),

    #[error("the weekly scope closes on its own and cannot be completed by hand")]
    WeeklyScopeExempt,

    #[error("{open} open tasks need a target scope")]
    TargetRequired { open: usize },

    #[error("scope {0} cannot receive tasks: it must be another open scope")]
    InvalidTarget(ScopeId),

    #[error(transparent)]
    Remote(#[from] MutationError),
}

/// What the user picked in the completion dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub status: CompletionStatus,
    pub comment: Option<String>,
    /// Receives the open tasks. Required only when there are any.
    pub target: Option<ScopeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSummary {
    pub moved: Vec<TaskId>,
    pub target: Option<ScopeId>,
}

pub struct ScopeLifecycle {
    scopes: Arc<ScopeStore>,
    board: Arc<TaskBoard>,
    publisher: Arc<dyn ChangePublisher>,
}

impl ScopeLifecycle {
    pub fn new(scopes: Arc<ScopeStore>, board: Arc<TaskBoard>, publisher: Arc<dyn ChangePublisher>) -> Self {
        Self {
            scopes,
            board,
            publisher,
        }
    }

    /// Return this week's scope, creating it on first access. Idempotent per
    /// tenant and ISO week, also under concurrent calls. The remote write only
    /// happens once the scope store has synced in this activation.
    pub async fn ensure_weekly_scope(&self, session: &Session, today: NaiveDate) -> Option<ScopeWindow> {
        let tenant = session.tenant_id.clone()?;
        let id = weekly_scope_id(&tenant, today);
        let (scope, created) = self
            .scopes
            .update(&tenant, |state| match state.get(&id) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let scope = ScopeWindow::weekly(tenant.clone(), today, session.user_id.clone());
                    state.scopes.push(scope.clone());
                    (scope, true)
                }
            })
            .await;

        if created {
            if !self.scopes.is_synced(&tenant) {
                // Committing would put an unreconciled list over the remote
                // one. The next load replaces this local copy and the
                // following call provisions it for real.
                tracing::debug!("Weekly scope {id} kept local until scopes sync for {tenant}");
                return Some(scope);
            }
            tracing::info!("Provisioned weekly scope {id}");
            match self.scopes.commit(session).await {
                Ok(()) => {
                    self.publisher
                        .announce(&tenant, BroadcastKind::ScopeUpdate)
                        .await;
                }
                Err(e) => tracing::warn!("Weekly scope {id} not written to remote yet: {e}"),
            }
        }
        Some(scope)
    }

    /// Close `scope_id`, handing its open tasks to `request.target`.
    pub async fn complete_scope(
        &self,
        session: &Session,
        scope_id: &ScopeId,
        request: CompletionRequest,
        now: DateTime<Utc>,
    ) -> Result<CompletionSummary, LifecycleError> {
        let tenant = session
            .tenant_id
            .clone()
            .ok_or(LifecycleError::NoActiveTenant)?;
        let state = self.scopes.snapshot(&tenant).await;
        let closing = state
            .get(scope_id)
            .cloned()
            .ok_or_else(|| LifecycleError::ScopeNotFound(scope_id.clone()))?;
        if !closing.is_open() {
            return Err(LifecycleError::AlreadyCompleted(scope_id.clone()));
        }
        if closing.is_weekly() {
            return Err(LifecycleError::WeeklyScopeExempt);
        }

        let mut open = Vec::new();
        for id in &closing.task_ids {
            if let Some(task) = self.board.task(&tenant, id).await
                && task.status.is_open()
            {
                open.push(id.clone());
            }
        }

        let target = if open.is_empty() {
            None
        } else {
            let target_id = request
                .target
                .clone()
                .ok_or(LifecycleError::TargetRequired { open: open.len() })?;
            let target = state
                .get(&target_id)
                .filter(|target| target.id != closing.id && target.is_open())
                .cloned()
                .ok_or_else(|| LifecycleError::InvalidTarget(target_id.clone()))?;
            Some(target)
        };

        let mut closed = closing.clone();
        closed.task_ids.retain(|id| !open.contains(id));
        closed.completion_status = Some(request.status);
        closed.completion_comment = request.comment;
        closed.completed_at = Some(now);
        closed.completed_by = Some(session.user_id.clone());
        let receiving = target.clone().map(|mut target| {
            for id in &open {
                target.push_task(id.clone());
            }
            target
        });

        let replace = |records: Vec<ScopeWindow>| {
            let tenant = tenant.clone();
            async move {
                self.scopes
                    .update(&tenant, |state| {
                        for record in records {
                            if let Some(slot) = state.get_mut(&record.id) {
                                *slot = record;
                            }
                        }
                    })
                    .await;
            }
        };
        let updated: Vec<ScopeWindow> = std::iter::once(closed).chain(receiving).collect();
        let previous: Vec<ScopeWindow> = std::iter::once(closing).chain(target.clone()).collect();

        run_optimistic(replace(updated), self.scopes.commit(session), replace(previous))
            .await
            .map_err(|e| {
                tracing::warn!("Completing scope {scope_id} failed: {e}; rolled back");
                MutationError::remote("complete the scope", e)
            })?;

        self.board.sync_scope_tasks(&tenant).await;
        self.publisher
            .announce(&tenant, BroadcastKind::ScopeUpdate)
            .await;
        tracing::info!(
            "Completed scope {scope_id} as {:?}; moved {} open tasks",
            request.status,
            open.len()
        );
        Ok(CompletionSummary {
            moved: open,
            target: target.map(|target| target.id),
        })
    }
}
