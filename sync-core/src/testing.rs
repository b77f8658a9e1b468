//! In-process doubles for tests and local runs without a backend.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::watch;

use crate::model::BoardId;
use crate::model::BoardSelector;
use crate::model::InboxSnapshot;
use crate::model::Priority;
use crate::model::RequestContext;
use crate::model::ScopeWindowsState;
use crate::model::SourceType;
use crate::model::Task;
use crate::model::TaskId;
use crate::model::TaskStatus;
use crate::model::TenantId;
use crate::model::TimelineOverrides;
use crate::model::UserId;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;
use crate::remote::TaskCommand;

/// Number of calls per remote operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    pub fetch_inbox: usize,
    pub put_inbox: usize,
    pub fetch_scopes: usize,
    pub put_scopes: usize,
    pub fetch_timeline: usize,
    pub put_timeline: usize,
    pub list_tasks: usize,
    pub execute: usize,
}

#[derive(Default)]
struct RemoteState {
    inbox: HashMap<TenantId, InboxSnapshot>,
    scopes: HashMap<TenantId, ScopeWindowsState>,
    timeline: HashMap<TenantId, TimelineOverrides>,
    tasks: Vec<Task>,
    next_task: u64,
    calls: RemoteCalls,
    failing_commands: Option<RemoteError>,
    failing_writes: Option<RemoteError>,
    failing_fetches: Option<RemoteError>,
}

/// Releases fetches held by [`MemoryRemote::hold_fetches`].
pub struct FetchGate {
    release: watch::Sender<bool>,
}

impl FetchGate {
    pub fn release(&self) {
        let _ = self.release.send(true);
    }
}

/// Authoritative store kept in memory, with failure injection.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
    offline: AtomicBool,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    held: Notify,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call fails with a transport error while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Task commands fail with `error` until cleared with `None`.
    pub fn fail_commands(&self, error: Option<RemoteError>) {
        self.state().failing_commands = error;
    }

    /// Domain writes fail with `error` until cleared with `None`.
    pub fn fail_writes(&self, error: Option<RemoteError>) {
        self.state().failing_writes = error;
    }

    /// Reads fail with `error` until cleared with `None`.
    pub fn fail_fetches(&self, error: Option<RemoteError>) {
        self.state().failing_fetches = error;
    }

    pub fn calls(&self) -> RemoteCalls {
        self.state().calls
    }

    /// Park every fetch until the returned gate is released.
    pub fn hold_fetches(&self) -> FetchGate {
        let (release, receiver) = watch::channel(false);
        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
        FetchGate { release }
    }

    /// Wait until a fetch is parked on the gate.
    pub async fn wait_for_held_fetch(&self) {
        self.held.notified().await;
    }

    pub fn seed_inbox(&self, tenant: &TenantId, inbox: InboxSnapshot) {
        self.state().inbox.insert(tenant.clone(), inbox);
    }

    pub fn seed_scopes(&self, tenant: &TenantId, scopes: ScopeWindowsState) {
        self.state().scopes.insert(tenant.clone(), scopes);
    }

    pub fn seed_timeline(&self, tenant: &TenantId, timeline: TimelineOverrides) {
        self.state().timeline.insert(tenant.clone(), timeline);
    }

    pub fn inbox(&self, tenant: &TenantId) -> InboxSnapshot {
        self.state().inbox.get(tenant).cloned().unwrap_or_default()
    }

    pub fn scopes(&self, tenant: &TenantId) -> ScopeWindowsState {
        self.state().scopes.get(tenant).cloned().unwrap_or_default()
    }

    pub fn timeline(&self, tenant: &TenantId) -> TimelineOverrides {
        self.state().timeline.get(tenant).cloned().unwrap_or_default()
    }

    /// Insert or replace a task.
    pub fn put_task(&self, task: Task) {
        let mut state = self.state();
        state.tasks.retain(|existing| existing.id != task.id);
        state.tasks.push(task);
    }

    pub fn remote_task(&self, id: &TaskId) -> Option<Task> {
        self.state().tasks.iter().find(|task| &task.id == id).cloned()
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn pass_gate(&self) {
        let receiver = self
            .gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(mut receiver) = receiver else {
            return;
        };
        if *receiver.borrow() {
            return;
        }
        self.held.notify_one();
        let _ = receiver.wait_for(|released| *released).await;
    }

    fn read_allowed(&self) -> Result<(), RemoteError> {
        self.check_online()?;
        match self.state().failing_fetches.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn write_allowed(&self) -> Result<(), RemoteError> {
        self.check_online()?;
        match self.state().failing_writes.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_inbox(&self, ctx: &RequestContext) -> Result<InboxSnapshot, RemoteError> {
        self.state().calls.fetch_inbox += 1;
        self.pass_gate().await;
        self.read_allowed()?;
        Ok(self.inbox(&ctx.tenant_id))
    }

    async fn put_inbox(&self, ctx: &RequestContext, inbox: &InboxSnapshot) -> Result<(), RemoteError> {
        self.state().calls.put_inbox += 1;
        self.write_allowed()?;
        self.seed_inbox(&ctx.tenant_id, inbox.clone());
        Ok(())
    }

    async fn fetch_scopes(&self, ctx: &RequestContext) -> Result<ScopeWindowsState, RemoteError> {
        self.state().calls.fetch_scopes += 1;
        self.pass_gate().await;
        self.read_allowed()?;
        Ok(self.scopes(&ctx.tenant_id))
    }

    async fn put_scopes(&self, ctx: &RequestContext, scopes: &ScopeWindowsState) -> Result<(), RemoteError> {
        self.state().calls.put_scopes += 1;
        self.write_allowed()?;
        self.seed_scopes(&ctx.tenant_id, scopes.clone());
        Ok(())
    }

    async fn fetch_timeline(&self, ctx: &RequestContext) -> Result<TimelineOverrides, RemoteError> {
        self.state().calls.fetch_timeline += 1;
        self.pass_gate().await;
        self.read_allowed()?;
        Ok(self.timeline(&ctx.tenant_id))
    }

    async fn put_timeline(
        &self,
        ctx: &RequestContext,
        overrides: &TimelineOverrides,
    ) -> Result<(), RemoteError> {
        self.state().calls.put_timeline += 1;
        self.write_allowed()?;
        self.seed_timeline(&ctx.tenant_id, overrides.clone());
        Ok(())
    }

    async fn list_tasks(&self, ctx: &RequestContext, board: &BoardSelector) -> Result<Vec<Task>, RemoteError> {
        self.state().calls.list_tasks += 1;
        self.pass_gate().await;
        self.read_allowed()?;
        Ok(self
            .state()
            .tasks
            .iter()
            .filter(|task| task.tenant_id == ctx.tenant_id && board.matches(&task.board_id))
            .cloned()
            .collect())
    }

    async fn execute(&self, ctx: &RequestContext, command: &TaskCommand) -> Result<Option<Task>, RemoteError> {
        self.check_online()?;
        let mut state = self.state();
        state.calls.execute += 1;
        if let Some(error) = state.failing_commands.clone() {
            return Err(error);
        }

        let task_id = match command {
            TaskCommand::Create { task: new_task } => {
                state.next_task += 1;
                let mut created = task(
                    &format!("task-{}", state.next_task),
                    ctx.tenant_id.as_str(),
                    new_task.board_id.as_str(),
                    new_task.status,
                );
                created.title.clone_from(&new_task.title);
                created.priority = new_task.priority;
                created.due_date = new_task.due_date;
                created.assignees.clone_from(&new_task.assignees);
                created.kinds.clone_from(&new_task.kinds);
                created.owner_id = ctx.user_id.clone();
                state.tasks.push(created.clone());
                return Ok(Some(created));
            }
            TaskCommand::UpdateStatus { task_id, .. }
            | TaskCommand::UpdateDetails { task_id, .. }
            | TaskCommand::Delete { task_id }
            | TaskCommand::AssignToBoard { task_id, .. }
            | TaskCommand::AssignToTenant { task_id, .. }
            | TaskCommand::SetFavorite { task_id, .. } => task_id,
        };
        let Some(index) = state
            .tasks
            .iter()
            .position(|task| &task.id == task_id && task.tenant_id == ctx.tenant_id)
        else {
            return Err(RemoteError::Status {
                status: 404,
                message: format!("task {task_id} not found"),
            });
        };

        if matches!(command, TaskCommand::Delete { .. }) {
            state.tasks.remove(index);
            return Ok(None);
        }
        let task = &mut state.tasks[index];
        match command {
            TaskCommand::UpdateStatus { status, .. } => task.status = *status,
            TaskCommand::UpdateDetails { patch, .. } => patch.apply_to(task),
            TaskCommand::AssignToBoard { board_id, .. } => task.board_id = board_id.clone(),
            TaskCommand::AssignToTenant { tenant_id, .. } => task.tenant_id = tenant_id.clone(),
            TaskCommand::SetFavorite { favorite, .. } => task.is_favorite = *favorite,
            TaskCommand::Create { .. } | TaskCommand::Delete { .. } => {}
        }
        Ok(Some(task.clone()))
    }
}

/// Minimal manual task.
pub fn task(id: &str, tenant: &str, board: &str, status: TaskStatus) -> Task {
    Task {
        id: TaskId::new(id),
        tenant_id: TenantId::new(tenant),
        board_id: BoardId::new(board),
        title: format!("Task {id}"),
        status,
        priority: Priority::Medium,
        due_date: None,
        owner_id: UserId::new("owner"),
        assignees: Default::default(),
        kinds: Vec::new(),
        checklist: Vec::new(),
        comments: Vec::new(),
        attachments: Vec::new(),
        activity_log: Vec::new(),
        is_favorite: false,
        source_type: SourceType::Manual,
    }
}
