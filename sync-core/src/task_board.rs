//! In-memory task mirrors.
//!
//! Tasks are server-owned; the client keeps three read-only mirrors of them:
//! - **canonical**: the list for the board currently selected.
//! - **by tenant**: every task of each tenant seen so far.
//! - **scope tasks**: the subset referenced by the tenant's scope windows.
//!
//! Optimistic mutations must update all three or none.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use huddle_async_utils::Flight;
use huddle_async_utils::SingleFlight;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use crate::activation::Activation;
use crate::domain::ChangeCause;
use crate::domain::ScopeStore;
use crate::domain::StoreEvent;
use crate::model::BoardId;
use crate::model::BoardSelector;
use crate::model::Session;
use crate::model::Task;
use crate::model::TaskId;
use crate::model::TaskStatus;
use crate::model::TenantId;
use crate::ordering::OrderingEngine;
use crate::remote::RemoteStore;

pub const TASKS_DOMAIN: &str = "tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    NoTenant,
    Coalesced,
    Unreachable,
    Stale,
    Refreshed { count: usize },
}

#[derive(Debug, Default)]
struct Mirrors {
    canonical: Vec<Task>,
    by_tenant: HashMap<TenantId, Vec<Task>>,
    scope_tasks: HashMap<TenantId, Vec<Task>>,
}

impl Mirrors {
    fn all_lists(&mut self, tenant: &TenantId) -> impl Iterator<Item = &mut Vec<Task>> {
        let canonical = std::iter::once(&mut self.canonical);
        canonical
            .chain(self.by_tenant.get_mut(tenant))
            .chain(self.scope_tasks.get_mut(tenant))
    }
}

pub struct TaskBoard {
    remote: Arc<dyn RemoteStore>,
    ordering: Arc<OrderingEngine>,
    scopes: Arc<ScopeStore>,
    refreshes: SingleFlight<TenantId>,
    selector: StdMutex<BoardSelector>,
    mirrors: RwLock<Mirrors>,
    activation: Activation,
    events: broadcast::Sender<StoreEvent>,
}

impl TaskBoard {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        ordering: Arc<OrderingEngine>,
        scopes: Arc<ScopeStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            remote,
            ordering,
            scopes,
            refreshes: SingleFlight::new(),
            selector: StdMutex::new(BoardSelector::All),
            mirrors: RwLock::new(Mirrors::default()),
            activation: Activation::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn ordering(&self) -> &OrderingEngine {
        &self.ordering
    }

    pub fn activate(&self, tenant: &TenantId) {
        self.activation.activate(tenant);
    }

    pub fn deactivate(&self) {
        self.activation.deactivate();
    }

    pub fn selector(&self) -> BoardSelector {
        self.selector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Choose which board the canonical mirror follows. Takes effect on the
    /// next refresh.
    pub fn select_board(&self, selector: BoardSelector) {
        *self.selector.lock().unwrap_or_else(PoisonError::into_inner) = selector;
    }

    /// Re-read the task list. Bursts of triggers collapse into one fetch plus
    /// at most one trailing fetch.
    pub async fn refresh(&self, session: &Session) -> RefreshOutcome {
        let Some(ctx) = session.context() else {
            return RefreshOutcome::NoTenant;
        };
        let epoch = self.activation.epoch();
        let outcome = StdMutex::new(RefreshOutcome::Coalesced);
        let flight = self
            .refreshes
            .run(ctx.tenant_id.clone(), || async {
                let selector = self.selector();
                let result = match self.remote.list_tasks(&ctx, &selector).await {
                    Err(e) => {
                        tracing::debug!("Task refresh for {} skipped: {e}", ctx.tenant_id);
                        RefreshOutcome::Unreachable
                    }
                    Ok(_) if !self.activation.is_current(epoch) => RefreshOutcome::Stale,
                    Ok(tasks) => {
                        let count = tasks.len();
                        self.apply(&ctx.tenant_id, &selector, tasks).await;
                        RefreshOutcome::Refreshed { count }
                    }
                };
                *outcome.lock().unwrap_or_else(PoisonError::into_inner) = result;
            })
            .await;
        match flight {
            Flight::Coalesced => RefreshOutcome::Coalesced,
            Flight::Completed { .. } => outcome.into_inner().unwrap_or_else(PoisonError::into_inner),
        }
    }

    async fn apply(&self, tenant: &TenantId, selector: &BoardSelector, tasks: Vec<Task>) {
        let mut boards: BTreeMap<BoardId, BTreeMap<TaskStatus, Vec<TaskId>>> = BTreeMap::new();
        if let BoardSelector::Board(board) = selector {
            boards.entry(board.clone()).or_default();
        }
        for task in &tasks {
            boards
                .entry(task.board_id.clone())
                .or_default()
                .entry(task.status)
                .or_default()
                .push(task.id.clone());
        }
        for (board, by_status) in &boards {
            self.ordering
                .reconcile(tenant, board, &TaskStatus::ALL, by_status);
        }

        {
            let mut mirrors = self.mirrors.write().await;
            let tenant_list = mirrors.by_tenant.entry(tenant.clone()).or_default();
            match selector {
                BoardSelector::All => tenant_list.clone_from(&tasks),
                BoardSelector::Board(board) => {
                    tenant_list.retain(|task| &task.board_id != board);
                    tenant_list.extend(tasks.iter().cloned());
                }
            }
            mirrors.canonical = tasks;
        }
        self.sync_scope_tasks(tenant).await;
        self.notify(tenant, ChangeCause::Loaded);
    }

    /// Recompute the scope-task mirror from the tenant's scope windows.
    pub async fn sync_scope_tasks(&self, tenant: &TenantId) {
        let referenced: BTreeSet<TaskId> = self
            .scopes
            .snapshot(tenant)
            .await
            .scopes
            .into_iter()
            .flat_map(|scope| scope.task_ids)
            .collect();
        let mut mirrors = self.mirrors.write().await;
        let subset: Vec<Task> = mirrors
            .by_tenant
            .get(tenant)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|task| referenced.contains(&task.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        mirrors.scope_tasks.insert(tenant.clone(), subset);
    }

    pub async fn canonical(&self) -> Vec<Task> {
        self.mirrors.read().await.canonical.clone()
    }

    pub async fn tenant_tasks(&self, tenant: &TenantId) -> Vec<Task> {
        self.mirrors
            .read()
            .await
            .by_tenant
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn scope_tasks(&self, tenant: &TenantId) -> Vec<Task> {
        self.mirrors
            .read()
            .await
            .scope_tasks
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn task(&self, tenant: &TenantId, id: &TaskId) -> Option<Task> {
        let mirrors = self.mirrors.read().await;
        mirrors
            .by_tenant
            .get(tenant)
            .and_then(|tasks| tasks.iter().find(|task| &task.id == id))
            .or_else(|| {
                mirrors
                    .canonical
                    .iter()
                    .find(|task| &task.id == id && &task.tenant_id == tenant)
            })
            .cloned()
    }

    /// One board column, ordered by the overlay.
    pub async fn column(&self, tenant: &TenantId, board: &BoardId, status: TaskStatus) -> Vec<Task> {
        let tasks: Vec<Task> = self
            .tenant_tasks(tenant)
            .await
            .into_iter()
            .filter(|task| &task.board_id == board && task.status == status)
            .collect();
        let ids: Vec<TaskId> = tasks.iter().map(|task| task.id.clone()).collect();
        let order = self.ordering.sorted(tenant, board, status, &ids);
        let mut by_id: HashMap<TaskId, Task> =
            tasks.into_iter().map(|task| (task.id.clone(), task)).collect();
        order.iter().filter_map(|id| by_id.remove(id)).collect()
    }

    /// Apply `edit` to every mirrored copy of the task. Returns whether any
    /// copy was found.
    pub async fn update_task(
        &self,
        tenant: &TenantId,
        id: &TaskId,
        edit: impl Fn(&mut Task),
    ) -> bool {
        let found = {
            let mut mirrors = self.mirrors.write().await;
            let mut found = false;
            for list in mirrors.all_lists(tenant) {
                for task in list.iter_mut().filter(|task| &task.id == id) {
                    edit(task);
                    found = true;
                }
            }
            found
        };
        if found {
            self.notify(tenant, ChangeCause::Local);
        }
        found
    }

    /// Add a task the remote just created.
    pub async fn insert_task(&self, task: Task) {
        let tenant = task.tenant_id.clone();
        {
            let mut mirrors = self.mirrors.write().await;
            let selected = self.selector().matches(&task.board_id);
            if selected && !mirrors.canonical.iter().any(|t| t.id == task.id) {
                mirrors.canonical.push(task.clone());
            }
            let list = mirrors.by_tenant.entry(tenant.clone()).or_default();
            if !list.iter().any(|t| t.id == task.id) {
                list.push(task);
            }
        }
        self.notify(&tenant, ChangeCause::Local);
    }

    /// Drop a task from every mirror, returning the removed copy.
    pub async fn remove_task(&self, tenant: &TenantId, id: &TaskId) -> Option<Task> {
        let removed = {
            let mut mirrors = self.mirrors.write().await;
            let mut removed = None;
            for list in mirrors.all_lists(tenant) {
                if let Some(index) = list.iter().position(|task| &task.id == id) {
                    removed = Some(list.remove(index));
                }
            }
            removed
        };
        if removed.is_some() {
            self.notify(tenant, ChangeCause::Local);
        }
        removed
    }

    fn notify(&self, tenant: &TenantId, cause: ChangeCause) {
        let _ = self.events.send(StoreEvent {
            domain: TASKS_DOMAIN,
            tenant_id: tenant.clone(),
            cause,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::domain::ScopeDomain;
    use crate::model::ScopeWindow;
    use crate::model::ScopeWindowsState;
    use crate::model::UserId;
    use crate::testing::MemoryRemote;
    use crate::testing::task;
    use pretty_assertions::assert_eq;

    fn board(remote: &Arc<MemoryRemote>) -> (Arc<ScopeStore>, TaskBoard) {
        let cache = Arc::new(MemoryCache::new());
        let scopes = Arc::new(ScopeStore::new(ScopeDomain, remote.clone(), cache.clone()));
        let ordering = Arc::new(OrderingEngine::new(cache));
        let board = TaskBoard::new(remote.clone(), ordering, scopes.clone());
        (scopes, board)
    }

    #[tokio::test]
    async fn refresh_fills_mirrors_and_reconciles_order() {
        let remote = Arc::new(MemoryRemote::new());
        let tenant = TenantId::new("h1");
        remote.put_task(task("a", "h1", "b1", TaskStatus::Todo));
        remote.put_task(task("b", "h1", "b1", TaskStatus::Todo));
        remote.put_task(task("c", "h1", "b2", TaskStatus::Done));
        let (scopes, board) = board(&remote);
        let mut scope = ScopeWindow::new(tenant.clone(), "Sprint", UserId::new("u1"));
        scope.task_ids = vec![TaskId::new("c")];
        scopes
            .replace_local(&tenant, ScopeWindowsState { scopes: vec![scope] })
            .await;

        let outcome = board.refresh(&Session::new("u1", "h1")).await;

        assert_eq!(outcome, RefreshOutcome::Refreshed { count: 3 });
        assert_eq!(board.canonical().await.len(), 3);
        assert_eq!(board.scope_tasks(&tenant).await.len(), 1);
        assert_eq!(
            board
                .ordering()
                .order(&tenant, &BoardId::new("b1"), TaskStatus::Todo),
            vec![TaskId::new("a"), TaskId::new("b")]
        );
    }

    #[tokio::test]
    async fn update_reaches_every_mirror() {
        let remote = Arc::new(MemoryRemote::new());
        let tenant = TenantId::new("h1");
        remote.put_task(task("a", "h1", "b1", TaskStatus::Todo));
        let (scopes, board) = board(&remote);
        let mut scope = ScopeWindow::new(tenant.clone(), "Sprint", UserId::new("u1"));
        scope.task_ids = vec![TaskId::new("a")];
        scopes
            .replace_local(&tenant, ScopeWindowsState { scopes: vec![scope] })
            .await;
        board.refresh(&Session::new("u1", "h1")).await;

        let found = board
            .update_task(&tenant, &TaskId::new("a"), |task| task.status = TaskStatus::Done)
            .await;

        assert!(found);
        assert_eq!(board.canonical().await[0].status, TaskStatus::Done);
        assert_eq!(board.tenant_tasks(&tenant).await[0].status, TaskStatus::Done);
        assert_eq!(board.scope_tasks(&tenant).await[0].status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn unreachable_remote_keeps_mirrors() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_task(task("a", "h1", "b1", TaskStatus::Todo));
        let (_, board) = board(&remote);
        let session = Session::new("u1", "h1");
        board.refresh(&session).await;

        remote.set_offline(true);
        assert_eq!(board.refresh(&session).await, RefreshOutcome::Unreachable);
        assert_eq!(board.canonical().await.len(), 1);
    }

    #[tokio::test]
    async fn board_selection_limits_canonical() {
        let remote = Arc::new(MemoryRemote::new());
        remote.put_task(task("a", "h1", "b1", TaskStatus::Todo));
        remote.put_task(task("b", "h1", "b2", TaskStatus::Todo));
        let (_, board) = board(&remote);
        let session = Session::new("u1", "h1");
        board.refresh(&session).await;

        board.select_board(BoardSelector::Board(BoardId::new("b2")));
        board.refresh(&session).await;

        let canonical: Vec<TaskId> = board.canonical().await.into_iter().map(|t| t.id).collect();
        assert_eq!(canonical, vec![TaskId::new("b")]);
        assert_eq!(board.tenant_tasks(&TenantId::new("h1")).await.len(), 2);
    }
}
