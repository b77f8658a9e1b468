//! Manually curated task order layered over server task lists.
//!
//! The overlay expresses *order*, never *membership*: after every reconcile
//! the ids stored for a `(tenant, board, status)` column are exactly the ids
//! the server reports in that column.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::cache::CacheKey;
use crate::cache::DurableCache;
use crate::cache::read_json;
use crate::cache::write_json;
use crate::model::BoardId;
use crate::model::TaskId;
use crate::model::TaskStatus;
use crate::model::TenantId;

const NAMESPACE: &str = "task-order";

/// Column orders for one board.
pub type BoardOrder = BTreeMap<TaskStatus, Vec<TaskId>>;

/// Drop position for [`OrderingEngine::move_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveTarget {
    /// Insert immediately before this task. Falls back to the end of the
    /// destination column when the task is not in that column.
    Before(TaskId),
    /// Column-level drop without a neighbour: append.
    End,
}

pub struct OrderingEngine {
    cache: Arc<dyn DurableCache>,
    boards: Mutex<HashMap<(TenantId, BoardId), BoardOrder>>,
}

impl OrderingEngine {
    pub fn new(cache: Arc<dyn DurableCache>) -> Self {
        Self {
            cache,
            boards: Mutex::new(HashMap::new()),
        }
    }

    fn boards(&self) -> MutexGuard<'_, HashMap<(TenantId, BoardId), BoardOrder>> {
        self.boards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn board_entry<'a>(
        &self,
        boards: &'a mut HashMap<(TenantId, BoardId), BoardOrder>,
        tenant: &TenantId,
        board: &BoardId,
    ) -> &'a mut BoardOrder {
        boards
            .entry((tenant.clone(), board.clone()))
            .or_insert_with(|| {
                read_json(self.cache.as_ref(), &CacheKey::board(NAMESPACE, tenant, board))
                    .unwrap_or_default()
            })
    }

    fn persist(&self, tenant: &TenantId, board: &BoardId, order: &BoardOrder) {
        write_json(
            self.cache.as_ref(),
            &CacheKey::board(NAMESPACE, tenant, board),
            order,
        );
    }

    /// Current order of one column.
    pub fn order(&self, tenant: &TenantId, board: &BoardId, status: TaskStatus) -> Vec<TaskId> {
        let mut boards = self.boards();
        self.board_entry(&mut boards, tenant, board)
            .get(&status)
            .cloned()
            .unwrap_or_default()
    }

    /// Bring the overlay for `statuses_present` in line with the server's task
    /// lists: drop ids that left a column, append newcomers in server order,
    /// keep the relative order of everything retained.
    pub fn reconcile(
        &self,
        tenant: &TenantId,
        board: &BoardId,
        statuses_present: &[TaskStatus],
        tasks_by_status: &BTreeMap<TaskStatus, Vec<TaskId>>,
    ) {
        let mut boards = self.boards();
        let order = self.board_entry(&mut boards, tenant, board);
        for status in statuses_present {
            let present = tasks_by_status.get(status).map(Vec::as_slice).unwrap_or_default();
            let column = order.entry(*status).or_default();
            reconcile_column(column, present);
            if column.is_empty() {
                order.remove(status);
            }
        }
        let snapshot = order.clone();
        drop(boards);
        self.persist(tenant, board, &snapshot);
    }

    /// Move `task` into `status` at `target`. Removing before inserting makes
    /// repeated identical moves idempotent.
    pub fn move_task(
        &self,
        tenant: &TenantId,
        board: &BoardId,
        status: TaskStatus,
        task: &TaskId,
        target: &MoveTarget,
    ) {
        let mut boards = self.boards();
        let order = self.board_entry(&mut boards, tenant, board);
        for column in order.values_mut() {
            column.retain(|id| id != task);
        }

        let column = order.entry(status).or_default();
        let anchor = match target {
            MoveTarget::Before(anchor) => column.iter().position(|id| id == anchor),
            MoveTarget::End => None,
        };
        match anchor {
            Some(index) => column.insert(index, task.clone()),
            None => column.push(task.clone()),
        }
        order.retain(|_, column| !column.is_empty());

        let snapshot = order.clone();
        drop(boards);
        self.persist(tenant, board, &snapshot);
    }

    /// Sort `ids` by the overlay; ids the overlay does not know keep their
    /// relative order after the known ones.
    pub fn sorted(
        &self,
        tenant: &TenantId,
        board: &BoardId,
        status: TaskStatus,
        ids: &[TaskId],
    ) -> Vec<TaskId> {
        let order = self.order(tenant, board, status);
        let rank: HashMap<&TaskId, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let mut sorted = ids.to_vec();
        sorted.sort_by_key(|id| rank.get(id).copied().unwrap_or(usize::MAX));
        sorted
    }
}

fn reconcile_column(column: &mut Vec<TaskId>, present: &[TaskId]) {
    let present_set: HashSet<&TaskId> = present.iter().collect();
    let mut seen = HashSet::new();
    column.retain(|id| present_set.contains(id) && seen.insert(id.clone()));
    for id in present {
        if seen.insert(id.clone()) {
            column.push(id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use pretty_assertions::assert_eq;

    fn ids(raw: &[&str]) -> Vec<TaskId> {
        raw.iter().map(|id| TaskId::new(*id)).collect()
    }

    fn engine() -> (Arc<MemoryCache>, OrderingEngine) {
        let cache = Arc::new(MemoryCache::new());
        let engine = OrderingEngine::new(cache.clone());
        (cache, engine)
    }

    fn tenant() -> TenantId {
        TenantId::new("h1")
    }

    fn board() -> BoardId {
        BoardId::new("b1")
    }

    #[test]
    fn reconcile_drops_stale_and_appends_new() {
        let (_, engine) = engine();
        let mut lists = BTreeMap::new();
        lists.insert(TaskStatus::Todo, ids(&["a", "b", "c"]));
        engine.reconcile(&tenant(), &board(), &[TaskStatus::Todo], &lists);
        engine.move_task(
            &tenant(),
            &board(),
            TaskStatus::Todo,
            &TaskId::new("c"),
            &MoveTarget::Before(TaskId::new("a")),
        );

        lists.insert(TaskStatus::Todo, ids(&["a", "c", "d"]));
        engine.reconcile(&tenant(), &board(), &[TaskStatus::Todo], &lists);

        assert_eq!(
            engine.order(&tenant(), &board(), TaskStatus::Todo),
            ids(&["c", "a", "d"])
        );
    }

    #[test]
    fn reconcile_only_touches_listed_statuses() {
        let (_, engine) = engine();
        let mut lists = BTreeMap::new();
        lists.insert(TaskStatus::Todo, ids(&["a"]));
        lists.insert(TaskStatus::Done, ids(&["z"]));
        engine.reconcile(&tenant(), &board(), &TaskStatus::ALL, &lists);

        engine.reconcile(&tenant(), &board(), &[TaskStatus::Todo], &BTreeMap::new());

        assert_eq!(engine.order(&tenant(), &board(), TaskStatus::Todo), Vec::new());
        assert_eq!(engine.order(&tenant(), &board(), TaskStatus::Done), ids(&["z"]));
    }

    #[test]
    fn repeated_move_is_idempotent() {
        let (_, engine) = engine();
        let mut lists = BTreeMap::new();
        lists.insert(TaskStatus::Todo, ids(&["a", "b", "x"]));
        engine.reconcile(&tenant(), &board(), &[TaskStatus::Todo], &lists);

        for _ in 0..3 {
            engine.move_task(
                &tenant(),
                &board(),
                TaskStatus::Todo,
                &TaskId::new("x"),
                &MoveTarget::Before(TaskId::new("a")),
            );
        }

        assert_eq!(
            engine.order(&tenant(), &board(), TaskStatus::Todo),
            ids(&["x", "a", "b"])
        );
    }

    #[test]
    fn move_across_columns_and_to_end() {
        let (_, engine) = engine();
        let mut lists = BTreeMap::new();
        lists.insert(TaskStatus::Todo, ids(&["a", "b"]));
        lists.insert(TaskStatus::Done, ids(&["c"]));
        engine.reconcile(&tenant(), &board(), &TaskStatus::ALL, &lists);

        engine.move_task(&tenant(), &board(), TaskStatus::Done, &TaskId::new("a"), &MoveTarget::End);
        engine.move_task(
            &tenant(),
            &board(),
            TaskStatus::Done,
            &TaskId::new("b"),
            &MoveTarget::Before(TaskId::new("missing")),
        );

        assert_eq!(engine.order(&tenant(), &board(), TaskStatus::Todo), Vec::new());
        assert_eq!(
            engine.order(&tenant(), &board(), TaskStatus::Done),
            ids(&["c", "a", "b"])
        );
    }

    #[test]
    fn anchor_in_another_column_appends_to_destination() {
        let (_, engine) = engine();
        let mut lists = BTreeMap::new();
        lists.insert(TaskStatus::Todo, ids(&["a", "x"]));
        lists.insert(TaskStatus::Done, ids(&["d"]));
        engine.reconcile(&tenant(), &board(), &TaskStatus::ALL, &lists);

        engine.move_task(
            &tenant(),
            &board(),
            TaskStatus::Todo,
            &TaskId::new("x"),
            &MoveTarget::Before(TaskId::new("d")),
        );

        assert_eq!(
            engine.order(&tenant(), &board(), TaskStatus::Todo),
            ids(&["a", "x"])
        );
        assert_eq!(engine.order(&tenant(), &board(), TaskStatus::Done), ids(&["d"]));
    }

    #[test]
    fn overlay_survives_restart_through_cache() {
        let (cache, engine) = engine();
        let mut lists = BTreeMap::new();
        lists.insert(TaskStatus::Backlog, ids(&["a", "b"]));
        engine.reconcile(&tenant(), &board(), &[TaskStatus::Backlog], &lists);
        engine.move_task(
            &tenant(),
            &board(),
            TaskStatus::Backlog,
            &TaskId::new("b"),
            &MoveTarget::Before(TaskId::new("a")),
        );

        let restarted = OrderingEngine::new(cache);
        assert_eq!(
            restarted.order(&tenant(), &board(), TaskStatus::Backlog),
            ids(&["b", "a"])
        );
        assert_eq!(
            restarted.sorted(&tenant(), &board(), TaskStatus::Backlog, &ids(&["a", "new", "b"])),
            ids(&["b", "a", "new"])
        );
    }
}
