use async_trait::async_trait;
use chrono::Utc;

use super::DomainSpec;
use super::DomainStore;
use crate::cache::CacheKey;
use crate::cache::DurableCache;
use crate::cache::read_json;
use crate::cache::write_json;
use crate::model::InboxItem;
use crate::model::InboxItemId;
use crate::model::InboxSnapshot;
use crate::model::InboxStatus;
use crate::model::RequestContext;
use crate::model::ScopeId;
use crate::model::Session;
use crate::model::TenantId;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;

const ITEMS: &str = "inbox.items";
const STATUSES: &str = "inbox.statuses";

/// Quick-capture inbox. Cached as two entries (items and the status map).
///
/// Seeding is owner-scoped: a caller only ever pushes the items they created.
#[derive(Debug, Clone, Copy, Default)]
pub struct InboxDomain;

pub type InboxStore = DomainStore<InboxDomain>;

fn key(namespace: &str, tenant: Option<&TenantId>) -> CacheKey {
    match tenant {
        Some(tenant) => CacheKey::tenant(namespace, tenant),
        None => CacheKey::legacy(namespace),
    }
}

#[async_trait]
impl DomainSpec for InboxDomain {
    type State = InboxSnapshot;

    fn name(&self) -> &'static str {
        "inbox"
    }

    fn is_empty(&self, state: &InboxSnapshot) -> bool {
        state.is_empty()
    }

    fn seed(&self, session: &Session, local: &InboxSnapshot) -> Option<InboxSnapshot> {
        Some(local.created_by(&session.user_id))
    }

    async fn fetch(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
    ) -> Result<InboxSnapshot, RemoteError> {
        remote.fetch_inbox(ctx).await
    }

    async fn push(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
        state: &InboxSnapshot,
    ) -> Result<(), RemoteError> {
        remote.put_inbox(ctx, state).await
    }

    fn read_cache(&self, cache: &dyn DurableCache, tenant: Option<&TenantId>) -> Option<InboxSnapshot> {
        let items = read_json(cache, &key(ITEMS, tenant));
        let statuses = read_json(cache, &key(STATUSES, tenant));
        if items.is_none() && statuses.is_none() {
            return None;
        }
        Some(InboxSnapshot {
            items: items.unwrap_or_default(),
            statuses: statuses.unwrap_or_default(),
        })
    }

    fn write_cache(&self, cache: &dyn DurableCache, tenant: Option<&TenantId>, state: &InboxSnapshot) {
        write_json(cache, &key(ITEMS, tenant), &state.items);
        write_json(cache, &key(STATUSES, tenant), &state.statuses);
    }

    fn remove_cache(&self, cache: &dyn DurableCache, tenant: Option<&TenantId>) {
        cache.remove(&key(ITEMS, tenant));
        cache.remove(&key(STATUSES, tenant));
    }
}

impl DomainStore<InboxDomain> {
    /// Items the session's user created, with their effective status.
    pub async fn visible_items(&self, session: &Session) -> Vec<(InboxItem, InboxStatus)> {
        let Some(tenant) = session.tenant_id.as_ref() else {
            return Vec::new();
        };
        let snapshot = self.snapshot(tenant).await;
        snapshot
            .items
            .iter()
            .filter(|item| item.creator_id == session.user_id)
            .map(|item| {
                let status = snapshot.status_of(&item.id).unwrap_or(item.status);
                (item.clone(), status)
            })
            .collect()
    }

    /// Capture a new incoming item. Returns `None` without an active tenant.
    pub async fn capture(&self, session: &Session, title: impl Into<String>) -> Option<InboxItem> {
        let item = InboxItem {
            id: InboxItemId(uuid::Uuid::new_v4().to_string()),
            tenant_id: session.tenant_id.clone()?,
            creator_id: session.user_id.clone(),
            title: title.into(),
            status: InboxStatus::Incoming,
            planned_scope_id: None,
            created_at: Utc::now(),
        };
        self.edit(session, |inbox| {
            inbox.statuses.insert(item.id.clone(), item.status);
            inbox.items.push(item.clone());
        })
        .await?;
        Some(item)
    }

    /// Returns whether the item exists.
    pub async fn set_status(&self, session: &Session, id: &InboxItemId, status: InboxStatus) -> bool {
        self.edit(session, |inbox| {
            let Some(item) = inbox.items.iter_mut().find(|item| &item.id == id) else {
                return false;
            };
            item.status = status;
            inbox.statuses.insert(id.clone(), status);
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Mark an item as planned into `scope` and move it out of the incoming
    /// queue. Returns whether the item exists.
    pub async fn promote(&self, session: &Session, id: &InboxItemId, scope: &ScopeId) -> bool {
        self.edit(session, |inbox| {
            let Some(item) = inbox.items.iter_mut().find(|item| &item.id == id) else {
                return false;
            };
            item.planned_scope_id = Some(scope.clone());
            item.status = InboxStatus::Worked;
            inbox.statuses.insert(id.clone(), InboxStatus::Worked);
            true
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::domain::LoadOutcome;
    use crate::model::UserId;
    use crate::testing::MemoryRemote;
    use pretty_assertions::assert_eq;

    fn item(id: &str, creator: &str) -> InboxItem {
        InboxItem {
            id: InboxItemId::new(id),
            tenant_id: TenantId::new("h1"),
            creator_id: UserId::new(creator),
            title: format!("item {id}"),
            status: InboxStatus::Incoming,
            planned_scope_id: None,
            created_at: Utc::now(),
        }
    }

    fn store() -> (Arc<MemoryRemote>, Arc<MemoryCache>, InboxStore) {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let store = InboxStore::new(InboxDomain, remote.clone(), cache.clone());
        (remote, cache, store)
    }

    #[tokio::test]
    async fn cache_uses_two_keys() {
        let (_, cache, _) = store();
        let snapshot = InboxSnapshot {
            items: vec![item("i1", "u1")],
            statuses: [(InboxItemId::new("i1"), InboxStatus::Later)].into(),
        };
        let tenant = TenantId::new("h1");
        InboxDomain.write_cache(cache.as_ref(), Some(&tenant), &snapshot);

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&CacheKey::tenant(ITEMS, &tenant)).is_some());
        assert!(cache.get(&CacheKey::tenant(STATUSES, &tenant)).is_some());
        assert_eq!(
            InboxDomain.read_cache(cache.as_ref(), Some(&tenant)),
            Some(snapshot)
        );
    }

    #[tokio::test]
    async fn seed_pushes_only_own_items() {
        let (remote, _, store) = store();
        let tenant = TenantId::new("h1");
        store
            .replace_local(
                &tenant,
                InboxSnapshot {
                    items: vec![item("mine", "u1"), item("theirs", "u2")],
                    statuses: Default::default(),
                },
            )
            .await;

        let outcome = store.load(&Session::new("u1", "h1")).await;

        assert_eq!(outcome, LoadOutcome::Seeded);
        let pushed = remote.inbox(&tenant);
        assert_eq!(pushed.items.len(), 1);
        assert_eq!(pushed.items[0].id, InboxItemId::new("mine"));
    }

    #[tokio::test]
    async fn capture_then_promote() {
        let (remote, _, store) = store();
        let session = Session::new("u1", "h1");

        let captured = store.capture(&session, "call the plumber").await.unwrap();
        assert!(
            store
                .promote(&session, &captured.id, &ScopeId::new("s1"))
                .await
        );

        let visible = store.visible_items(&session).await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].1, InboxStatus::Worked);
        assert_eq!(visible[0].0.planned_scope_id, Some(ScopeId::new("s1")));
        assert_eq!(
            remote.inbox(&TenantId::new("h1")).status_of(&captured.id),
            Some(InboxStatus::Worked)
        );
        assert!(store.visible_items(&Session::new("u2", "h1")).await.is_empty());
    }
}
