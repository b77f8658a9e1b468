//! Domain stores and the merge protocol they share.
//!
//! Inbox, scope windows and timeline overrides all synchronize the same way;
//! a [`DomainSpec`] supplies the domain-specific parts (remote endpoints,
//! cache layout, seed authority) and [`DomainStore`] runs the protocol:
//!
//! - **load**: single-flight per tenant. Arms the sync marker before the
//!   remote read, adopts a non-empty remote result outright, seeds the remote
//!   from the local fallback only when the remote is empty and the caller has
//!   authority, otherwise adopts empty state. Transport failures leave local
//!   state untouched.
//! - **save**: the cache is always written. A save that follows a load is the
//!   load's own echo and skips the remote exactly once; every other save
//!   writes through (remote write single-flighted per tenant).

mod inbox;
mod scopes;
mod timeline;

pub use inbox::InboxDomain;
pub use inbox::InboxStore;
pub use scopes::ScopeDomain;
pub use scopes::ScopeStore;
pub use timeline::TimelineDomain;
pub use timeline::TimelineStore;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use huddle_async_utils::Flight;
use huddle_async_utils::SingleFlight;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::broadcast;

use crate::activation::Activation;
use crate::cache::CacheKey;
use crate::cache::DurableCache;
use crate::cache::read_json;
use crate::cache::write_json;
use crate::model::RequestContext;
use crate::model::Session;
use crate::model::TenantId;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;

/// Domain-specific half of the merge protocol.
#[async_trait]
pub trait DomainSpec: Send + Sync + 'static {
    type State: Clone
        + Default
        + PartialEq
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Short name used for cache keys and logs.
    fn name(&self) -> &'static str;

    fn is_empty(&self, state: &Self::State) -> bool;

    /// What `session` may push to seed an empty remote from `local`, or
    /// `None` without write authority.
    fn seed(&self, session: &Session, local: &Self::State) -> Option<Self::State>;

    async fn fetch(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
    ) -> Result<Self::State, RemoteError>;

    async fn push(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
        state: &Self::State,
    ) -> Result<(), RemoteError>;

    /// Cache key for a tenant, or the legacy pre-tenant key for `None`.
    fn cache_key(&self, tenant: Option<&TenantId>) -> CacheKey {
        match tenant {
            Some(tenant) => CacheKey::tenant(self.name(), tenant),
            None => CacheKey::legacy(self.name()),
        }
    }

    fn read_cache(&self, cache: &dyn DurableCache, tenant: Option<&TenantId>) -> Option<Self::State> {
        read_json(cache, &self.cache_key(tenant))
    }

    fn write_cache(&self, cache: &dyn DurableCache, tenant: Option<&TenantId>, state: &Self::State) {
        write_json(cache, &self.cache_key(tenant), state);
    }

    fn remove_cache(&self, cache: &dyn DurableCache, tenant: Option<&TenantId>) {
        cache.remove(&self.cache_key(tenant));
    }
}

/// Per-store marker that breaks the load → save → load feedback loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMarker {
    pub last_fetch_tenant_id: Option<TenantId>,
    pub suppress_next_save: bool,
}

impl SyncMarker {
    fn arm(&mut self, tenant: &TenantId) {
        self.last_fetch_tenant_id = Some(tenant.clone());
        self.suppress_next_save = true;
    }

    fn disarm(&mut self, tenant: &TenantId) {
        if self.last_fetch_tenant_id.as_ref() == Some(tenant) {
            self.suppress_next_save = false;
        }
    }

    /// Consume the suppression if it was armed for `tenant`.
    fn consume(&mut self, tenant: &TenantId) -> bool {
        if self.suppress_next_save && self.last_fetch_tenant_id.as_ref() == Some(tenant) {
            self.suppress_next_save = false;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Session has no active tenant; nothing was requested.
    NoTenant,
    /// Another load for this tenant was in flight; a re-run was queued.
    Coalesced,
    /// Remote read failed; local state stays authoritative.
    Unreachable,
    /// Tenant changed while the read was in flight; result discarded.
    Stale,
    /// Remote held data and replaced local state.
    AdoptedRemote,
    /// Remote was empty; local fallback was pushed as the seed and kept.
    Seeded,
    /// Nothing to adopt anywhere (or no authority to seed); state is empty.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    NoTenant,
    /// Echo of a load; nothing written.
    Suppressed,
    /// Remote and cache written.
    Written,
    /// A remote write was in flight; it will re-run with the latest state.
    Queued,
    /// Cache written, remote write failed and was logged.
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    /// State came from the remote.
    Loaded,
    /// Local fallback was pushed as the seed.
    Seeded,
    /// Local mutation or cache hydration.
    Local,
}

/// Published after a store applies new state for a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub domain: &'static str,
    pub tenant_id: TenantId,
    pub cause: ChangeCause,
}

const EVENT_CAPACITY: usize = 64;

/// One synchronized domain: in-memory state per tenant plus the protocol
/// that reconciles it with the durable cache and the remote store.
pub struct DomainStore<D: DomainSpec> {
    spec: D,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<dyn DurableCache>,
    loads: SingleFlight<TenantId>,
    saves: SingleFlight<TenantId>,
    marker: Mutex<SyncMarker>,
    states: RwLock<HashMap<TenantId, D::State>>,
    /// Activation epoch of the last load that reconciled each tenant.
    synced: StdMutex<HashMap<TenantId, u64>>,
    activation: Activation,
    events: broadcast::Sender<StoreEvent>,
}

impl<D: DomainSpec> DomainStore<D> {
    pub fn new(spec: D, remote: Arc<dyn RemoteStore>, cache: Arc<dyn DurableCache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            spec,
            remote,
            cache,
            loads: SingleFlight::new(),
            saves: SingleFlight::new(),
            marker: Mutex::new(SyncMarker::default()),
            states: RwLock::new(HashMap::new()),
            synced: StdMutex::new(HashMap::new()),
            activation: Activation::new(),
            events,
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub async fn sync_marker(&self) -> SyncMarker {
        self.marker.lock().await.clone()
    }

    /// Whether a load in the current activation reconciled `tenant` with the
    /// remote (adopted, seeded or confirmed empty). Until then the local state
    /// may be stale and must not overwrite the remote wholesale.
    pub fn is_synced(&self, tenant: &TenantId) -> bool {
        let epoch = self.activation.epoch();
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tenant)
            .is_some_and(|synced| *synced == epoch)
    }

    pub fn active_tenant(&self) -> Option<TenantId> {
        self.activation.active_tenant()
    }

    /// Switch the active tenant. Loads still in flight for the previous
    /// activation complete but their results are dropped.
    pub fn activate(&self, tenant: &TenantId) {
        self.activation.activate(tenant);
    }

    pub fn deactivate(&self) {
        self.activation.deactivate();
    }

    /// Current in-memory state for `tenant` (empty when never loaded).
    pub async fn snapshot(&self, tenant: &TenantId) -> D::State {
        self.states
            .read()
            .await
            .get(tenant)
            .cloned()
            .unwrap_or_default()
    }

    /// Populate memory from the durable cache so the UI has something to show
    /// before the first remote round trip. No-op when memory already holds
    /// state for the tenant.
    pub async fn hydrate(&self, session: &Session) {
        let Some(tenant) = session.tenant_id.as_ref() else {
            return;
        };
        if self.states.read().await.contains_key(tenant) {
            return;
        }
        self.migrate_legacy(session, tenant);
        if let Some(cached) = self.spec.read_cache(self.cache.as_ref(), Some(tenant)) {
            self.states.write().await.insert(tenant.clone(), cached);
            self.notify(tenant, ChangeCause::Local);
        }
    }

    /// Reconcile `session`'s tenant against the remote.
    pub async fn load(&self, session: &Session) -> LoadOutcome {
        let Some(ctx) = session.context() else {
            return LoadOutcome::NoTenant;
        };
        let epoch = self.activation.epoch();
        let outcome = StdMutex::new(LoadOutcome::Coalesced);
        let flight = self
            .loads
            .run(ctx.tenant_id.clone(), || async {
                let result = self.load_once(session, &ctx, epoch).await;
                *outcome.lock().unwrap_or_else(PoisonError::into_inner) = result;
            })
            .await;
        match flight {
            Flight::Coalesced => {
                tracing::debug!("{} load for {} coalesced", self.name(), ctx.tenant_id);
                LoadOutcome::Coalesced
            }
            Flight::Completed { .. } => outcome.into_inner().unwrap_or_else(PoisonError::into_inner),
        }
    }

    async fn load_once(&self, session: &Session, ctx: &RequestContext, epoch: u64) -> LoadOutcome {
        let tenant = &ctx.tenant_id;
        self.marker.lock().await.arm(tenant);

        let fetched = match self.spec.fetch(self.remote.as_ref(), ctx).await {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("{} load for {tenant} skipped, remote unavailable: {e}", self.name());
                self.marker.lock().await.disarm(tenant);
                return LoadOutcome::Unreachable;
            }
        };
        if !self.activation.is_current(epoch) {
            return self.discard_stale(tenant).await;
        }

        if !self.spec.is_empty(&fetched) {
            self.adopt(tenant, fetched, ChangeCause::Loaded, epoch).await;
            return LoadOutcome::AdoptedRemote;
        }

        let seed = self
            .local_fallback(session, tenant)
            .await
            .filter(|local| !self.spec.is_empty(local))
            .and_then(|local| self.spec.seed(session, &local))
            .filter(|seed| !self.spec.is_empty(seed));

        let Some(seed) = seed else {
            self.adopt(tenant, D::State::default(), ChangeCause::Loaded, epoch)
                .await;
            return LoadOutcome::Empty;
        };

        match self.spec.push(self.remote.as_ref(), ctx, &seed).await {
            Ok(()) => tracing::info!("Seeded remote {} for {tenant} from local state", self.name()),
            Err(e) => tracing::warn!("Seeding remote {} for {tenant} failed: {e}", self.name()),
        }
        if !self.activation.is_current(epoch) {
            return self.discard_stale(tenant).await;
        }
        self.adopt(tenant, seed, ChangeCause::Seeded, epoch).await;
        LoadOutcome::Seeded
    }

    async fn discard_stale(&self, tenant: &TenantId) -> LoadOutcome {
        tracing::debug!("{} load for {tenant} finished after tenant switch; discarded", self.name());
        self.marker.lock().await.disarm(tenant);
        LoadOutcome::Stale
    }

    /// In-memory state, else the cached value (after legacy migration).
    async fn local_fallback(&self, session: &Session, tenant: &TenantId) -> Option<D::State> {
        if let Some(state) = self.states.read().await.get(tenant)
            && !self.spec.is_empty(state)
        {
            return Some(state.clone());
        }
        self.migrate_legacy(session, tenant);
        self.spec.read_cache(self.cache.as_ref(), Some(tenant))
    }

    /// Re-key a pre-tenant cache value under the single tenant the user
    /// belongs to. Runs at most once: the legacy entry is removed afterwards.
    fn migrate_legacy(&self, session: &Session, tenant: &TenantId) {
        if session.memberships.len() != 1 || session.memberships.first() != Some(tenant) {
            return;
        }
        let cache = self.cache.as_ref();
        if self.spec.read_cache(cache, Some(tenant)).is_some() {
            return;
        }
        let Some(legacy) = self.spec.read_cache(cache, None) else {
            return;
        };
        tracing::info!("Migrating legacy {} cache entry to tenant {tenant}", self.name());
        self.spec.write_cache(cache, Some(tenant), &legacy);
        self.spec.remove_cache(cache, None);
    }

    async fn adopt(&self, tenant: &TenantId, state: D::State, cause: ChangeCause, epoch: u64) {
        self.spec.write_cache(self.cache.as_ref(), Some(tenant), &state);
        self.states.write().await.insert(tenant.clone(), state);
        self.synced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant.clone(), epoch);
        self.notify(tenant, cause);
    }

    /// Persist `state` as the tenant's new local state.
    ///
    /// This is the entry point for observers that persist the store whenever
    /// it changes: the first save after a load is that load's own echo and
    /// does not reach the remote. Explicit user edits go through
    /// [`Self::edit`] instead.
    pub async fn save(&self, session: &Session, state: D::State) -> SaveOutcome {
        let Some(ctx) = session.context() else {
            return SaveOutcome::NoTenant;
        };
        let tenant = &ctx.tenant_id;
        self.spec.write_cache(self.cache.as_ref(), Some(tenant), &state);
        self.states.write().await.insert(tenant.clone(), state);
        self.notify(tenant, ChangeCause::Local);

        if self.marker.lock().await.consume(tenant) {
            tracing::debug!("{} save for {tenant} suppressed (load echo)", self.name());
            return SaveOutcome::Suppressed;
        }
        self.flush(&ctx).await
    }

    /// Apply a user edit to the tenant's state and write it through. An edit
    /// is never mistaken for a load echo. `None` without an active tenant.
    pub async fn edit<R>(&self, session: &Session, f: impl FnOnce(&mut D::State) -> R) -> Option<R> {
        let tenant = session.tenant_id.as_ref()?;
        let result = self.update(tenant, f).await;
        self.persist(session).await;
        Some(result)
    }

    /// Write the current in-memory state through to cache and remote,
    /// superseding any pending load echo.
    pub async fn persist(&self, session: &Session) -> SaveOutcome {
        let Some(ctx) = session.context() else {
            return SaveOutcome::NoTenant;
        };
        let tenant = &ctx.tenant_id;
        self.marker.lock().await.disarm(tenant);
        let current = self.snapshot(tenant).await;
        self.spec.write_cache(self.cache.as_ref(), Some(tenant), &current);
        self.flush(&ctx).await
    }

    /// Write the tenant's latest in-memory state to the remote. Re-runs
    /// requested while a write is in flight push whatever is latest then.
    async fn flush(&self, ctx: &RequestContext) -> SaveOutcome {
        let failed = StdMutex::new(false);
        let flight = self
            .saves
            .run(ctx.tenant_id.clone(), || async {
                let latest = self.snapshot(&ctx.tenant_id).await;
                let result = self.spec.push(self.remote.as_ref(), ctx, &latest).await;
                if let Err(e) = &result {
                    tracing::warn!("{} save for {} failed: {e}", self.name(), ctx.tenant_id);
                }
                *failed.lock().unwrap_or_else(PoisonError::into_inner) = result.is_err();
            })
            .await;
        match flight {
            Flight::Coalesced => SaveOutcome::Queued,
            Flight::Completed { .. } => {
                if failed.into_inner().unwrap_or_else(PoisonError::into_inner) {
                    SaveOutcome::Deferred
                } else {
                    SaveOutcome::Written
                }
            }
        }
    }

    /// Write-through used by user-initiated mutations that must know the
    /// remote outcome (so they can roll back). Supersedes any pending load
    /// echo for the tenant.
    pub async fn commit(&self, session: &Session) -> Result<(), RemoteError> {
        let Some(ctx) = session.context() else {
            return Ok(());
        };
        let tenant = &ctx.tenant_id;
        self.marker.lock().await.disarm(tenant);
        let current = self.snapshot(tenant).await;
        self.spec.push(self.remote.as_ref(), &ctx, &current).await?;
        self.spec.write_cache(self.cache.as_ref(), Some(tenant), &current);
        Ok(())
    }

    /// Replace in-memory state without touching cache or remote. Used for
    /// optimistic apply and rollback.
    pub async fn replace_local(&self, tenant: &TenantId, state: D::State) {
        self.states.write().await.insert(tenant.clone(), state);
        self.notify(tenant, ChangeCause::Local);
    }

    /// Mutate in-memory state atomically. Nothing is persisted.
    pub async fn update<R>(&self, tenant: &TenantId, f: impl FnOnce(&mut D::State) -> R) -> R {
        let result = {
            let mut states = self.states.write().await;
            f(states.entry(tenant.clone()).or_default())
        };
        self.notify(tenant, ChangeCause::Local);
        result
    }

    fn notify(&self, tenant: &TenantId, cause: ChangeCause) {
        // No subscribers is fine.
        let _ = self.events.send(StoreEvent {
            domain: self.name(),
            tenant_id: tenant.clone(),
            cause,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::ScopeWindow;
    use crate::model::ScopeWindowsState;
    use crate::model::TaskId;
    use crate::model::TenantRole;
    use crate::model::UserId;
    use crate::testing::MemoryRemote;
    use pretty_assertions::assert_eq;

    fn admin() -> Session {
        Session::new("u1", "h1").with_role(TenantRole::Admin)
    }

    fn sprint(name: &str) -> ScopeWindowsState {
        let mut scope = ScopeWindow::new(TenantId::new("h1"), name, UserId::new("u1"));
        scope.task_ids = vec![TaskId::new("a"), TaskId::new("b"), TaskId::new("c")];
        ScopeWindowsState {
            scopes: vec![scope],
        }
    }

    fn store(remote: &Arc<MemoryRemote>, cache: &Arc<MemoryCache>) -> ScopeStore {
        ScopeStore::new(
            ScopeDomain,
            Arc::clone(remote) as Arc<dyn RemoteStore>,
            Arc::clone(cache) as Arc<dyn DurableCache>,
        )
    }

    #[tokio::test]
    async fn no_tenant_is_a_no_op() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store(&remote, &Arc::new(MemoryCache::new()));
        let mut session = admin();
        session.tenant_id = None;

        assert_eq!(store.load(&session).await, LoadOutcome::NoTenant);
        assert_eq!(
            store.save(&session, sprint("x")).await,
            SaveOutcome::NoTenant
        );
        assert_eq!(remote.calls().fetch_scopes, 0);
    }

    #[tokio::test]
    async fn transport_failure_keeps_local_state_and_disarms() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let store = store(&remote, &cache);
        let session = admin();
        let local = sprint("Sprint 1");
        store.replace_local(&TenantId::new("h1"), local.clone()).await;

        remote.set_offline(true);
        assert_eq!(store.load(&session).await, LoadOutcome::Unreachable);
        assert_eq!(store.snapshot(&TenantId::new("h1")).await, local);
        assert!(!store.sync_marker().await.suppress_next_save);
    }

    #[tokio::test]
    async fn remote_empty_without_authority_adopts_empty() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let store = store(&remote, &cache);
        let member = Session::new("u2", "h1");
        store.replace_local(&TenantId::new("h1"), sprint("Sprint 1")).await;

        assert_eq!(store.load(&member).await, LoadOutcome::Empty);
        assert_eq!(
            store.snapshot(&TenantId::new("h1")).await,
            ScopeWindowsState::default()
        );
        assert_eq!(remote.scopes(&TenantId::new("h1")), ScopeWindowsState::default());
        assert_eq!(remote.calls().put_scopes, 0);
    }

    #[tokio::test]
    async fn stale_result_is_discarded_after_tenant_switch() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_scopes(&TenantId::new("h1"), sprint("Remote"));
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(store(&remote, &cache));
        store.activate(&TenantId::new("h1"));

        let gate = remote.hold_fetches();
        let pending = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.load(&admin()).await })
        };
        remote.wait_for_held_fetch().await;
        store.activate(&TenantId::new("h2"));
        gate.release();

        assert_eq!(pending.await.unwrap(), LoadOutcome::Stale);
        assert_eq!(
            store.snapshot(&TenantId::new("h1")).await,
            ScopeWindowsState::default()
        );
    }

    #[tokio::test]
    async fn legacy_entry_is_migrated_once_for_single_membership() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let legacy = sprint("Legacy");
        write_json(cache.as_ref(), &CacheKey::legacy("scopes"), &legacy);
        let store = store(&remote, &cache);

        assert_eq!(store.load(&admin()).await, LoadOutcome::Seeded);
        assert_eq!(remote.scopes(&TenantId::new("h1")), legacy);
        assert_eq!(cache.get(&CacheKey::legacy("scopes")), None);
        assert_eq!(
            read_json::<ScopeWindowsState>(
                cache.as_ref(),
                &CacheKey::tenant("scopes", &TenantId::new("h1"))
            ),
            Some(legacy)
        );
    }

    #[tokio::test]
    async fn legacy_entry_ignored_with_several_memberships() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        write_json(cache.as_ref(), &CacheKey::legacy("scopes"), &sprint("Legacy"));
        let store = store(&remote, &cache);
        let session = admin().with_memberships(vec![TenantId::new("h1"), TenantId::new("h2")]);

        assert_eq!(store.load(&session).await, LoadOutcome::Empty);
        assert!(cache.get(&CacheKey::legacy("scopes")).is_some());
    }

    #[tokio::test]
    async fn failed_remote_save_still_writes_cache() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let store = store(&remote, &cache);
        remote.set_offline(true);
        let offline = sprint("Offline");

        let outcome = store.save(&admin(), offline.clone()).await;

        assert_eq!(outcome, SaveOutcome::Deferred);
        assert_eq!(
            read_json::<ScopeWindowsState>(
                cache.as_ref(),
                &CacheKey::tenant("scopes", &TenantId::new("h1"))
            ),
            Some(offline)
        );
    }

    #[tokio::test]
    async fn suppressed_save_still_writes_cache() {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed_scopes(&TenantId::new("h1"), sprint("Remote"));
        let cache = Arc::new(MemoryCache::new());
        let store = store(&remote, &cache);
        let session = admin();
        store.load(&session).await;
        let echo = sprint("Echo");

        assert_eq!(store.save(&session, echo.clone()).await, SaveOutcome::Suppressed);

        assert_eq!(remote.calls().put_scopes, 0);
        assert_eq!(
            read_json::<ScopeWindowsState>(
                cache.as_ref(),
                &CacheKey::tenant("scopes", &TenantId::new("h1"))
            ),
            Some(echo)
        );
    }

    #[tokio::test]
    async fn only_completed_loads_mark_the_tenant_synced() {
        let remote = Arc::new(MemoryRemote::new());
        let store = store(&remote, &Arc::new(MemoryCache::new()));
        let tenant = TenantId::new("h1");
        store.activate(&tenant);

        remote.set_offline(true);
        assert_eq!(store.load(&admin()).await, LoadOutcome::Unreachable);
        assert!(!store.is_synced(&tenant));

        remote.set_offline(false);
        assert_eq!(store.load(&admin()).await, LoadOutcome::Empty);
        assert!(store.is_synced(&tenant));

        store.activate(&tenant);
        assert!(!store.is_synced(&tenant));
    }

    #[tokio::test]
    async fn hydrate_reads_cache_before_network() {
        let remote = Arc::new(MemoryRemote::new());
        let cache = Arc::new(MemoryCache::new());
        let cached = sprint("Cached");
        write_json(
            cache.as_ref(),
            &CacheKey::tenant("scopes", &TenantId::new("h1")),
            &cached,
        );
        let store = store(&remote, &cache);
        let mut events = store.subscribe();

        store.hydrate(&admin()).await;

        assert_eq!(store.snapshot(&TenantId::new("h1")).await, cached);
        assert_eq!(events.recv().await.unwrap().cause, ChangeCause::Local);
        assert_eq!(remote.calls().fetch_scopes, 0);
    }
}
