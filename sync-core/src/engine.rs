//! Composition root: wires stores, task board, mutator, lifecycle and the
//! invalidation bridge for one client.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::bridge::ChangePublisher;
use crate::bridge::InvalidationBridge;
use crate::bridge::PushChannel;
use crate::bridge::ReloadTarget;
use crate::bridge::Reloader;
use crate::cache::DurableCache;
use crate::domain::InboxDomain;
use crate::domain::InboxStore;
use crate::domain::LoadOutcome;
use crate::domain::ScopeDomain;
use crate::domain::ScopeStore;
use crate::domain::TimelineDomain;
use crate::domain::TimelineStore;
use crate::lifecycle::ScopeLifecycle;
use crate::model::ClientId;
use crate::model::ScopeWindow;
use crate::model::Session;
use crate::model::TenantId;
use crate::optimistic::OptimisticMutator;
use crate::ordering::OrderingEngine;
use crate::remote::RemoteStore;
use crate::task_board::RefreshOutcome;
use crate::task_board::TaskBoard;

/// Result of one guarded reload of every domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub inbox: LoadOutcome,
    pub scopes: LoadOutcome,
    pub timeline: LoadOutcome,
    pub tasks: RefreshOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    pub tenant_id: TenantId,
    /// Topics subscribed, or `None` when the push channel was unavailable
    /// (the client then relies on polling).
    pub topics: Option<usize>,
    pub sync: SyncReport,
    pub weekly_scope: Option<ScopeWindow>,
}

/// Routes invalidations to the matching store's guarded load.
pub struct DomainReloader {
    inbox: Arc<InboxStore>,
    scopes: Arc<ScopeStore>,
    timeline: Arc<TimelineStore>,
    board: Arc<TaskBoard>,
    session: StdMutex<Option<Session>>,
}

impl DomainReloader {
    fn set_session(&self, session: Option<Session>) {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = session;
    }

    fn session_for(&self, tenant: &TenantId) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|session| session.tenant_id.as_ref() == Some(tenant))
    }

    async fn reload_scopes(&self, session: &Session) -> LoadOutcome {
        let outcome = self.scopes.load(session).await;
        if let Some(tenant) = &session.tenant_id {
            self.board.sync_scope_tasks(tenant).await;
        }
        outcome
    }

    pub async fn reload_all(&self, session: &Session) -> SyncReport {
        let (inbox, scopes, timeline, tasks) = tokio::join!(
            self.inbox.load(session),
            self.reload_scopes(session),
            self.timeline.load(session),
            self.board.refresh(session),
        );
        SyncReport {
            inbox,
            scopes,
            timeline,
            tasks,
        }
    }
}

#[async_trait]
impl Reloader for DomainReloader {
    async fn reload(&self, tenant: &TenantId, target: ReloadTarget) {
        let Some(session) = self.session_for(tenant) else {
            tracing::debug!("Ignoring {target:?} invalidation for inactive tenant {tenant}");
            return;
        };
        match target {
            ReloadTarget::Inbox => {
                self.inbox.load(&session).await;
            }
            ReloadTarget::Scopes => {
                self.reload_scopes(&session).await;
            }
            ReloadTarget::Timeline => {
                self.timeline.load(&session).await;
            }
            ReloadTarget::Tasks => {
                self.board.refresh(&session).await;
            }
        }
    }
}

pub struct SyncEngine {
    inbox: Arc<InboxStore>,
    scopes: Arc<ScopeStore>,
    timeline: Arc<TimelineStore>,
    board: Arc<TaskBoard>,
    reloader: Arc<DomainReloader>,
    bridge: Arc<InvalidationBridge>,
    mutator: OptimisticMutator,
    lifecycle: ScopeLifecycle,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<dyn DurableCache>,
        channel: Arc<dyn PushChannel>,
        client_id: ClientId,
    ) -> Self {
        let inbox = Arc::new(InboxStore::new(InboxDomain, Arc::clone(&remote), Arc::clone(&cache)));
        let scopes = Arc::new(ScopeStore::new(ScopeDomain, Arc::clone(&remote), Arc::clone(&cache)));
        let timeline = Arc::new(TimelineStore::new(
            TimelineDomain,
            Arc::clone(&remote),
            Arc::clone(&cache),
        ));
        let ordering = Arc::new(OrderingEngine::new(cache));
        let board = Arc::new(TaskBoard::new(Arc::clone(&remote), ordering, Arc::clone(&scopes)));
        let reloader = Arc::new(DomainReloader {
            inbox: Arc::clone(&inbox),
            scopes: Arc::clone(&scopes),
            timeline: Arc::clone(&timeline),
            board: Arc::clone(&board),
            session: StdMutex::new(None),
        });
        let bridge = Arc::new(InvalidationBridge::new(
            channel,
            Arc::clone(&reloader) as Arc<dyn Reloader>,
            client_id,
        ));
        let publisher = Arc::clone(&bridge) as Arc<dyn ChangePublisher>;
        let mutator = OptimisticMutator::new(
            remote,
            Arc::clone(&board),
            Arc::clone(&scopes),
            Arc::clone(&timeline),
            Arc::clone(&publisher),
        );
        let lifecycle = ScopeLifecycle::new(Arc::clone(&scopes), Arc::clone(&board), publisher);
        Self {
            inbox,
            scopes,
            timeline,
            board,
            reloader,
            bridge,
            mutator,
            lifecycle,
        }
    }

    pub fn inbox(&self) -> &InboxStore {
        &self.inbox
    }

    pub fn scopes(&self) -> &ScopeStore {
        &self.scopes
    }

    pub fn timeline(&self) -> &TimelineStore {
        &self.timeline
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub fn mutator(&self) -> &OptimisticMutator {
        &self.mutator
    }

    pub fn lifecycle(&self) -> &ScopeLifecycle {
        &self.lifecycle
    }

    pub fn bridge(&self) -> &InvalidationBridge {
        &self.bridge
    }

    /// Switch to `session`'s tenant: tear down the previous subscriptions,
    /// show cached state, subscribe, reconcile every domain against the
    /// remote and provision this week's scope. `None` without a tenant.
    pub async fn activate(&self, session: &Session, today: NaiveDate) -> Option<ActivationReport> {
        let Some(tenant) = session.tenant_id.clone() else {
            self.deactivate().await;
            return None;
        };
        tracing::info!("Activating tenant {tenant} for {}", session.user_id);

        self.reloader.set_session(Some(session.clone()));
        self.inbox.activate(&tenant);
        self.scopes.activate(&tenant);
        self.timeline.activate(&tenant);
        self.board.activate(&tenant);

        self.inbox.hydrate(session).await;
        self.scopes.hydrate(session).await;
        self.timeline.hydrate(session).await;

        let topics = match self.bridge.activate(&tenant).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!("Push channel unavailable for {tenant}, polling only: {e}");
                None
            }
        };
        let sync = self.reloader.reload_all(session).await;
        let weekly_scope = self.lifecycle.ensure_weekly_scope(session, today).await;

        Some(ActivationReport {
            tenant_id: tenant,
            topics,
            sync,
            weekly_scope,
        })
    }

    pub async fn deactivate(&self) {
        self.bridge.deactivate().await;
        self.reloader.set_session(None);
        self.inbox.deactivate();
        self.scopes.deactivate();
        self.timeline.deactivate();
        self.board.deactivate();
    }

    /// Guarded reload of every domain; what the poll loop calls.
    pub async fn poll(&self, session: &Session) -> SyncReport {
        self.reloader.reload_all(session).await
    }
}
