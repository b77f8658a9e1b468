use async_trait::async_trait;

use super::DomainSpec;
use super::DomainStore;
use crate::model::RequestContext;
use crate::model::ScopeId;
use crate::model::ScopeWindow;
use crate::model::ScopeWindowsState;
use crate::model::Session;
use crate::model::TenantId;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;

/// Scope windows. Only tenant administrators may seed an empty remote.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopeDomain;

pub type ScopeStore = DomainStore<ScopeDomain>;

#[async_trait]
impl DomainSpec for ScopeDomain {
    type State = ScopeWindowsState;

    fn name(&self) -> &'static str {
        "scopes"
    }

    fn is_empty(&self, state: &ScopeWindowsState) -> bool {
        state.scopes.is_empty()
    }

    fn seed(&self, session: &Session, local: &ScopeWindowsState) -> Option<ScopeWindowsState> {
        session.is_admin().then(|| local.clone())
    }

    async fn fetch(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
    ) -> Result<ScopeWindowsState, RemoteError> {
        remote.fetch_scopes(ctx).await
    }

    async fn push(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
        state: &ScopeWindowsState,
    ) -> Result<(), RemoteError> {
        remote.put_scopes(ctx, state).await
    }
}

impl DomainStore<ScopeDomain> {
    pub async fn scope(&self, tenant: &TenantId, id: &ScopeId) -> Option<ScopeWindow> {
        self.snapshot(tenant).await.get(id).cloned()
    }

    pub async fn open_scopes(&self, tenant: &TenantId) -> Vec<ScopeWindow> {
        self.snapshot(tenant)
            .await
            .scopes
            .into_iter()
            .filter(ScopeWindow::is_open)
            .collect()
    }

    /// Create a user-defined scope window and save it.
    pub async fn create_scope(&self, session: &Session, name: impl Into<String>) -> Option<ScopeWindow> {
        let tenant = session.tenant_id.clone()?;
        let scope = ScopeWindow::new(tenant.clone(), name, session.user_id.clone());
        self.edit(session, |state| state.scopes.push(scope.clone()))
            .await?;
        tracing::info!("Created scope {} ({}) in {tenant}", scope.name, scope.id);
        Some(scope)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::model::TenantRole;
    use crate::testing::MemoryRemote;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_admins_seed() {
        let mut state = ScopeWindowsState::default();
        state.scopes.push(ScopeWindow::new(
            TenantId::new("h1"),
            "Sprint",
            "u1".into(),
        ));
        let member = Session::new("u1", "h1");
        let admin = member.clone().with_role(TenantRole::Admin);

        assert_eq!(ScopeDomain.seed(&member, &state), None);
        assert_eq!(ScopeDomain.seed(&admin, &state), Some(state));
    }

    #[tokio::test]
    async fn create_scope_writes_through() {
        let remote = Arc::new(MemoryRemote::new());
        let store = ScopeStore::new(ScopeDomain, remote.clone(), Arc::new(MemoryCache::new()));
        let session = Session::new("u1", "h1");

        let scope = store.create_scope(&session, "Launch").await.unwrap();

        let tenant = TenantId::new("h1");
        assert_eq!(remote.scopes(&tenant).scopes, vec![scope.clone()]);
        assert_eq!(store.open_scopes(&tenant).await, vec![scope]);
    }
}
