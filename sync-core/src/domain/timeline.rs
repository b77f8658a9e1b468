use async_trait::async_trait;

use super::DomainSpec;
use super::DomainStore;
use crate::model::RequestContext;
use crate::model::Session;
use crate::model::TaskId;
use crate::model::TenantId;
use crate::model::TimelineOverride;
use crate::model::TimelineOverrides;
use crate::remote::RemoteError;
use crate::remote::RemoteStore;

/// Timeline overrides. Presentation state, so any member may seed.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimelineDomain;

pub type TimelineStore = DomainStore<TimelineDomain>;

#[async_trait]
impl DomainSpec for TimelineDomain {
    type State = TimelineOverrides;

    fn name(&self) -> &'static str {
        "timeline"
    }

    fn is_empty(&self, state: &TimelineOverrides) -> bool {
        state.overrides.is_empty()
    }

    fn seed(&self, _session: &Session, local: &TimelineOverrides) -> Option<TimelineOverrides> {
        Some(local.clone())
    }

    async fn fetch(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
    ) -> Result<TimelineOverrides, RemoteError> {
        remote.fetch_timeline(ctx).await
    }

    async fn push(
        &self,
        remote: &dyn RemoteStore,
        ctx: &RequestContext,
        state: &TimelineOverrides,
    ) -> Result<(), RemoteError> {
        remote.put_timeline(ctx, state).await
    }
}

impl DomainStore<TimelineDomain> {
    pub async fn override_for(&self, tenant: &TenantId, task: &TaskId) -> Option<TimelineOverride> {
        self.snapshot(tenant).await.overrides.get(task).cloned()
    }

    /// Set or clear (`None`) the override for `task` in memory only. Returns
    /// the previous value so callers can roll back.
    pub async fn put_override(
        &self,
        tenant: &TenantId,
        task: &TaskId,
        value: Option<TimelineOverride>,
    ) -> Option<TimelineOverride> {
        self.update(tenant, |state| match value {
            Some(value) => state.overrides.insert(task.clone(), value),
            None => state.overrides.remove(task),
        })
        .await
    }
}
