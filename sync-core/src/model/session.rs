use serde::Deserialize;
use serde::Serialize;

use super::TenantId;
use super::UserId;

/// Caller's role inside the active tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantRole {
    Admin,
    #[default]
    Member,
}

/// Authenticated identity plus the tenant the client is currently viewing.
///
/// Stores no-op when `tenant_id` is `None`: no request is issued without an
/// active tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default)]
    pub role: TenantRole,
    /// Every tenant the user belongs to. Legacy cache migration only runs
    /// when this holds exactly one entry.
    #[serde(default)]
    pub memberships: Vec<TenantId>,
}

impl Session {
    pub fn new(user_id: impl Into<UserId>, tenant_id: impl Into<TenantId>) -> Self {
        let tenant_id = tenant_id.into();
        Self {
            user_id: user_id.into(),
            memberships: vec![tenant_id.clone()],
            tenant_id: Some(tenant_id),
            role: TenantRole::Member,
        }
    }

    pub fn with_role(mut self, role: TenantRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_memberships(mut self, memberships: Vec<TenantId>) -> Self {
        self.memberships = memberships;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == TenantRole::Admin
    }

    /// Request context for the active tenant, if any.
    pub fn context(&self) -> Option<RequestContext> {
        self.tenant_id.as_ref().map(|tenant_id| RequestContext {
            tenant_id: tenant_id.clone(),
            user_id: self.user_id.clone(),
        })
    }
}

/// Tenant + identity that must accompany every remote read or write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
}
