use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::InboxItemId;
use super::ScopeId;
use super::TenantId;
use super::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    #[default]
    Incoming,
    Later,
    Worked,
    Archived,
}

/// Quick-capture entry, visible only to its creator within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    pub id: InboxItemId,
    pub tenant_id: TenantId,
    pub creator_id: UserId,
    pub title: String,
    #[serde(default)]
    pub status: InboxStatus,
    /// Set once the item is promoted into a scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_scope_id: Option<ScopeId>,
    pub created_at: DateTime<Utc>,
}

/// Remote shape of a tenant's inbox: items plus the per-item status map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InboxSnapshot {
    #[serde(default)]
    pub items: Vec<InboxItem>,
    #[serde(default)]
    pub statuses: BTreeMap<InboxItemId, InboxStatus>,
}

impl InboxSnapshot {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.statuses.is_empty()
    }

    /// Effective status: the status map wins over the item's embedded field.
    pub fn status_of(&self, id: &InboxItemId) -> Option<InboxStatus> {
        self.statuses
            .get(id)
            .copied()
            .or_else(|| self.items.iter().find(|item| &item.id == id).map(|item| item.status))
    }

    /// The subset created by `user`.
    pub fn created_by(&self, user: &UserId) -> InboxSnapshot {
        let items: Vec<InboxItem> = self
            .items
            .iter()
            .filter(|item| &item.creator_id == user)
            .cloned()
            .collect();
        let statuses = self
            .statuses
            .iter()
            .filter(|(id, _)| items.iter().any(|item| &item.id == *id))
            .map(|(id, status)| (id.clone(), *status))
            .collect();
        InboxSnapshot { items, statuses }
    }
}
