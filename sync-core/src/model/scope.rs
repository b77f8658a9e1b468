use chrono::DateTime;
use chrono::Datelike;
use chrono::Days;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::ScopeId;
use super::TaskId;
use super::TenantId;
use super::UserId;

/// Id prefix of the auto-provisioned weekly scope.
pub const WEEKLY_SCOPE_PREFIX: &str = "weekly";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Shared,
    Personal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeRole {
    Admin,
    Member,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeMember {
    pub user_id: UserId,
    pub role: ScopeRole,
}

/// Verdict stamped on a scope when it is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Yes,
    Partial,
    No,
}

/// Named, optionally time-boxed collection of tasks.
///
/// `completion_status == None` means open. A completed window is immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeWindow {
    pub id: ScopeId,
    pub tenant_id: TenantId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Membership and manual order; never contains duplicates.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    #[serde(default)]
    pub visibility: Visibility,
    pub created_by: UserId,
    #[serde(default)]
    pub members: Vec<ScopeMember>,
    #[serde(default)]
    pub completion_status: Option<CompletionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiative_id: Option<String>,
}

impl ScopeWindow {
    /// New open scope with a client-generated id.
    pub fn new(tenant_id: TenantId, name: impl Into<String>, created_by: UserId) -> Self {
        Self {
            id: ScopeId(uuid::Uuid::new_v4().to_string()),
            tenant_id,
            name: name.into(),
            start_date: None,
            end_date: None,
            description: None,
            task_ids: Vec::new(),
            visibility: Visibility::Shared,
            members: vec![ScopeMember {
                user_id: created_by.clone(),
                role: ScopeRole::Admin,
            }],
            created_by,
            completion_status: None,
            completion_comment: None,
            completed_at: None,
            completed_by: None,
            initiative_id: None,
        }
    }

    /// The deterministic weekly scope for the ISO week containing `today`.
    pub fn weekly(tenant_id: TenantId, today: NaiveDate, created_by: UserId) -> Self {
        let start = week_start(today);
        let end = start.checked_add_days(Days::new(6));
        let name = format!("Week {}", start.iso_week().week());
        let mut scope = Self::new(tenant_id.clone(), name, created_by);
        scope.id = weekly_scope_id(&tenant_id, today);
        scope.start_date = Some(start);
        scope.end_date = end;
        scope
    }

    pub fn is_open(&self) -> bool {
        self.completion_status.is_none()
    }

    pub fn is_weekly(&self) -> bool {
        self.id
            .as_str()
            .strip_prefix(WEEKLY_SCOPE_PREFIX)
            .is_some_and(|rest| rest.starts_with(':'))
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.task_ids.contains(task_id)
    }

    /// Append `task_id` unless already a member. Returns whether it was added.
    pub fn push_task(&mut self, task_id: TaskId) -> bool {
        if self.contains(&task_id) {
            return false;
        }
        self.task_ids.push(task_id);
        true
    }

    /// Returns whether `task_id` was a member.
    pub fn remove_task(&mut self, task_id: &TaskId) -> bool {
        let before = self.task_ids.len();
        self.task_ids.retain(|id| id != task_id);
        before != self.task_ids.len()
    }
}

/// Monday of the ISO week containing `day`.
pub fn week_start(day: NaiveDate) -> NaiveDate {
    let offset = u64::from(day.weekday().num_days_from_monday());
    day.checked_sub_days(Days::new(offset)).unwrap_or(day)
}

/// `weekly:{tenant}:{ISO-week-start}`. Deterministic so that concurrent
/// clients converge on one record per week.
pub fn weekly_scope_id(tenant_id: &TenantId, day: NaiveDate) -> ScopeId {
    ScopeId(format!(
        "{WEEKLY_SCOPE_PREFIX}:{tenant_id}:{}",
        week_start(day).format("%Y-%m-%d")
    ))
}

/// Remote shape of a tenant's scope windows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeWindowsState {
    #[serde(default)]
    pub scopes: Vec<ScopeWindow>,
}

impl ScopeWindowsState {
    pub fn get(&self, id: &ScopeId) -> Option<&ScopeWindow> {
        self.scopes.iter().find(|scope| &scope.id == id)
    }

    pub fn get_mut(&mut self, id: &ScopeId) -> Option<&mut ScopeWindow> {
        self.scopes.iter_mut().find(|scope| &scope.id == id)
    }
}
