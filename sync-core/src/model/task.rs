use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use super::BoardId;
use super::TaskId;
use super::TenantId;
use super::UserId;

/// Board column a task sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Done,
    Archived,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Backlog,
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Archived,
    ];

    /// Open tasks are the ones a closing scope has to hand over.
    pub fn is_open(self) -> bool {
        !matches!(self, TaskStatus::Done | TaskStatus::Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "BACKLOG",
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
            TaskStatus::Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Where a task originates. Externally-synced tasks are read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Manual,
    External(String),
}

impl SourceType {
    pub fn is_read_only(&self) -> bool {
        !matches!(self, SourceType::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChecklistItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub actor_id: UserId,
    pub action: String,
}

/// Server-owned work item, mirrored read-only into the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub tenant_id: TenantId,
    pub board_id: BoardId,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub owner_id: UserId,
    #[serde(default)]
    pub assignees: BTreeSet<UserId>,
    /// Free-form labels; insertion order is meaningful, duplicates are not.
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub activity_log: Vec<ActivityEntry>,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub source_type: SourceType,
}

impl Task {
    /// Append a label unless it is already present.
    pub fn add_kind(&mut self, kind: impl Into<String>) {
        let kind = kind.into();
        if !self.kinds.contains(&kind) {
            self.kinds.push(kind);
        }
    }
}

/// Which task list to read: one board, or every board of the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum BoardSelector {
    #[default]
    All,
    Board(BoardId),
}

impl BoardSelector {
    /// Path segment used by the remote API; `all` is the sentinel.
    pub fn as_path_segment(&self) -> &str {
        match self {
            BoardSelector::All => "all",
            BoardSelector::Board(id) => id.as_str(),
        }
    }

    pub fn matches(&self, board_id: &BoardId) -> bool {
        match self {
            BoardSelector::All => true,
            BoardSelector::Board(id) => id == board_id,
        }
    }
}

/// Payload of the create-task command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub board_id: BoardId,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub assignees: BTreeSet<UserId>,
    #[serde(default)]
    pub kinds: Vec<String>,
}

/// Partial update for the update-details command. `None` leaves a field as is.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    /// Clears the due date; wins over `due_date`.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_due_date: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignees: Option<BTreeSet<UserId>>,
}

impl TaskPatch {
    pub fn due_date(due_date: Option<NaiveDate>) -> Self {
        Self {
            clear_due_date: due_date.is_none(),
            due_date,
            ..Self::default()
        }
    }

    /// Apply the patch to a mirrored copy of the task.
    pub fn apply_to(&self, task: &mut Task) {
        if let Some(title) = &self.title {
            task.title.clone_from(title);
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if self.clear_due_date {
            task.due_date = None;
        } else if let Some(due_date) = self.due_date {
            task.due_date = Some(due_date);
        }
        if let Some(assignees) = &self.assignees {
            task.assignees.clone_from(assignees);
        }
    }
}
