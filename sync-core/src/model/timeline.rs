use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;

use super::TaskId;

/// Client-side adjustment layered over a task's due date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineOverride {
    pub date: NaiveDate,
    #[serde(default)]
    pub is_point: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<u32>,
}

impl TimelineOverride {
    pub fn point(date: NaiveDate) -> Self {
        Self {
            date,
            is_point: true,
            duration_days: None,
        }
    }

    pub fn span(date: NaiveDate, duration_days: u32) -> Self {
        Self {
            date,
            is_point: false,
            duration_days: Some(duration_days),
        }
    }
}

/// Remote shape of a tenant's timeline overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimelineOverrides {
    #[serde(default)]
    pub overrides: BTreeMap<TaskId, TimelineOverride>,
}
