//! Task data model for the scheduler.
//!
//! `TaskPriority` deliberately orders **smaller value = higher priority**
//! (`Critical = 0`), the opposite of a naive "bigger number wins" enum.
//! Numeric ordering as priority is a common trap; this one is pinned
//! down by the scheduler's own dispatch tests, not just doc comments.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

/// Free-form tags carried on a task, used for group pause/resume/cancel
/// (e.g. `{"fileId": "abc"}` to scope an operation to one file's chunks).
pub type TaskMetadata = HashMap<String, String>;

/// Serializable snapshot of a task, handed out to observers; never
/// exposes the executor closure itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub metadata: TaskMetadata,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub last_error: Option<String>,
}

impl TaskInfo {
    pub fn matches_metadata(&self, key: &str, value: &str) -> bool {
        self.metadata.get(key).map(|v| v.as_str()) == Some(value)
    }
}
