//! Cron job aggregate (spec §3 "CronJobSpec", "CronJobState", "CronWorkflow").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_CRON_JOB_ID: &str = "cron-default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Text,
    Workflow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "type")]
    pub kind: ScheduleType,
    /// Either a duration string (interval) or a cron expression (cron).
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DispatchTarget {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default)]
    pub target: DispatchTarget,
}

fn default_channel() -> String {
    "console".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runtime {
    #[serde(default = "one")]
    pub max_concurrency: u32,
    #[serde(default = "one")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub misfire_grace_seconds: u64,
}

fn one() -> u32 {
    1
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            timeout_seconds: 1,
            misfire_grace_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub delay_seconds: Option<i64>,
    #[serde(default)]
    pub if_condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronWorkflow {
    pub version: u32,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSpec {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub task_type: TaskType,
    pub schedule: Schedule,
    pub dispatch: Dispatch,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub workflow: Option<CronWorkflow>,
}

impl CronJobSpec {
    pub fn is_protected(&self) -> bool {
        self.id == DEFAULT_CRON_JOB_ID
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    Paused,
    Resumed,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronJobState {
    #[serde(default)]
    pub paused: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<LastStatus>,
    pub last_error: Option<String>,
    /// Workflow execution trace of the most recent run, if `task_type=workflow`.
    pub last_execution: Option<serde_json::Value>,
}

impl CronJobState {
    /// Normalize `last_status=paused` into `paused=true` on read (spec §3
    /// invariant: "Pausing via last_status=paused must be normalized into
    /// paused=true on read").
    pub fn normalize(&mut self) {
        if self.last_status == Some(LastStatus::Paused) {
            self.paused = true;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronJobEntry {
    pub spec: CronJobSpec,
    pub state: CronJobState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronAggregate {
    pub jobs: HashMap<String, CronJobEntry>,
}

impl CronAggregate {
    /// Seeds the protected `cron-default` job if absent. Disabled by default
    /// so it never fires on its own; it only exists so `DELETE` on it can be
    /// rejected (spec §3 "Protected default cron-default cannot be deleted").
    pub fn ensure_default_job(&mut self) {
        self.jobs.entry(DEFAULT_CRON_JOB_ID.to_string()).or_insert_with(|| CronJobEntry {
            spec: CronJobSpec {
                id: DEFAULT_CRON_JOB_ID.to_string(),
                name: "default".to_string(),
                ..CronJobSpec::default()
            },
            state: CronJobState::default(),
        });
    }
}

impl Default for CronJobSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            enabled: false,
            task_type: TaskType::Text,
            schedule: Schedule {
                kind: ScheduleType::Interval,
                cron: "60s".to_string(),
                timezone: None,
            },
            dispatch: Dispatch {
                channel: default_channel(),
                target: DispatchTarget::default(),
            },
            runtime: Runtime::default(),
            text: None,
            workflow: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_job_is_protected() {
        let spec = CronJobSpec {
            id: DEFAULT_CRON_JOB_ID.to_string(),
            ..CronJobSpec::default()
        };
        assert!(spec.is_protected());
    }

    #[test]
    fn normalize_converts_paused_status_to_flag() {
        let mut state = CronJobState {
            last_status: Some(LastStatus::Paused),
            ..CronJobState::default()
        };
        state.normalize();
        assert!(state.paused);
    }
}
