//! PlanSpec + PlanModeState data model (spec §3 "PlanSpec", "PlanModeState").
//! Both live inside `chat.meta` as typed views, following the same "derive
//! lazily on read, re-serialize on write" discipline as
//! [`crate::state::chats::ActiveLlmOverride`] (spec §9 "Deep nesting of
//! metadata maps").

use crate::errors::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Default cap on clarification rounds before forced plan generation (spec §3
/// "clarify_asked_count ≤ clarify_max_count (default 5)").
pub const DEFAULT_CLARIFY_MAX_COUNT: u32 = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanModeState {
    Off,
    PlanningIntake,
    PlanningClarify,
    PlanningReady,
    PlanningRevising,
    Executing,
    Done,
    Aborted,
}

impl Default for PlanModeState {
    fn default() -> Self {
        PlanModeState::Off
    }
}

impl PlanModeState {
    pub fn is_off(self) -> bool {
        matches!(self, PlanModeState::Off)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanTaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_task_status")]
    pub status: PlanTaskStatus,
    #[serde(default)]
    pub deliverables: Vec<String>,
    #[serde(default)]
    pub verification: Vec<String>,
}

fn default_task_status() -> PlanTaskStatus {
    PlanTaskStatus::Pending
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlanSpec {
    pub goal: String,
    #[serde(default)]
    pub scope_in: Vec<String>,
    #[serde(default)]
    pub scope_out: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub summary_for_execution: String,
    #[serde(default)]
    pub revision: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl PlanSpec {
    /// Validated on compile/revise (spec §4.5): goal non-empty, task ids
    /// unique and forming a DAG, acceptance_criteria non-empty.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.goal.trim().is_empty() {
            return Err(GatewayError::InvalidPlanSpec("goal must not be empty".to_string()));
        }
        if self.acceptance_criteria.is_empty() {
            return Err(GatewayError::InvalidPlanSpec(
                "acceptance_criteria must not be empty".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                return Err(GatewayError::InvalidPlanSpec(format!("duplicate task id: {}", task.id)));
            }
        }
        self.check_task_dag()?;
        Ok(())
    }

    /// Kahn's algorithm over `tasks[].depends_on`; a cycle means no
    /// topological order exists (spec §3 invariant).
    fn check_task_dag(&self) -> GatewayResult<()> {
        let ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        for task in &self.tasks {
            for dep in &task.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(GatewayError::InvalidPlanSpec(format!(
                        "task {} depends_on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }
        let mut indegree: HashMap<&str, usize> = self.tasks.iter().map(|t| (t.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &self.tasks {
            for dep in &task.depends_on {
                adjacency.entry(dep.as_str()).or_default().push(task.id.as_str());
                *indegree.get_mut(task.id.as_str()).expect("task id tracked") += 1;
            }
        }
        let mut queue: Vec<&str> = indegree.iter().filter(|(_, &d)| d == 0).map(|(id, _)| *id).collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop() {
            visited += 1;
            for next in adjacency.get(id).into_iter().flatten() {
                let deg = indegree.get_mut(next).expect("edge target tracked");
                *deg -= 1;
                if *deg == 0 {
                    queue.push(next);
                }
            }
        }
        if visited != self.tasks.len() {
            return Err(GatewayError::InvalidPlanSpec("tasks.depends_on contains a cycle".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> PlanTask {
        PlanTask {
            id: id.to_string(),
            title: id.to_string(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            status: PlanTaskStatus::Pending,
            deliverables: vec![],
            verification: vec![],
        }
    }

    #[test]
    fn empty_goal_is_rejected() {
        let spec = PlanSpec {
            acceptance_criteria: vec!["done".to_string()],
            ..PlanSpec::default()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn cycle_in_tasks_is_rejected() {
        let spec = PlanSpec {
            goal: "ship it".to_string(),
            acceptance_criteria: vec!["done".to_string()],
            tasks: vec![task("a", &["b"]), task("b", &["a"])],
            ..PlanSpec::default()
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn acyclic_tasks_validate() {
        let spec = PlanSpec {
            goal: "ship it".to_string(),
            acceptance_criteria: vec!["done".to_string()],
            tasks: vec![task("a", &[]), task("b", &["a"])],
            ..PlanSpec::default()
        };
        assert!(spec.validate().is_ok());
    }
}
