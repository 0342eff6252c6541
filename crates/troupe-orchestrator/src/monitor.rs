use crate::engine::Orchestrator;
use crate::registry::AgentSnapshot;
use crate::types::{AgentStatus, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Aggregate load figures across all agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    pub active_agents: usize,
    pub offline_agents: usize,
    pub current_load: u32,
    pub capacity: u32,
    /// `current_load / capacity` over non-offline agents.
    pub utilization: f64,
}

/// Point-in-time view of the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub tasks_by_status: BTreeMap<TaskStatus, usize>,
    pub total_tasks: usize,
    pub agents: Vec<AgentSnapshot>,
    pub load: LoadSummary,
    pub active_dispatches: usize,
    pub open_result_sets: usize,
    pub generated_at: DateTime<Utc>,
}

/// One line of a task family listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub title: String,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<Uuid>,
    pub attempt_count: u32,
    pub confidence: Option<f64>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            parent_id: task.parent_id,
            title: task.title.clone(),
            status: task.status,
            assigned_agent_id: task.assigned_agent_id,
            attempt_count: task.attempt_count,
            confidence: task.confidence,
        }
    }
}

/// A task record together with its descendants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task: Task,
    pub descendants: Vec<TaskSummary>,
    pub descendants_by_status: BTreeMap<TaskStatus, usize>,
}

fn summarize_load(agents: &[AgentSnapshot]) -> LoadSummary {
    let mut summary = LoadSummary::default();
    for agent in agents {
        if agent.status == AgentStatus::Offline {
            summary.offline_agents += 1;
            continue;
        }
        summary.active_agents += 1;
        summary.current_load += agent.current_load;
        summary.capacity += agent.max_concurrency;
    }
    if summary.capacity > 0 {
        summary.utilization = f64::from(summary.current_load) / f64::from(summary.capacity);
    }
    summary
}

impl Orchestrator {
    pub async fn system_status(&self) -> SystemStatus {
        let (tasks_by_status, total_tasks) = {
            let table = self.shared.tasks.read().await;
            (table.count_by_status(), table.len())
        };
        let agents = self.shared.registry.snapshot();
        let load = summarize_load(&agents);
        let active_dispatches = self.shared.dispatches.lock().len();
        let open_result_sets = self.shared.results.lock().open_sets();
        SystemStatus {
            tasks_by_status,
            total_tasks,
            agents,
            load,
            active_dispatches,
            open_result_sets,
            generated_at: Utc::now(),
        }
    }

    /// The task record and a summary of every descendant.
    pub async fn task_report(&self, task_id: Uuid) -> Option<TaskReport> {
        let table = self.shared.tasks.read().await;
        let task = table.get(task_id)?.clone();
        let descendants: Vec<TaskSummary> = table
            .descendants(task_id)
            .into_iter()
            .filter_map(|id| table.get(id))
            .map(TaskSummary::from)
            .collect();
        let mut descendants_by_status = BTreeMap::new();
        for d in &descendants {
            *descendants_by_status.entry(d.status).or_insert(0) += 1;
        }
        Some(TaskReport {
            task,
            descendants,
            descendants_by_status,
        })
    }

    /// Tasks newest first, optionally restricted to one status.
    pub async fn list_tasks(&self, status: Option<TaskStatus>, limit: usize) -> Vec<TaskSummary> {
        let table = self.shared.tasks.read().await;
        table
            .list(status, limit)
            .into_iter()
            .map(TaskSummary::from)
            .collect()
    }

    /// Serialize the current status as JSON.
    pub async fn status_json(&self) -> serde_json::Value {
        let status = self.system_status().await;
        serde_json::to_value(&status).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentType;

    fn agent(status: AgentStatus, load: u32, limit: u32) -> AgentSnapshot {
        let now = Utc::now();
        AgentSnapshot {
            id: Uuid::new_v4(),
            name: "a".into(),
            agent_type: AgentType::Research,
            capabilities: Default::default(),
            status,
            current_load: load,
            max_concurrency: limit,
            success_rate: 1.0,
            mean_latency_ms: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            registered_at: now,
            last_active: now,
        }
    }

    #[test]
    fn test_load_summary() {
        let summary = summarize_load(&[
            agent(AgentStatus::Busy, 2, 4),
            agent(AgentStatus::Idle, 0, 4),
            agent(AgentStatus::Offline, 1, 3),
        ]);
        assert_eq!(summary.active_agents, 2);
        assert_eq!(summary.offline_agents, 1);
        assert_eq!(summary.capacity, 8);
        assert!((summary.utilization - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_load_summary() {
        let summary = summarize_load(&[]);
        assert_eq!(summary.utilization, 0.0);
    }
}
