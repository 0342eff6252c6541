use crate::types::{Task, TaskStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Every task and subtask known to the engine, with insertion order kept
/// for stable scheduling tie-breaks.
#[derive(Default)]
pub struct TaskTable {
    tasks: HashMap<Uuid, Task>,
    order: Vec<Uuid>,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: Task) -> Uuid {
        let id = task.id;
        if self.tasks.insert(id, task).is_none() {
            self.order.push(id);
        }
        id
    }

    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.get_mut(&id)
    }

    pub fn status(&self, id: Uuid) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.status)
    }

    /// Whether every dependency of `task` has completed.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.status(*dep) == Some(TaskStatus::Completed))
    }

    /// Schedulable tasks, highest priority first, then oldest first.
    pub fn ready_in_order(&self) -> Vec<Uuid> {
        let mut ready: Vec<(usize, &Task)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| self.tasks.get(id).map(|t| (seq, t)))
            .filter(|(_, t)| t.status == TaskStatus::Ready && self.dependencies_met(t))
            .collect();
        ready.sort_by(|(sa, a), (sb, b)| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| sa.cmp(sb))
        });
        ready.into_iter().map(|(_, t)| t.id).collect()
    }

    /// Ids of tasks in `status`, in insertion order.
    pub fn with_status(&self, status: TaskStatus) -> Vec<Uuid> {
        self.order
            .iter()
            .filter(|id| self.status(**id) == Some(status))
            .copied()
            .collect()
    }

    /// All descendants of `id`, parents before children.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut stack: Vec<Uuid> = self
            .get(id)
            .map(|t| t.children_ids.iter().rev().copied().collect())
            .unwrap_or_default();
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            out.push(next);
            if let Some(task) = self.get(next) {
                stack.extend(task.children_ids.iter().rev().copied());
            }
        }
        out
    }

    /// Siblings of `child` that depend on it, directly or through other siblings.
    pub fn transitive_dependents(&self, child: Uuid) -> Vec<Uuid> {
        let Some(parent) = self.get(child).and_then(|t| t.parent_id) else {
            return Vec::new();
        };
        let siblings = self
            .get(parent)
            .map(|p| p.children_ids.clone())
            .unwrap_or_default();
        let mut blocked: HashSet<Uuid> = HashSet::from([child]);
        let mut out = Vec::new();
        let mut changed = true;
        while changed {
            changed = false;
            for sib in &siblings {
                if blocked.contains(sib) {
                    continue;
                }
                let depends = self
                    .get(*sib)
                    .is_some_and(|t| t.dependencies.iter().any(|d| blocked.contains(d)));
                if depends {
                    blocked.insert(*sib);
                    out.push(*sib);
                    changed = true;
                }
            }
        }
        out
    }

    pub fn count_by_status(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts: BTreeMap<TaskStatus, usize> =
            TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        counts
    }

    /// Tasks newest first, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<&Task> {
        self.order
            .iter()
            .rev()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| status.map_or(true, |s| t.status == s))
            .take(limit)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether every task has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.tasks.values().all(Task::is_terminal)
    }
}
