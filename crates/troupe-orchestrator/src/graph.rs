//! Decomposition graph management.
//!
//! Validates gateway-proposed subtask lists, materializes them as child tasks
//! wired by sibling dependencies, releases dependents as children complete,
//! and settles the parent once every child is terminal.

use crate::events::LifecycleEvent;
use crate::gateway::ChildResult;
use crate::task_table::TaskTable;
use crate::types::{
    CapabilitySet, FailureCause, FailureKind, SubtaskDescriptor, Task, TaskStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

/// Whether a freshly submitted task should be offered to the gateway for
/// decomposition. An explicit flag on the submission always wins.
pub fn should_decompose(task: &Task, capability_threshold: usize, covered: bool) -> bool {
    match task.decompose {
        Some(flag) => flag,
        None => task.required_capabilities.len() > capability_threshold || !covered,
    }
}

/// Check a proposed decomposition and return its topological order
/// (indices into `descriptors`).
pub fn topological_order(
    descriptors: &[SubtaskDescriptor],
    max_subtasks: usize,
) -> TroupeResult<Vec<usize>> {
    if descriptors.len() > max_subtasks {
        return Err(TroupeError::InvalidDecomposition(format!(
            "{} subtasks proposed, at most {max_subtasks} allowed",
            descriptors.len()
        )));
    }

    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, d) in descriptors.iter().enumerate() {
        if d.key.trim().is_empty() {
            return Err(TroupeError::InvalidDecomposition(format!(
                "subtask #{i} has an empty key"
            )));
        }
        if d.title.trim().is_empty() {
            return Err(TroupeError::InvalidDecomposition(format!(
                "subtask '{}' has an empty title",
                d.key
            )));
        }
        if index.insert(d.key.as_str(), i).is_some() {
            return Err(TroupeError::InvalidDecomposition(format!(
                "duplicate subtask key '{}'",
                d.key
            )));
        }
    }

    // Kahn's algorithm over dependency edges (dep -> dependent).
    let mut indegree = vec![0usize; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    for (i, d) in descriptors.iter().enumerate() {
        let unique: HashSet<&str> = d.depends_on.iter().map(String::as_str).collect();
        for dep in unique {
            let j = *index.get(dep).ok_or_else(|| TroupeError::DanglingDependency {
                subtask: d.key.clone(),
                missing: dep.to_string(),
            })?;
            indegree[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut queue: VecDeque<usize> = (0..descriptors.len())
        .filter(|i| indegree[*i] == 0)
        .collect();
    let mut order = Vec::with_capacity(descriptors.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &j in &dependents[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                queue.push_back(j);
            }
        }
    }

    if order.len() < descriptors.len() {
        let mut stuck: Vec<&str> = (0..descriptors.len())
            .filter(|i| indegree[*i] > 0)
            .map(|i| descriptors[i].key.as_str())
            .collect();
        stuck.sort_unstable();
        return Err(TroupeError::CyclicDependency(stuck.join(", ")));
    }
    Ok(order)
}

/// Side effects of settling a task within its family.
#[derive(Debug, Default)]
pub struct Settlement {
    pub events: Vec<LifecycleEvent>,
    /// Tasks cancelled as a consequence; any in-flight dispatch must be aborted.
    pub cancelled: Vec<Uuid>,
    /// Decomposed parents whose children are all terminal.
    pub synthesize: Vec<Uuid>,
}

impl Settlement {
    pub fn merge(&mut self, other: Settlement) {
        self.events.extend(other.events);
        self.cancelled.extend(other.cancelled);
        self.synthesize.extend(other.synthesize);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.cancelled.is_empty() && self.synthesize.is_empty()
    }
}

impl TaskTable {
    /// Materialize `descriptors` as children of `parent_id` and move the
    /// parent to `Decomposed`. Nothing is modified when validation fails.
    pub fn build_children(
        &mut self,
        parent_id: Uuid,
        descriptors: &[SubtaskDescriptor],
        max_subtasks: usize,
        now: DateTime<Utc>,
    ) -> TroupeResult<Vec<LifecycleEvent>> {
        let parent = self
            .get(parent_id)
            .cloned()
            .ok_or(TroupeError::TaskNotFound(parent_id))?;
        if !parent.children_ids.is_empty() {
            return Err(TroupeError::AlreadyDecomposed(parent_id));
        }
        if parent.status != TaskStatus::Submitted {
            return Err(TroupeError::InvalidTransition {
                task_id: parent_id,
                from: parent.status.to_string(),
                to: TaskStatus::Decomposed.to_string(),
            });
        }
        if descriptors.is_empty() {
            return Err(TroupeError::InvalidDecomposition(
                "decomposition produced no subtasks".into(),
            ));
        }
        topological_order(descriptors, max_subtasks)?;

        let ids: Vec<Uuid> = descriptors.iter().map(|_| Uuid::new_v4()).collect();
        let by_key: HashMap<&str, Uuid> = descriptors
            .iter()
            .zip(&ids)
            .map(|(d, id)| (d.key.as_str(), *id))
            .collect();

        let mut events = Vec::with_capacity(descriptors.len() * 2 + 1);
        for (d, id) in descriptors.iter().zip(&ids) {
            let caps: CapabilitySet = d
                .required_capabilities
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let description = if d.description.trim().is_empty() {
                parent.description.clone()
            } else {
                d.description.clone()
            };
            let mut child = Task::new(
                d.title.clone(),
                description,
                if caps.is_empty() {
                    parent.required_capabilities.clone()
                } else {
                    caps
                },
            );
            child.id = *id;
            child.task_type = parent.task_type.clone();
            child.priority = d.priority.unwrap_or(parent.priority);
            child.parent_id = Some(parent_id);
            child.dependencies = d
                .depends_on
                .iter()
                .filter_map(|k| by_key.get(k.as_str()).copied())
                .collect();
            child.max_retries = parent.max_retries;
            child.redundancy = parent.redundancy;
            child.tolerate_partial_failure = parent.tolerate_partial_failure;
            child.decompose = Some(false);
            child.created_at = now;
            child.updated_at = now;
            child.timeout_ms = parent.timeout_ms;
            child.refresh_deadline(now);
            self.insert(child);
            events.push(LifecycleEvent::new(*id, None, TaskStatus::Submitted, now));
        }

        for (d, id) in descriptors.iter().zip(&ids) {
            let next = if d.depends_on.is_empty() {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };
            events.push(self.transition(*id, next, now)?);
        }

        if let Some(p) = self.get_mut(parent_id) {
            p.children_ids = ids.clone();
        }
        events.push(
            self.transition(parent_id, TaskStatus::Decomposed, now)?
                .with_detail(format!("{} subtasks", ids.len())),
        );
        info!(task_id = %parent_id, subtasks = ids.len(), "Task decomposed");
        Ok(events)
    }

    /// Move siblings of a completed child whose dependencies are now all met
    /// from `Pending` to `Ready`.
    pub fn release_dependents(
        &mut self,
        child: Uuid,
        now: DateTime<Utc>,
    ) -> TroupeResult<Vec<LifecycleEvent>> {
        let Some(parent) = self.get(child).and_then(|t| t.parent_id) else {
            return Ok(Vec::new());
        };
        let siblings = self
            .get(parent)
            .map(|p| p.children_ids.clone())
            .unwrap_or_default();
        let mut events = Vec::new();
        for sib in siblings {
            let releasable = self.get(sib).is_some_and(|t| {
                t.status == TaskStatus::Pending
                    && t.dependencies.contains(&child)
                    && self.dependencies_met(t)
            });
            if releasable {
                events.push(self.transition(sib, TaskStatus::Ready, now)?);
                debug!(task_id = %sib, "Dependencies met");
            }
        }
        Ok(events)
    }

    /// Cancel `id` and every non-terminal descendant.
    pub fn cancel_subtree(&mut self, id: Uuid, now: DateTime<Utc>) -> TroupeResult<Settlement> {
        let mut out = Settlement::default();
        let targets = std::iter::once(id).chain(self.descendants(id));
        for target in targets.collect::<Vec<_>>() {
            if self.status(target).is_some_and(|s| !s.is_terminal()) {
                out.events.push(self.transition(target, TaskStatus::Cancelled, now)?);
                out.cancelled.push(target);
            }
        }
        Ok(out)
    }

    /// Propagate a child reaching a terminal state up through its ancestors.
    pub fn on_child_terminal(
        &mut self,
        child: Uuid,
        now: DateTime<Utc>,
    ) -> TroupeResult<Settlement> {
        let mut out = Settlement::default();
        let mut current = child;
        loop {
            let Some(task) = self.get(current) else { break };
            let (status, title) = (task.status, task.title.clone());
            let Some(parent_id) = task.parent_id else { break };
            let Some(parent) = self.get(parent_id) else { break };
            if parent.status != TaskStatus::Decomposed {
                break;
            }
            let tolerate = parent.tolerate_partial_failure;
            let siblings = parent.children_ids.clone();

            match status {
                TaskStatus::Completed => {
                    out.events.extend(self.release_dependents(current, now)?);
                }
                TaskStatus::Failed | TaskStatus::Cancelled if !tolerate => {
                    let cause = FailureCause::new(
                        FailureKind::SubtaskFailed,
                        format!("subtask '{title}' {status}"),
                    );
                    out.events.push(self.fail(parent_id, cause, now)?);
                    for sib in siblings {
                        out.merge(self.cancel_subtree(sib, now)?);
                    }
                    current = parent_id;
                    continue;
                }
                TaskStatus::Failed | TaskStatus::Cancelled => {
                    for dependent in self.transitive_dependents(current) {
                        out.merge(self.cancel_subtree(dependent, now)?);
                    }
                }
                _ => break,
            }

            let all_terminal = siblings
                .iter()
                .all(|s| self.status(*s).is_some_and(TaskStatus::is_terminal));
            if !all_terminal {
                break;
            }
            let any_completed = siblings
                .iter()
                .any(|s| self.status(*s) == Some(TaskStatus::Completed));
            if any_completed {
                out.synthesize.push(parent_id);
                break;
            }
            let cause = FailureCause::new(FailureKind::SubtaskFailed, "no subtask succeeded");
            out.events.push(self.fail(parent_id, cause, now)?);
            current = parent_id;
        }
        Ok(out)
    }

    /// The parent record and its completed children's results, in declared
    /// order. `None` unless the parent is still awaiting synthesis.
    pub fn synthesis_inputs(&self, parent_id: Uuid) -> Option<(Task, Vec<ChildResult>)> {
        let parent = self.get(parent_id)?;
        if parent.status != TaskStatus::Decomposed {
            return None;
        }
        let parts = parent
            .children_ids
            .iter()
            .filter_map(|id| self.get(*id))
            .filter(|c| c.status == TaskStatus::Completed)
            .map(|c| ChildResult {
                task_id: c.id,
                title: c.title.clone(),
                content: c.result.clone().unwrap_or_default(),
                confidence: c.confidence,
            })
            .collect();
        Some((parent.clone(), parts))
    }

    /// Complete a decomposed parent with its synthesized result.
    pub fn complete_parent(
        &mut self,
        parent_id: Uuid,
        content: String,
        now: DateTime<Utc>,
    ) -> TroupeResult<Settlement> {
        let Some(parent) = self.get(parent_id) else {
            return Err(TroupeError::TaskNotFound(parent_id));
        };
        if parent.status != TaskStatus::Decomposed {
            return Ok(Settlement::default());
        }
        let children: Vec<&Task> = parent
            .children_ids
            .iter()
            .filter_map(|id| self.get(*id))
            .collect();
        let partial = children.iter().any(|c| c.status != TaskStatus::Completed);
        let confidences: Vec<f64> = children
            .iter()
            .filter(|c| c.status == TaskStatus::Completed)
            .filter_map(|c| c.confidence)
            .collect();
        let confidence = if confidences.is_empty() {
            None
        } else {
            Some(confidences.iter().sum::<f64>() / confidences.len() as f64)
        };

        let mut out = Settlement::default();
        out.events
            .push(self.complete(parent_id, content, confidence, partial, now)?);
        out.merge(self.on_child_terminal(parent_id, now)?);
        Ok(out)
    }
}
