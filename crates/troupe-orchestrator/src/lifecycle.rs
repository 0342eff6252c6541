//! Task lifecycle state machine.
//!
//! Every status change goes through [`TaskTable::transition`], which rejects
//! anything that is not an edge of the machine and keeps the bookkeeping
//! fields (timestamps, deadline, assignment) consistent with the new state.

use crate::events::LifecycleEvent;
use crate::task_table::TaskTable;
use crate::types::{FailureCause, TaskStatus};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

/// Whether `from -> to` is an edge of the lifecycle.
pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if to == Cancelled {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Submitted, Ready | Pending | Decomposed | Failed)
            | (Pending, Ready)
            | (Ready, Assigned | Failed)
            | (Assigned, InProgress | Failed)
            | (InProgress, Completed | Failed | Ready)
            | (Decomposed, Completed | Failed)
            | (Failed, Ready)
    )
}

/// Result of a failed attempt.
#[derive(Debug)]
pub struct AttemptOutcome {
    pub events: Vec<LifecycleEvent>,
    /// True when the task stayed `Failed` and will not run again.
    pub terminal: bool,
}

impl TaskTable {
    /// Apply one validated transition.
    pub fn transition(
        &mut self,
        id: Uuid,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> TroupeResult<LifecycleEvent> {
        let task = self.get_mut(id).ok_or(TroupeError::TaskNotFound(id))?;
        let from = task.status;
        if !can_transition(from, to) {
            return Err(TroupeError::InvalidTransition {
                task_id: id,
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        match to {
            TaskStatus::Ready => {
                task.assigned_agent_id = None;
                task.refresh_deadline(now);
            }
            TaskStatus::InProgress => {
                task.started_at = Some(now);
            }
            TaskStatus::Completed => {
                task.assigned_agent_id = None;
                task.error = None;
                task.completed_at = Some(now);
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                task.assigned_agent_id = None;
                task.completed_at = Some(now);
            }
            TaskStatus::Submitted
            | TaskStatus::Pending
            | TaskStatus::Decomposed
            | TaskStatus::Assigned => {}
        }
        task.status = to;
        task.updated_at = now;
        debug!(task_id = %id, from = %from, to = %to, "Task transition");
        Ok(LifecycleEvent::new(id, Some(from), to, now))
    }

    /// `Ready -> Assigned`, recording the agent.
    pub fn assign(
        &mut self,
        id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> TroupeResult<LifecycleEvent> {
        let event = self.transition(id, TaskStatus::Assigned, now)?;
        if let Some(task) = self.get_mut(id) {
            task.assigned_agent_id = Some(agent_id);
        }
        Ok(event.with_detail(format!("agent {agent_id}")))
    }

    /// `Assigned -> InProgress`, starting the execution deadline clock.
    pub fn begin(
        &mut self,
        id: Uuid,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> TroupeResult<LifecycleEvent> {
        let event = self.transition(id, TaskStatus::InProgress, now)?;
        if let Some(task) = self.get_mut(id) {
            task.deadline = deadline;
        }
        Ok(event)
    }

    pub fn complete(
        &mut self,
        id: Uuid,
        result: String,
        confidence: Option<f64>,
        partial: bool,
        now: DateTime<Utc>,
    ) -> TroupeResult<LifecycleEvent> {
        let event = self.transition(id, TaskStatus::Completed, now)?;
        if let Some(task) = self.get_mut(id) {
            task.result = Some(result);
            task.confidence = confidence;
            task.partial_result = partial;
        }
        info!(task_id = %id, partial, "Task completed");
        Ok(event)
    }

    pub fn fail(
        &mut self,
        id: Uuid,
        cause: FailureCause,
        now: DateTime<Utc>,
    ) -> TroupeResult<LifecycleEvent> {
        let event = self.transition(id, TaskStatus::Failed, now)?;
        let detail = cause.message.clone();
        if let Some(task) = self.get_mut(id) {
            task.error = Some(cause);
        }
        Ok(event.with_detail(detail))
    }

    /// `Failed -> Ready` for a retryable failure with budget left.
    ///
    /// `exclude` keeps the agent that just failed out of the next candidate pool.
    pub fn retry(
        &mut self,
        id: Uuid,
        exclude: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> TroupeResult<LifecycleEvent> {
        let task = self.get(id).ok_or(TroupeError::TaskNotFound(id))?;
        let retryable = task.status == TaskStatus::Failed
            && task.error.as_ref().is_some_and(|e| e.kind.is_retryable())
            && task.has_retries_left();
        if !retryable {
            return Err(TroupeError::InvalidTransition {
                task_id: id,
                from: task.status.to_string(),
                to: TaskStatus::Ready.to_string(),
            });
        }
        let event = self.transition(id, TaskStatus::Ready, now)?;
        let attempt = match self.get_mut(id) {
            Some(task) => {
                task.attempt_count += 1;
                task.excluded_agents.extend(exclude);
                task.attempt_count
            }
            None => 0,
        };
        Ok(event.with_detail(format!("retry attempt {attempt}")))
    }

    /// Record a failed attempt: `-> Failed`, then straight back to `Ready`
    /// when the failure is retryable and budget remains.
    pub fn fail_attempt(
        &mut self,
        id: Uuid,
        cause: FailureCause,
        agent: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> TroupeResult<AttemptOutcome> {
        let retryable = cause.kind.is_retryable();
        let kind = cause.kind;
        let mut events = vec![self.fail(id, cause, now)?];
        let can_retry = retryable && self.get(id).is_some_and(|t| t.has_retries_left());
        if can_retry {
            events.push(self.retry(id, agent, now)?);
            warn!(task_id = %id, cause = ?kind, "Attempt failed; task re-queued");
            Ok(AttemptOutcome {
                events,
                terminal: false,
            })
        } else {
            error!(task_id = %id, cause = ?kind, "Task failed");
            Ok(AttemptOutcome {
                events,
                terminal: true,
            })
        }
    }
}
