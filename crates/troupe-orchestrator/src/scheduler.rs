//! The scheduling tick, execution hand-off and the background loop.

use crate::conflict::{self, Collected};
use crate::engine::Orchestrator;
use crate::task_table::TaskTable;
use crate::types::{AgentRef, ExecutionOutput, FailureCause, FailureKind, ResultEntry, Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

/// One hand-off of a task to an agent.
#[derive(Debug)]
pub struct Dispatch {
    pub id: u64,
    pub task_id: Uuid,
    pub agent_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub abort: Option<AbortHandle>,
}

/// In-flight dispatches. Whoever removes a record owns releasing its
/// reservation, so each reservation is released exactly once.
#[derive(Debug, Default)]
pub struct DispatchTable {
    active: HashMap<u64, Dispatch>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, dispatch: Dispatch) {
        self.active.insert(dispatch.id, dispatch);
    }

    pub fn set_abort(&mut self, id: u64, handle: AbortHandle) {
        if let Some(d) = self.active.get_mut(&id) {
            d.abort = Some(handle);
        }
    }

    pub fn get(&self, id: u64) -> Option<&Dispatch> {
        self.active.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Dispatch> {
        self.active.remove(&id)
    }

    pub fn remove_for_task(&mut self, task_id: Uuid) -> Vec<Dispatch> {
        let ids: Vec<u64> = self
            .active
            .values()
            .filter(|d| d.task_id == task_id)
            .map(|d| d.id)
            .collect();
        ids.into_iter().filter_map(|id| self.active.remove(&id)).collect()
    }

    /// Remove every dispatch whose deadline has passed, oldest first.
    pub fn take_expired(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let mut ids: Vec<u64> = self
            .active
            .values()
            .filter(|d| d.deadline <= now)
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| self.active.remove(&id)).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    /// Dispatches and waiting tasks that ran past their deadline.
    pub timed_out: usize,
    pub assigned: usize,
    /// Ready tasks left without an agent.
    pub waiting: usize,
}

impl Orchestrator {
    /// Run one scheduling pass at the current time.
    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Run one scheduling pass as of `now`: enforce deadlines, then place
    /// ready tasks on agents in priority order.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let guard = self.shared.tick_lock.lock().await;
        let mut report = TickReport::default();
        let synthesize = {
            let mut table = self.shared.tasks.write().await;
            let synthesize = self.enforce_timeouts(&mut table, now, &mut report);
            self.schedule_ready(&mut table, now, &mut report);
            synthesize
        };
        self.shared.in_flight.lock().retain(|h| !h.is_finished());
        drop(guard);

        self.synthesize_parents(synthesize).await;
        if report != TickReport::default() {
            debug!(
                assigned = report.assigned,
                waiting = report.waiting,
                timed_out = report.timed_out,
                "Tick"
            );
        }
        report
    }

    /// Wait until every spawned execution, including ones started while
    /// waiting, has finished.
    pub async fn settle(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.in_flight.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Execution task panicked");
                    }
                }
            }
        }
    }

    /// Spawn the background loop: ticks on the configured interval and
    /// whenever new work is signalled. Abort the handle to stop it.
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let period = engine.shared.config.tick_interval();
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = period.as_millis() as u64, "Scheduler started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = engine.shared.wake.notified() => {}
                }
                engine.tick().await;
            }
        })
    }

    fn enforce_timeouts(
        &self,
        table: &mut TaskTable,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Vec<Uuid> {
        let mut synthesize = Vec::new();

        let expired = self.shared.dispatches.lock().take_expired(now);
        for dispatch in expired {
            if let Some(handle) = &dispatch.abort {
                handle.abort();
            }
            let elapsed = (now - dispatch.started_at).to_std().unwrap_or_default();
            self.shared.registry.release(dispatch.agent_id);
            self.shared
                .registry
                .record_outcome(dispatch.agent_id, false, elapsed);
            warn!(
                task_id = %dispatch.task_id,
                agent_id = %dispatch.agent_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Dispatch timed out"
            );
            report.timed_out += 1;
            let cause = FailureCause::timeout(format!(
                "agent {} did not finish before the deadline",
                dispatch.agent_id
            ));
            synthesize.extend(self.record_failure(
                table,
                dispatch.task_id,
                cause,
                Some(dispatch.agent_id),
                now,
            ));
        }

        for id in table.with_status(TaskStatus::Ready) {
            let overdue = table.get(id).is_some_and(|t| t.deadline < now);
            if overdue {
                report.timed_out += 1;
                let cause = FailureCause::timeout("no agent became available before the deadline");
                synthesize.extend(self.record_failure(table, id, cause, None, now));
            }
        }
        synthesize
    }

    fn schedule_ready(&self, table: &mut TaskTable, now: DateTime<Utc>, report: &mut TickReport) {
        let registry = &self.shared.registry;
        for id in table.ready_in_order() {
            let Some(task) = table.get_mut(id) else {
                continue;
            };
            let mut excluded = std::mem::take(&mut task.excluded_agents);
            let required = task.required_capabilities.clone();
            excluded.extend(self.shared.results.lock().contributors(id));

            let chosen = registry
                .find_candidates(&required, &excluded)
                .into_iter()
                .find(|candidate| match registry.reserve(*candidate) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(task_id = %id, agent_id = %candidate, error = %e, "Reservation failed");
                        false
                    }
                });
            let Some(agent_id) = chosen else {
                debug!(task_id = %id, "No candidate agent; task stays ready");
                report.waiting += 1;
                continue;
            };

            match self.dispatch(table, id, agent_id, now) {
                Ok(()) => report.assigned += 1,
                Err(e) => {
                    registry.release(agent_id);
                    warn!(task_id = %id, agent_id = %agent_id, error = %e, "Dispatch failed");
                }
            }
        }
    }

    /// `Ready -> Assigned -> InProgress`, spawning the execution in between.
    fn dispatch(
        &self,
        table: &mut TaskTable,
        task_id: Uuid,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> TroupeResult<()> {
        let agent = self
            .shared
            .registry
            .agent_ref(agent_id)
            .ok_or(TroupeError::AgentNotFound(agent_id))?;
        let event = table.assign(task_id, agent_id, now)?;
        self.shared.events.publish(event);

        let task = table
            .get(task_id)
            .cloned()
            .ok_or(TroupeError::TaskNotFound(task_id))?;
        let deadline = task.deadline_from(now);
        let dispatch_id = self.shared.next_dispatch.fetch_add(1, Ordering::Relaxed);
        self.shared.dispatches.lock().insert(Dispatch {
            id: dispatch_id,
            task_id,
            agent_id,
            started_at: now,
            deadline,
            abort: None,
        });

        let engine = self.clone();
        let handle = tokio::spawn(async move {
            engine.run_dispatch(dispatch_id, task, agent).await;
        });
        self.shared
            .dispatches
            .lock()
            .set_abort(dispatch_id, handle.abort_handle());
        self.shared.in_flight.lock().push(handle);

        let event = table.begin(task_id, deadline, now)?;
        self.shared.events.publish(event);
        info!(task_id = %task_id, agent_id = %agent_id, dispatch_id, "Task dispatched");
        Ok(())
    }

    async fn run_dispatch(&self, dispatch_id: u64, task: Task, agent: AgentRef) {
        let started = std::time::Instant::now();
        let outcome = self
            .bounded("execute", self.shared.gateway.execute(&task, &agent))
            .await;
        self.finish_dispatch(dispatch_id, outcome, started.elapsed())
            .await;
    }

    /// Apply an execution outcome. The dispatch record, and with it the
    /// agent reservation, stays in place until the verdict is applied, so
    /// the dispatch deadline and abort handle also cover adjudication.
    async fn finish_dispatch(
        &self,
        dispatch_id: u64,
        outcome: TroupeResult<ExecutionOutput>,
        latency: Duration,
    ) {
        let mut synthesize = Vec::new();
        let pending = {
            let mut table = self.shared.tasks.write().await;
            let active = self
                .shared
                .dispatches
                .lock()
                .get(dispatch_id)
                .map(|d| (d.task_id, d.agent_id));
            let Some((task_id, agent_id)) = active else {
                debug!(dispatch_id, "Late result from an abandoned dispatch discarded");
                return;
            };
            let now = Utc::now();

            match outcome {
                Ok(output) => {
                    let expected = table.get(task_id).map_or(1, |t| t.redundancy as usize);
                    let entry = ResultEntry::new(agent_id, output.content, output.confidence);
                    let collected = self.shared.results.lock().collect(task_id, expected, entry);
                    match collected {
                        Collected::Complete(entries) => {
                            table.get(task_id).cloned().map(|task| (task, entries))
                        }
                        Collected::Waiting(_) | Collected::Duplicate => {
                            self.retire_dispatch(dispatch_id, true, latency);
                            match table.transition(task_id, TaskStatus::Ready, now) {
                                Ok(event) => self
                                    .shared
                                    .events
                                    .publish(event.with_detail("awaiting another independent result")),
                                Err(e) => warn!(task_id = %task_id, error = %e, "Could not re-queue task"),
                            }
                            None
                        }
                    }
                }
                Err(e) => {
                    self.retire_dispatch(dispatch_id, false, latency);
                    warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Execution failed");
                    let cause = FailureCause::from_error(&e);
                    synthesize.extend(self.record_failure(
                        &mut table,
                        task_id,
                        cause,
                        Some(agent_id),
                        now,
                    ));
                    None
                }
            }
        };

        if let Some((task, entries)) = pending {
            let verdict = conflict::resolve(
                self.shared.gateway.as_ref(),
                &task,
                entries,
                self.shared.config.confidence_floor,
                self.shared.config.gateway_timeout(),
            )
            .await;
            let mut table = self.shared.tasks.write().await;
            if self.retire_dispatch(dispatch_id, true, latency).is_none() {
                debug!(task_id = %task.id, dispatch_id, "Dispatch abandoned during resolution; verdict dropped");
            } else if table.status(task.id) != Some(TaskStatus::InProgress) {
                debug!(task_id = %task.id, "Task left execution during resolution; verdict dropped");
            } else {
                let now = Utc::now();
                match verdict {
                    Ok(consensus) => {
                        match table.complete(task.id, consensus.content, Some(consensus.confidence), false, now) {
                            Ok(event) => {
                                self.shared.events.publish(event);
                                match table.on_child_terminal(task.id, now) {
                                    Ok(settlement) => {
                                        synthesize.extend(self.apply_settlement(settlement));
                                    }
                                    Err(e) => warn!(task_id = %task.id, error = %e, "Parent update failed"),
                                }
                            }
                            Err(e) => warn!(task_id = %task.id, error = %e, "Could not complete task"),
                        }
                    }
                    Err(e) => {
                        let cause = FailureCause::from_error(&e);
                        synthesize.extend(self.record_failure(&mut table, task.id, cause, None, now));
                    }
                }
            }
        }

        self.synthesize_parents(synthesize).await;
        self.shared.wake.notify_one();
    }

    /// Remove a live dispatch and release its agent. `None` means the
    /// dispatch was already retired by a timeout or a cancellation.
    fn retire_dispatch(
        &self,
        dispatch_id: u64,
        success: bool,
        latency: Duration,
    ) -> Option<Dispatch> {
        let dispatch = self.shared.dispatches.lock().remove(dispatch_id)?;
        let registry = &self.shared.registry;
        registry.release(dispatch.agent_id);
        registry.record_outcome(dispatch.agent_id, success, latency);
        Some(dispatch)
    }

    /// Fail the current attempt, re-queueing when allowed, and propagate a
    /// terminal failure to the parent. Returns parents awaiting synthesis.
    fn record_failure(
        &self,
        table: &mut TaskTable,
        task_id: Uuid,
        cause: FailureCause,
        agent: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Vec<Uuid> {
        let kind = cause.kind;
        let outcome = match table.fail_attempt(task_id, cause, agent, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Failure not recorded");
                return Vec::new();
            }
        };
        self.shared.events.publish_all(outcome.events);
        if kind == FailureKind::NoViableResult || outcome.terminal {
            self.shared.results.lock().reset(task_id);
        }
        if !outcome.terminal {
            return Vec::new();
        }
        match table.on_child_terminal(task_id, now) {
            Ok(settlement) => self.apply_settlement(settlement),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Parent update failed");
                Vec::new()
            }
        }
    }
}
