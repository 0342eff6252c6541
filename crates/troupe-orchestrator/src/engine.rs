use crate::collaboration::CollaborationDesk;
use crate::config::{EngineConfig, SynthesisPolicy};
use crate::conflict::{self, ResultBook};
use crate::events::{EventBus, EventSubscription, LifecycleEvent};
use crate::gateway::{concatenate, ReasoningGateway};
use crate::graph::{should_decompose, Settlement};
use crate::profiles::{any_profile_covers, category_capabilities, profile_capabilities};
use crate::registry::AgentRegistry;
use crate::scheduler::DispatchTable;
use crate::task_table::TaskTable;
use crate::types::{
    AgentDescriptor, CapabilitySet, Consensus, ResultEntry, SubtaskDescriptor, Task,
    TaskStatus, TaskSubmission, MAX_TIMEOUT_SECS,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

/// State shared between the public handle, the scheduling loop and
/// in-flight executions.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    pub(crate) gateway: Arc<dyn ReasoningGateway>,
    pub(crate) registry: AgentRegistry,
    pub(crate) tasks: RwLock<TaskTable>,
    pub(crate) results: Mutex<ResultBook>,
    pub(crate) dispatches: Mutex<DispatchTable>,
    pub(crate) events: EventBus,
    pub(crate) desk: CollaborationDesk,
    /// Serializes ticks.
    pub(crate) tick_lock: tokio::sync::Mutex<()>,
    pub(crate) in_flight: Mutex<Vec<JoinHandle<()>>>,
    /// Signalled whenever scheduling work may have appeared.
    pub(crate) wake: Notify,
    pub(crate) next_dispatch: AtomicU64,
}

/// The orchestration engine.
///
/// Cheap to clone; every clone drives the same engine. Tasks move through
/// their lifecycle as [`Orchestrator::tick`] runs, either called directly or
/// from the loop spawned by [`Orchestrator::start`].
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, gateway: Arc<dyn ReasoningGateway>) -> TroupeResult<Self> {
        config.validate()?;
        let registry = AgentRegistry::new(config.performance_window, config.scoring.clone());
        let events = EventBus::new(config.event_capacity);
        let desk = CollaborationDesk::new(config.message_log_capacity);
        Ok(Self {
            shared: Arc::new(Shared {
                registry,
                gateway,
                tasks: RwLock::new(TaskTable::new()),
                results: Mutex::new(ResultBook::new()),
                dispatches: Mutex::new(DispatchTable::new()),
                events,
                desk,
                tick_lock: tokio::sync::Mutex::new(()),
                in_flight: Mutex::new(Vec::new()),
                wake: Notify::new(),
                next_dispatch: AtomicU64::new(1),
                config,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.shared.registry
    }

    pub fn register_agent(&self, descriptor: AgentDescriptor) -> TroupeResult<Uuid> {
        let id = self.shared.registry.register(descriptor)?;
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Take an agent out of the candidate pool. Work already running on it
    /// is left to finish.
    pub fn set_agent_offline(&self, agent_id: Uuid) -> TroupeResult<()> {
        self.shared.registry.set_offline(agent_id)
    }

    pub fn set_agent_online(&self, agent_id: Uuid) -> TroupeResult<()> {
        self.shared.registry.set_online(agent_id)?;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Live lifecycle events from this moment on.
    pub fn subscribe(&self) -> EventSubscription {
        self.shared.events.subscribe()
    }

    /// Accept a task. Decomposition, when warranted, happens before this returns.
    pub async fn submit(&self, submission: TaskSubmission) -> TroupeResult<Uuid> {
        let task = self.build_task(submission)?;
        let id = task.id;
        {
            let mut table = self.shared.tasks.write().await;
            table.insert(task.clone());
            self.shared.events.publish(
                LifecycleEvent::new(id, None, TaskStatus::Submitted, task.created_at)
                    .with_detail(task.title.clone()),
            );
        }
        info!(task_id = %id, title = %task.title, "Task submitted");

        let covered = any_profile_covers(&task.required_capabilities)
            || self.shared.registry.any_covers(&task.required_capabilities);
        if should_decompose(
            &task,
            self.shared.config.decompose_capability_threshold,
            covered,
        ) {
            match self
                .bounded("decompose", self.shared.gateway.decompose(&task))
                .await
            {
                Ok(descriptors) if descriptors.is_empty() => {
                    debug!(task_id = %id, "Gateway declined decomposition");
                }
                Ok(descriptors) => {
                    if let Err(e) = self.decompose_task(id, &descriptors).await {
                        debug!(task_id = %id, error = %e, "Decomposition not applied");
                    }
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Decomposition failed; running task as a single unit");
                }
            }
        }

        {
            let mut table = self.shared.tasks.write().await;
            if table.status(id) == Some(TaskStatus::Submitted) {
                let event = table.transition(id, TaskStatus::Ready, Utc::now())?;
                self.shared.events.publish(event);
            }
        }
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Apply a decomposition to a submitted task, returning the child ids.
    ///
    /// A structurally invalid decomposition fails the task terminally and the
    /// cause is returned.
    pub async fn decompose_task(
        &self,
        task_id: Uuid,
        descriptors: &[SubtaskDescriptor],
    ) -> TroupeResult<Vec<Uuid>> {
        let mut table = self.shared.tasks.write().await;
        let now = Utc::now();
        match table.build_children(task_id, descriptors, self.shared.config.max_subtasks, now) {
            Ok(events) => {
                self.shared.events.publish_all(events);
                self.shared.wake.notify_one();
                Ok(table
                    .get(task_id)
                    .map(|t| t.children_ids.clone())
                    .unwrap_or_default())
            }
            Err(e) if e.is_structural() => {
                error!(task_id = %task_id, error = %e, "Decomposition rejected");
                let cause = crate::types::FailureCause::from_error(&e);
                if table.status(task_id) == Some(TaskStatus::Submitted) {
                    let event = table.fail(task_id, cause, now)?;
                    self.shared.events.publish(event);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel a task and every unfinished descendant.
    pub async fn cancel(&self, task_id: Uuid) -> TroupeResult<()> {
        let synthesize = {
            let mut table = self.shared.tasks.write().await;
            let status = table
                .status(task_id)
                .ok_or(TroupeError::TaskNotFound(task_id))?;
            if status.is_terminal() {
                return Err(TroupeError::InvalidTransition {
                    task_id,
                    from: status.to_string(),
                    to: TaskStatus::Cancelled.to_string(),
                });
            }
            let now = Utc::now();
            let mut settlement = table.cancel_subtree(task_id, now)?;
            settlement.merge(table.on_child_terminal(task_id, now)?);
            info!(task_id = %task_id, cancelled = settlement.cancelled.len(), "Task cancelled");
            self.apply_settlement(settlement)
        };
        self.synthesize_parents(synthesize).await;
        self.shared.wake.notify_one();
        Ok(())
    }

    /// A copy of the task record.
    pub async fn task(&self, task_id: Uuid) -> Option<Task> {
        self.shared.tasks.read().await.get(task_id).cloned()
    }

    /// Whether every known task has finished.
    pub async fn is_settled(&self) -> bool {
        self.shared.tasks.read().await.is_settled()
    }

    /// Reconcile results a consumer found contradictory. The task record is
    /// left unchanged.
    pub async fn resolve_conflict(
        &self,
        task_id: Uuid,
        entries: Vec<ResultEntry>,
    ) -> TroupeResult<Consensus> {
        if entries.is_empty() {
            return Err(TroupeError::Validation(
                "conflict resolution needs at least one result".into(),
            ));
        }
        let task = self
            .task(task_id)
            .await
            .ok_or(TroupeError::TaskNotFound(task_id))?;
        conflict::resolve(
            self.shared.gateway.as_ref(),
            &task,
            entries,
            self.shared.config.confidence_floor,
            self.shared.config.gateway_timeout(),
        )
        .await
    }

    fn build_task(&self, submission: TaskSubmission) -> TroupeResult<Task> {
        let config = &self.shared.config;
        let title = submission.title.trim();
        if title.is_empty() {
            return Err(TroupeError::Validation("task title must not be empty".into()));
        }
        let task_type = submission
            .task_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| "general".to_string());

        let mut caps: CapabilitySet = submission
            .required_capabilities
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if caps.is_empty() {
            if let Some(defaults) = category_capabilities(&task_type) {
                caps = defaults.iter().map(|c| (*c).to_string()).collect();
            }
        }
        if caps.is_empty() {
            return Err(TroupeError::Validation(
                "task requires at least one capability".into(),
            ));
        }
        let mut known = profile_capabilities();
        known.extend(self.shared.registry.known_capabilities());
        if caps.is_disjoint(&known) {
            return Err(TroupeError::Validation(format!(
                "no known capability among {:?}",
                caps.iter().collect::<Vec<_>>()
            )));
        }

        let redundancy = submission.redundancy.unwrap_or(config.default_redundancy);
        if redundancy == 0 {
            return Err(TroupeError::Validation("redundancy must be at least 1".into()));
        }
        let timeout_ms = match submission.timeout_secs {
            Some(0) => {
                return Err(TroupeError::Validation("timeout must be positive".into()));
            }
            Some(secs) if secs > MAX_TIMEOUT_SECS => {
                return Err(TroupeError::Validation(format!(
                    "timeout of {secs}s exceeds the {MAX_TIMEOUT_SECS}s limit"
                )));
            }
            Some(secs) => secs * 1000,
            None => config.task_timeout_ms(),
        };

        let mut task = Task::new(title, submission.description, caps)
            .with_priority(submission.priority.unwrap_or(1))
            .with_timeout_ms(timeout_ms);
        task.task_type = task_type;
        task.max_retries = submission.max_retries.unwrap_or(config.max_retries);
        task.redundancy = redundancy;
        task.tolerate_partial_failure = submission
            .tolerate_partial_failure
            .unwrap_or(config.tolerate_partial_failure);
        task.decompose = submission.decompose;
        Ok(task)
    }

    /// Bound a gateway call by the configured timeout.
    pub(crate) async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = TroupeResult<T>>,
    ) -> TroupeResult<T> {
        let limit = self.shared.config.gateway_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(TroupeError::Timeout(format!(
                "gateway {operation} exceeded {}s",
                limit.as_secs()
            ))),
        }
    }

    /// Publish a settlement's events and abort work on the tasks it cancelled.
    /// Returns the parents now awaiting synthesis.
    pub(crate) fn apply_settlement(&self, settlement: Settlement) -> Vec<Uuid> {
        self.shared.events.publish_all(settlement.events);
        for task_id in &settlement.cancelled {
            self.abort_dispatches(*task_id);
            self.shared.results.lock().reset(*task_id);
        }
        settlement.synthesize
    }

    /// Abort and release every dispatch of `task_id`.
    pub(crate) fn abort_dispatches(&self, task_id: Uuid) {
        let removed = self.shared.dispatches.lock().remove_for_task(task_id);
        for dispatch in removed {
            if let Some(handle) = &dispatch.abort {
                handle.abort();
            }
            self.shared.registry.release(dispatch.agent_id);
            debug!(task_id = %task_id, agent_id = %dispatch.agent_id, "Dispatch aborted");
        }
    }

    /// Merge children's results into each parent, walking up as parents complete.
    pub(crate) async fn synthesize_parents(&self, parents: Vec<Uuid>) {
        let mut queue: VecDeque<Uuid> = parents.into();
        while let Some(parent_id) = queue.pop_front() {
            let inputs = self.shared.tasks.read().await.synthesis_inputs(parent_id);
            let Some((parent, parts)) = inputs else {
                continue;
            };
            let content = match self.shared.config.synthesis {
                SynthesisPolicy::Concatenate => concatenate(&parts),
                SynthesisPolicy::Gateway => match self
                    .bounded("synthesize", self.shared.gateway.synthesize(&parent, &parts))
                    .await
                {
                    Ok(content) => content,
                    Err(e) => {
                        warn!(task_id = %parent_id, error = %e, "Synthesis failed; concatenating results");
                        concatenate(&parts)
                    }
                },
            };

            let mut table = self.shared.tasks.write().await;
            match table.complete_parent(parent_id, content, Utc::now()) {
                Ok(settlement) => queue.extend(self.apply_settlement(settlement)),
                Err(e) => warn!(task_id = %parent_id, error = %e, "Could not complete parent"),
            }
        }
    }
}
