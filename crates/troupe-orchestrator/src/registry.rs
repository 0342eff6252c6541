use crate::config::ScoringWeights;
use crate::profiles::profile_for;
use crate::types::{AgentDescriptor, AgentRef, AgentStatus, AgentType, CapabilitySet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    latency: Duration,
}

#[derive(Debug, Clone)]
struct AgentRecord {
    id: Uuid,
    name: String,
    agent_type: AgentType,
    capabilities: CapabilitySet,
    status: AgentStatus,
    current_load: u32,
    max_concurrency: u32,
    priority_weight: f64,
    performance: VecDeque<Outcome>,
    tasks_completed: u64,
    tasks_failed: u64,
    registered_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl AgentRecord {
    /// Success rate over the window; an agent with no history counts as perfect.
    fn success_rate(&self) -> f64 {
        if self.performance.is_empty() {
            return 1.0;
        }
        let ok = self.performance.iter().filter(|o| o.success).count();
        ok as f64 / self.performance.len() as f64
    }

    fn mean_latency_secs(&self) -> f64 {
        if self.performance.is_empty() {
            return 0.0;
        }
        let total: f64 = self.performance.iter().map(|o| o.latency.as_secs_f64()).sum();
        total / self.performance.len() as f64
    }

    fn has_headroom(&self) -> bool {
        self.status != AgentStatus::Offline && self.current_load < self.max_concurrency
    }

    fn score(&self, w: &ScoringWeights) -> f64 {
        let load = 1.0 - f64::from(self.current_load) / f64::from(self.max_concurrency.max(1));
        w.load * load
            + w.success * self.success_rate()
            + w.latency / (1.0 + self.mean_latency_secs())
            + w.type_priority * self.priority_weight
    }

    fn to_ref(&self) -> AgentRef {
        AgentRef {
            id: self.id,
            name: self.name.clone(),
            agent_type: self.agent_type,
            capabilities: self.capabilities.clone(),
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            name: self.name.clone(),
            agent_type: self.agent_type,
            capabilities: self.capabilities.clone(),
            status: self.status,
            current_load: self.current_load,
            max_concurrency: self.max_concurrency,
            success_rate: self.success_rate(),
            mean_latency_ms: (self.mean_latency_secs() * 1000.0).round() as u64,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            registered_at: self.registered_at,
            last_active: self.last_active,
        }
    }
}

/// Point-in-time view of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    pub capabilities: CapabilitySet,
    pub status: AgentStatus,
    pub current_load: u32,
    pub max_concurrency: u32,
    pub success_rate: f64,
    pub mean_latency_ms: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub registered_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Owns agent identities, capability sets, load counters and rolling
/// performance windows. Agents are never removed, only taken offline.
pub struct AgentRegistry {
    agents: Mutex<HashMap<Uuid, AgentRecord>>,
    window: usize,
    weights: ScoringWeights,
}

impl AgentRegistry {
    pub fn new(window: usize, weights: ScoringWeights) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            window: window.max(1),
            weights,
        }
    }

    /// Register an agent. Capabilities and concurrency default to the type profile.
    pub fn register(&self, descriptor: AgentDescriptor) -> TroupeResult<Uuid> {
        let name = descriptor.name.trim().to_string();
        if name.is_empty() {
            return Err(TroupeError::Validation("agent name must not be empty".into()));
        }
        let profile = profile_for(descriptor.agent_type);
        let capabilities: CapabilitySet = match descriptor.capabilities {
            Some(caps) => caps
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            None => profile.capability_set(),
        };
        if capabilities.is_empty() {
            return Err(TroupeError::Validation(format!(
                "agent '{name}' advertises no capabilities"
            )));
        }
        let max_concurrency = descriptor.max_concurrency.unwrap_or(profile.max_concurrency);
        if max_concurrency == 0 {
            return Err(TroupeError::Validation(format!(
                "agent '{name}' must accept at least one task"
            )));
        }

        let mut agents = self.agents.lock();
        if agents
            .values()
            .any(|a| a.name == name && a.status != AgentStatus::Offline)
        {
            return Err(TroupeError::DuplicateAgent(name));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        agents.insert(
            id,
            AgentRecord {
                id,
                name: name.clone(),
                agent_type: descriptor.agent_type,
                capabilities,
                status: AgentStatus::Idle,
                current_load: 0,
                max_concurrency,
                priority_weight: profile.priority_weight,
                performance: VecDeque::with_capacity(self.window),
                tasks_completed: 0,
                tasks_failed: 0,
                registered_at: now,
                last_active: now,
            },
        );
        info!(agent_id = %id, name = %name, agent_type = %descriptor.agent_type, "Agent registered");
        Ok(id)
    }

    /// Agents holding every required capability with headroom left, best first.
    pub fn find_candidates(
        &self,
        required: &CapabilitySet,
        excluded: &BTreeSet<Uuid>,
    ) -> Vec<Uuid> {
        let agents = self.agents.lock();
        let mut scored: Vec<(f64, Uuid)> = agents
            .values()
            .filter(|a| a.has_headroom())
            .filter(|a| !excluded.contains(&a.id))
            .filter(|a| required.is_subset(&a.capabilities))
            .map(|a| (a.score(&self.weights), a.id))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        debug!(required = ?required, candidates = scored.len(), "Candidate search");
        scored.into_iter().map(|(_, id)| id).collect()
    }

    /// Take one unit of the agent's concurrency.
    pub fn reserve(&self, id: Uuid) -> TroupeResult<()> {
        let mut agents = self.agents.lock();
        let agent = agents.get_mut(&id).ok_or(TroupeError::AgentNotFound(id))?;
        if !agent.has_headroom() {
            return Err(TroupeError::AgentUnavailable(id));
        }
        agent.current_load += 1;
        agent.status = AgentStatus::Busy;
        agent.last_active = Utc::now();
        Ok(())
    }

    /// Return one unit of the agent's concurrency.
    pub fn release(&self, id: Uuid) {
        let mut agents = self.agents.lock();
        if let Some(agent) = agents.get_mut(&id) {
            agent.current_load = agent.current_load.saturating_sub(1);
            if agent.current_load == 0 && agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
            }
        }
    }

    /// Push an outcome into the rolling window, evicting the oldest.
    pub fn record_outcome(&self, id: Uuid, success: bool, latency: Duration) {
        let mut agents = self.agents.lock();
        if let Some(agent) = agents.get_mut(&id) {
            if agent.performance.len() >= self.window {
                agent.performance.pop_front();
            }
            agent.performance.push_back(Outcome { success, latency });
            if success {
                agent.tasks_completed += 1;
            } else {
                agent.tasks_failed += 1;
            }
            agent.last_active = Utc::now();
        }
    }

    pub fn set_offline(&self, id: Uuid) -> TroupeResult<()> {
        let mut agents = self.agents.lock();
        let agent = agents.get_mut(&id).ok_or(TroupeError::AgentNotFound(id))?;
        agent.status = AgentStatus::Offline;
        info!(agent_id = %id, "Agent offline");
        Ok(())
    }

    pub fn set_online(&self, id: Uuid) -> TroupeResult<()> {
        let mut agents = self.agents.lock();
        let name = agents
            .get(&id)
            .map(|a| a.name.clone())
            .ok_or(TroupeError::AgentNotFound(id))?;
        if agents
            .values()
            .any(|a| a.id != id && a.name == name && a.status != AgentStatus::Offline)
        {
            return Err(TroupeError::DuplicateAgent(name));
        }
        if let Some(agent) = agents.get_mut(&id) {
            if agent.status == AgentStatus::Offline {
                agent.status = if agent.current_load > 0 {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Idle
                };
                info!(agent_id = %id, "Agent online");
            }
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<AgentSnapshot> {
        self.agents.lock().get(&id).map(AgentRecord::snapshot)
    }

    pub fn agent_ref(&self, id: Uuid) -> Option<AgentRef> {
        self.agents.lock().get(&id).map(AgentRecord::to_ref)
    }

    /// All agents, ordered by name.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let mut all: Vec<AgentSnapshot> =
            self.agents.lock().values().map(AgentRecord::snapshot).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Whether one non-offline agent holds the whole set.
    pub fn any_covers(&self, required: &CapabilitySet) -> bool {
        self.agents
            .lock()
            .values()
            .any(|a| a.status != AgentStatus::Offline && required.is_subset(&a.capabilities))
    }

    /// Every capability any registered agent has advertised.
    pub fn known_capabilities(&self) -> CapabilitySet {
        self.agents
            .lock()
            .values()
            .flat_map(|a| a.capabilities.iter().cloned())
            .collect()
    }

    /// Non-offline agents holding at least one of `capabilities`, other than `except`.
    pub fn holders_of_any(&self, capabilities: &CapabilitySet, except: Uuid) -> Vec<AgentRef> {
        let agents = self.agents.lock();
        let mut found: Vec<AgentRef> = agents
            .values()
            .filter(|a| a.id != except && a.status != AgentStatus::Offline)
            .filter(|a| !a.capabilities.is_disjoint(capabilities))
            .map(AgentRecord::to_ref)
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        found
    }

    pub fn len(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(50, ScoringWeights::default())
    }

    fn caps(tags: &[&str]) -> CapabilitySet {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_register_uses_profile_defaults() {
        let reg = registry();
        let id = reg
            .register(AgentDescriptor::new("code-1", AgentType::Code))
            .unwrap();
        let snap = reg.get(id).unwrap();
        assert_eq!(snap.max_concurrency, 2);
        assert_eq!(snap.status, AgentStatus::Idle);
        assert!(snap.capabilities.contains("debugging"));
        assert_eq!(snap.current_load, 0);
    }

    #[test]
    fn test_duplicate_name_rejected_until_offline() {
        let reg = registry();
        let first = reg
            .register(AgentDescriptor::new("alpha", AgentType::Research))
            .unwrap();
        let err = reg
            .register(AgentDescriptor::new("alpha", AgentType::Research))
            .unwrap_err();
        assert!(matches!(err, TroupeError::DuplicateAgent(_)));

        reg.set_offline(first).unwrap();
        let second = reg
            .register(AgentDescriptor::new("alpha", AgentType::Research))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(reg.len(), 2);

        let err = reg.set_online(first).unwrap_err();
        assert!(matches!(err, TroupeError::DuplicateAgent(_)));
    }

    #[test]
    fn test_register_rejects_empty_capabilities() {
        let reg = registry();
        let err = reg
            .register(
                AgentDescriptor::new("blank", AgentType::Creative)
                    .with_capabilities(Vec::<String>::new()),
            )
            .unwrap_err();
        assert!(matches!(err, TroupeError::Validation(_)));
    }

    #[test]
    fn test_candidates_require_superset() {
        let reg = registry();
        let analysis = reg
            .register(AgentDescriptor::new("an", AgentType::Analysis))
            .unwrap();
        reg.register(AgentDescriptor::new("re", AgentType::Research))
            .unwrap();

        let found = reg.find_candidates(&caps(&["forecasting"]), &BTreeSet::new());
        assert_eq!(found, vec![analysis]);

        let none = reg.find_candidates(&caps(&["forecasting", "translation"]), &BTreeSet::new());
        assert!(none.is_empty());
    }

    #[test]
    fn test_candidates_ordered_by_type_weight_when_fresh() {
        let reg = registry();
        let research = reg
            .register(
                AgentDescriptor::new("re", AgentType::Research).with_capabilities(["data_processing"]),
            )
            .unwrap();
        let analysis = reg
            .register(AgentDescriptor::new("an", AgentType::Analysis))
            .unwrap();
        let found = reg.find_candidates(&caps(&["data_processing"]), &BTreeSet::new());
        assert_eq!(found, vec![analysis, research]);
    }

    #[test]
    fn test_load_lowers_score() {
        let reg = registry();
        let a = reg
            .register(AgentDescriptor::new("a", AgentType::Analysis))
            .unwrap();
        let b = reg
            .register(AgentDescriptor::new("b", AgentType::Analysis))
            .unwrap();
        reg.reserve(a).unwrap();
        let found = reg.find_candidates(&caps(&["forecasting"]), &BTreeSet::new());
        assert_eq!(found, vec![b, a]);
    }

    #[test]
    fn test_failures_lower_score() {
        let reg = registry();
        let a = reg
            .register(AgentDescriptor::new("a", AgentType::Analysis))
            .unwrap();
        let b = reg
            .register(AgentDescriptor::new("b", AgentType::Analysis))
            .unwrap();
        reg.record_outcome(a, false, Duration::from_millis(10));
        reg.record_outcome(b, true, Duration::from_millis(10));
        let found = reg.find_candidates(&caps(&["forecasting"]), &BTreeSet::new());
        assert_eq!(found, vec![b, a]);
    }

    #[test]
    fn test_excluded_and_offline_skipped() {
        let reg = registry();
        let a = reg
            .register(AgentDescriptor::new("a", AgentType::Analysis))
            .unwrap();
        let b = reg
            .register(AgentDescriptor::new("b", AgentType::Analysis))
            .unwrap();
        let excluded: BTreeSet<Uuid> = [a].into_iter().collect();
        assert_eq!(reg.find_candidates(&caps(&["forecasting"]), &excluded), vec![b]);

        reg.set_offline(b).unwrap();
        assert!(reg.find_candidates(&caps(&["forecasting"]), &excluded).is_empty());
        assert!(!reg.any_covers(&caps(&["translation"])));
    }

    #[test]
    fn test_reserve_respects_limit() {
        let reg = registry();
        let id = reg
            .register(AgentDescriptor::new("solo", AgentType::Analysis).with_max_concurrency(1))
            .unwrap();
        reg.reserve(id).unwrap();
        assert_eq!(reg.get(id).unwrap().status, AgentStatus::Busy);
        assert!(matches!(
            reg.reserve(id).unwrap_err(),
            TroupeError::AgentUnavailable(_)
        ));
        assert!(reg.find_candidates(&caps(&["forecasting"]), &BTreeSet::new()).is_empty());

        reg.release(id);
        let snap = reg.get(id).unwrap();
        assert_eq!(snap.current_load, 0);
        assert_eq!(snap.status, AgentStatus::Idle);

        // Releasing an idle agent saturates at zero.
        reg.release(id);
        assert_eq!(reg.get(id).unwrap().current_load, 0);
    }

    #[test]
    fn test_reserve_offline_fails() {
        let reg = registry();
        let id = reg
            .register(AgentDescriptor::new("x", AgentType::Code))
            .unwrap();
        reg.set_offline(id).unwrap();
        assert!(matches!(
            reg.reserve(id).unwrap_err(),
            TroupeError::AgentUnavailable(_)
        ));
        assert!(matches!(
            reg.reserve(Uuid::new_v4()).unwrap_err(),
            TroupeError::AgentNotFound(_)
        ));
    }

    #[test]
    fn test_performance_window_evicts_oldest() {
        let reg = AgentRegistry::new(2, ScoringWeights::default());
        let id = reg
            .register(AgentDescriptor::new("w", AgentType::Research))
            .unwrap();
        reg.record_outcome(id, false, Duration::from_secs(1));
        reg.record_outcome(id, true, Duration::from_secs(1));
        reg.record_outcome(id, true, Duration::from_secs(3));
        let snap = reg.get(id).unwrap();
        assert!((snap.success_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(snap.mean_latency_ms, 2000);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.tasks_completed, 2);
    }

    #[test]
    fn test_holders_of_any() {
        let reg = registry();
        let asker = reg
            .register(AgentDescriptor::new("asker", AgentType::Code))
            .unwrap();
        reg.register(AgentDescriptor::new("helper", AgentType::Research))
            .unwrap();
        reg.register(AgentDescriptor::new("bystander", AgentType::Creative))
            .unwrap();
        let found = reg.holders_of_any(&caps(&["fact_checking", "testing"]), asker);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "helper");
    }
}
