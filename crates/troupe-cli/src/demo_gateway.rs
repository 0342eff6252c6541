//! Deterministic offline gateway used by the `run` command.
//!
//! Splits wide tasks along agent-type lines, answers every execution with a
//! canned report and a stable pseudo-confidence, and settles disagreements by
//! picking the most confident entry. No network access is involved.

use async_trait::async_trait;
use troupe_core::{TroupeError, TroupeResult};
use troupe_orchestrator::profiles::default_profiles;
use troupe_orchestrator::{
    AgentRef, Consensus, ExecutionOutput, ReasoningGateway, ResultEntry, SubtaskDescriptor, Task,
};

#[derive(Debug, Default)]
pub struct DemoGateway;

impl DemoGateway {
    pub fn new() -> Self {
        Self
    }
}

/// Stable value in `[0.70, 0.98]` derived from the inputs.
fn pseudo_confidence(task: &Task, agent: &AgentRef) -> f64 {
    let seed = task
        .title
        .bytes()
        .chain(agent.name.bytes())
        .fold(17u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    0.70 + f64::from(seed % 29) / 100.0
}

#[async_trait]
impl ReasoningGateway for DemoGateway {
    async fn decompose(&self, task: &Task) -> TroupeResult<Vec<SubtaskDescriptor>> {
        let mut parts = Vec::new();
        for profile in default_profiles() {
            let caps: Vec<&str> = task
                .required_capabilities
                .iter()
                .map(String::as_str)
                .filter(|c| profile.capabilities.contains(c))
                .collect();
            if caps.is_empty() {
                continue;
            }
            let key = profile.agent_type.to_string();
            parts.push(
                SubtaskDescriptor::new(key.clone(), format!("{} ({key} work)", task.title))
                    .with_description(format!("Cover {} for: {}", caps.join(", "), task.description))
                    .with_capabilities(caps),
            );
        }
        if parts.len() > 1 {
            let keys: Vec<String> = parts.iter().map(|p| p.key.clone()).collect();
            let caps = parts[0].required_capabilities.clone();
            parts.push(
                SubtaskDescriptor::new("integrate", format!("{} (integration)", task.title))
                    .with_description("Merge the partial deliverables into one")
                    .with_capabilities(caps)
                    .depends_on(keys),
            );
        }
        Ok(parts)
    }

    async fn execute(&self, task: &Task, agent: &AgentRef) -> TroupeResult<ExecutionOutput> {
        if task.title.trim().is_empty() {
            return Err(TroupeError::Gateway("cannot execute an untitled task".into()));
        }
        let caps: Vec<&str> = task
            .required_capabilities
            .iter()
            .map(String::as_str)
            .collect();
        let content = format!(
            "{} agent '{}' completed '{}' using {}",
            agent.agent_type,
            agent.name,
            task.title,
            caps.join(", ")
        );
        Ok(ExecutionOutput::new(content, pseudo_confidence(task, agent)))
    }

    async fn adjudicate(&self, task: &Task, entries: &[ResultEntry]) -> TroupeResult<Consensus> {
        entries
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|best| Consensus {
                content: best.content.clone(),
                confidence: best.confidence,
            })
            .ok_or(TroupeError::NoViableResult(task.id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use troupe_orchestrator::AgentType;
    use uuid::Uuid;

    fn task(caps: &[&str]) -> Task {
        Task::new(
            "Launch",
            "go to market",
            caps.iter().map(|c| (*c).to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_decompose_by_agent_type() {
        let parts = DemoGateway::new()
            .decompose(&task(&["code_generation", "testing", "creative_writing"]))
            .await
            .unwrap();
        let keys: Vec<&str> = parts.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["code", "creative", "integrate"]);
        assert_eq!(parts[2].depends_on.len(), 2);
    }

    #[tokio::test]
    async fn test_narrow_task_not_split() {
        let parts = DemoGateway::new()
            .decompose(&task(&["code_generation"]))
            .await
            .unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_is_deterministic() {
        let agent = AgentRef {
            id: Uuid::new_v4(),
            name: "analyst-1".into(),
            agent_type: AgentType::Analysis,
            capabilities: Default::default(),
        };
        let gw = DemoGateway::new();
        let t = task(&["forecasting"]);
        let a = gw.execute(&t, &agent).await.unwrap();
        let b = gw.execute(&t, &agent).await.unwrap();
        assert_eq!(a, b);
        assert!((0.70..=0.98).contains(&a.confidence));
    }

    #[tokio::test]
    async fn test_adjudicate_picks_most_confident() {
        let t = task(&["forecasting"]);
        let entries = vec![
            ResultEntry::new(Uuid::new_v4(), "low", 0.6),
            ResultEntry::new(Uuid::new_v4(), "high", 0.9),
        ];
        let consensus = DemoGateway::new().adjudicate(&t, &entries).await.unwrap();
        assert_eq!(consensus.content, "high");
    }
}
