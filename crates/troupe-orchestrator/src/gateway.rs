use crate::types::{AgentRef, Consensus, ExecutionOutput, ResultEntry, SubtaskDescriptor, Task};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use troupe_core::TroupeResult;
use uuid::Uuid;

/// A completed child's contribution to its parent's synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildResult {
    pub task_id: Uuid,
    pub title: String,
    pub content: String,
    pub confidence: Option<f64>,
}

/// Boundary to the external reasoning service.
///
/// The engine treats every output as opaque and possibly malformed: subtask
/// lists are validated before use, confidences are clamped, and each call is
/// bounded by the configured gateway timeout.
///
/// To plug in a new reasoning backend:
/// 1. Implement `ReasoningGateway` for your client type
/// 2. Hand it to `Orchestrator::new` as an `Arc<dyn ReasoningGateway>`
#[async_trait]
pub trait ReasoningGateway: Send + Sync {
    /// Propose subtasks for `task`. An empty list means "do not decompose".
    async fn decompose(&self, task: &Task) -> TroupeResult<Vec<SubtaskDescriptor>>;

    /// Perform `task` as `agent`.
    async fn execute(&self, task: &Task, agent: &AgentRef) -> TroupeResult<ExecutionOutput>;

    /// Reconcile two or more divergent results into one.
    async fn adjudicate(&self, task: &Task, entries: &[ResultEntry]) -> TroupeResult<Consensus>;

    /// Merge a decomposed task's child results. Defaults to concatenation.
    async fn synthesize(&self, task: &Task, parts: &[ChildResult]) -> TroupeResult<String> {
        let _ = task;
        Ok(concatenate(parts))
    }
}

/// Join child results in the given order, one section per child.
pub fn concatenate(parts: &[ChildResult]) -> String {
    parts
        .iter()
        .map(|p| format!("## {}\n{}", p.title, p.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use troupe_core::TroupeError;

    struct Minimal;

    #[async_trait]
    impl ReasoningGateway for Minimal {
        async fn decompose(&self, _task: &Task) -> TroupeResult<Vec<SubtaskDescriptor>> {
            Ok(Vec::new())
        }

        async fn execute(&self, task: &Task, agent: &AgentRef) -> TroupeResult<ExecutionOutput> {
            Ok(ExecutionOutput::new(format!("{} by {}", task.title, agent.name), 1.0))
        }

        async fn adjudicate(
            &self,
            _task: &Task,
            _entries: &[ResultEntry],
        ) -> TroupeResult<Consensus> {
            Err(TroupeError::Gateway("not supported".into()))
        }
    }

    fn part(title: &str, content: &str) -> ChildResult {
        ChildResult {
            task_id: Uuid::new_v4(),
            title: title.into(),
            content: content.into(),
            confidence: Some(0.9),
        }
    }

    #[test]
    fn test_concatenate_keeps_order() {
        let joined = concatenate(&[part("Collect", "raw numbers"), part("Report", "summary")]);
        assert_eq!(joined, "## Collect\nraw numbers\n\n## Report\nsummary");
        assert_eq!(concatenate(&[]), "");
    }

    #[tokio::test]
    async fn test_default_synthesize_concatenates() {
        let task = Task::new("parent", "", Default::default());
        let out = Minimal
            .synthesize(&task, &[part("A", "one"), part("B", "two")])
            .await
            .unwrap();
        assert_eq!(out, "## A\none\n\n## B\ntwo");
    }
}
