//! Result collection and consensus.

use crate::gateway::ReasoningGateway;
use crate::types::{Consensus, ResultEntry, Task};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};
use troupe_core::{TroupeError, TroupeResult};
use uuid::Uuid;

/// Results gathered for one task before consensus.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub task_id: Uuid,
    /// Fixed when the set opens.
    pub expected: usize,
    pub entries: Vec<ResultEntry>,
}

impl ResultSet {
    pub fn new(task_id: Uuid, expected: usize) -> Self {
        Self {
            task_id,
            expected: expected.max(1),
            entries: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.entries.len() >= self.expected
    }

    pub fn contributors(&self) -> BTreeSet<Uuid> {
        self.entries.iter().map(|e| e.agent_id).collect()
    }
}

/// What happened to a collected result.
#[derive(Debug, Clone, PartialEq)]
pub enum Collected {
    /// The agent already contributed to this set; ignored.
    Duplicate,
    /// Stored; this many more are needed.
    Waiting(usize),
    /// The set is full and has been handed over for resolution.
    Complete(Vec<ResultEntry>),
}

/// Open result sets, keyed by task id.
#[derive(Debug, Default)]
pub struct ResultBook {
    sets: HashMap<Uuid, ResultSet>,
}

impl ResultBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&mut self, task_id: Uuid, expected: usize, entry: ResultEntry) -> Collected {
        let set = self
            .sets
            .entry(task_id)
            .or_insert_with(|| ResultSet::new(task_id, expected));
        if set.entries.iter().any(|e| e.agent_id == entry.agent_id) {
            debug!(task_id = %task_id, agent_id = %entry.agent_id, "Repeat contribution ignored");
            return Collected::Duplicate;
        }
        set.entries.push(entry);
        if set.is_complete() {
            let entries = self
                .sets
                .remove(&task_id)
                .map(|s| s.entries)
                .unwrap_or_default();
            Collected::Complete(entries)
        } else {
            Collected::Waiting(set.expected - set.entries.len())
        }
    }

    /// Agents that already contributed to the task's open set.
    pub fn contributors(&self, task_id: Uuid) -> BTreeSet<Uuid> {
        self.sets
            .get(&task_id)
            .map(ResultSet::contributors)
            .unwrap_or_default()
    }

    pub fn reset(&mut self, task_id: Uuid) {
        self.sets.remove(&task_id);
    }

    pub fn open_sets(&self) -> usize {
        self.sets.len()
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Reconcile `entries` into one consensus.
///
/// Entries below `floor` are discarded. A single survivor is the consensus as
/// is; two or more go to the gateway for adjudication, falling back to the
/// most confident survivor when adjudication fails.
pub async fn resolve(
    gateway: &dyn ReasoningGateway,
    task: &Task,
    entries: Vec<ResultEntry>,
    floor: f64,
    timeout: Duration,
) -> TroupeResult<Consensus> {
    let total = entries.len();
    let mut valid: Vec<ResultEntry> = entries
        .into_iter()
        .map(|mut e| {
            e.confidence = clamp_confidence(e.confidence);
            e
        })
        .filter(|e| e.confidence >= floor)
        .collect();
    debug!(task_id = %task.id, total, valid = valid.len(), floor, "Resolving results");

    match valid.len() {
        0 => Err(TroupeError::NoViableResult(task.id)),
        1 => {
            let only = valid.remove(0);
            Ok(Consensus {
                content: only.content,
                confidence: only.confidence,
            })
        }
        _ => {
            let adjudicated =
                match tokio::time::timeout(timeout, gateway.adjudicate(task, &valid)).await {
                    Ok(result) => result,
                    Err(_) => Err(TroupeError::Timeout(format!(
                        "adjudication for task {} exceeded {}s",
                        task.id,
                        timeout.as_secs()
                    ))),
                };
            match adjudicated {
                Ok(consensus) => {
                    info!(task_id = %task.id, entries = valid.len(), "Results adjudicated");
                    Ok(Consensus {
                        content: consensus.content,
                        confidence: clamp_confidence(consensus.confidence),
                    })
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Adjudication failed; using most confident result");
                    let best = valid
                        .into_iter()
                        .reduce(|best, e| if e.confidence > best.confidence { e } else { best })
                        .ok_or(TroupeError::NoViableResult(task.id))?;
                    Ok(Consensus {
                        content: best.content,
                        confidence: best.confidence,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{AgentRef, ExecutionOutput, SubtaskDescriptor};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct Judge {
        verdict: Option<Consensus>,
        calls: Mutex<usize>,
    }

    impl Judge {
        fn agreeing(content: &str, confidence: f64) -> Self {
            Self {
                verdict: Some(Consensus {
                    content: content.into(),
                    confidence,
                }),
                calls: Mutex::new(0),
            }
        }

        fn broken() -> Self {
            Self {
                verdict: None,
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ReasoningGateway for Judge {
        async fn decompose(&self, _task: &Task) -> TroupeResult<Vec<SubtaskDescriptor>> {
            Ok(Vec::new())
        }

        async fn execute(&self, _task: &Task, _agent: &AgentRef) -> TroupeResult<ExecutionOutput> {
            Err(TroupeError::Gateway("unused".into()))
        }

        async fn adjudicate(&self, _task: &Task, _entries: &[ResultEntry]) -> TroupeResult<Consensus> {
            *self.calls.lock() += 1;
            self.verdict
                .clone()
                .ok_or_else(|| TroupeError::Gateway("judge unavailable".into()))
        }
    }

    fn task() -> Task {
        Task::new("t", "d", Default::default())
    }

    fn entry(content: &str, confidence: f64) -> ResultEntry {
        ResultEntry::new(Uuid::new_v4(), content, confidence)
    }

    const LIMIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_book_collects_until_expected() {
        let mut book = ResultBook::new();
        let id = Uuid::new_v4();
        let first = entry("x", 0.9);
        let agent = first.agent_id;
        assert_eq!(book.collect(id, 2, first), Collected::Waiting(1));
        assert!(book.contributors(id).contains(&agent));

        let again = ResultEntry::new(agent, "y", 0.5);
        assert_eq!(book.collect(id, 2, again), Collected::Duplicate);

        match book.collect(id, 2, entry("z", 0.4)) {
            Collected::Complete(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(book.open_sets(), 0);
    }

    #[test]
    fn test_book_reset() {
        let mut book = ResultBook::new();
        let id = Uuid::new_v4();
        book.collect(id, 3, entry("x", 0.9));
        book.reset(id);
        assert!(book.contributors(id).is_empty());
    }

    #[tokio::test]
    async fn test_low_confidence_discarded_single_survivor_wins() {
        let judge = Judge::agreeing("judged", 0.99);
        let out = resolve(
            &judge,
            &task(),
            vec![entry("strong", 0.9), entry("weak", 0.4)],
            0.5,
            LIMIT,
        )
        .await
        .unwrap();
        assert_eq!(out.content, "strong");
        assert!((out.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(*judge.calls.lock(), 0);
    }

    #[tokio::test]
    async fn test_nothing_viable() {
        let err = resolve(&Judge::broken(), &task(), vec![entry("weak", 0.2)], 0.5, LIMIT)
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::NoViableResult(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_multiple_survivors_adjudicated_and_clamped() {
        let judge = Judge::agreeing("merged", 1.7);
        let out = resolve(
            &judge,
            &task(),
            vec![entry("a", 0.8), entry("b", 0.75)],
            0.5,
            LIMIT,
        )
        .await
        .unwrap();
        assert_eq!(out.content, "merged");
        assert!((out.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(*judge.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_adjudication_failure_falls_back_to_best() {
        let out = resolve(
            &Judge::broken(),
            &task(),
            vec![entry("a", 0.6), entry("b", 0.95), entry("c", 0.7)],
            0.5,
            LIMIT,
        )
        .await
        .unwrap();
        assert_eq!(out.content, "b");
    }

    #[tokio::test]
    async fn test_entry_at_floor_kept() {
        let out = resolve(&Judge::broken(), &task(), vec![entry("edge", 0.5)], 0.5, LIMIT)
            .await
            .unwrap();
        assert_eq!(out.content, "edge");
    }
}
