use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use troupe_core::TroupeError;
use uuid::Uuid;

/// Longest timeout a task or the engine accepts: thirty days.
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// A set of capability tags, ordered for deterministic output.
pub type CapabilitySet = BTreeSet<String>;

/// Lifecycle state of a task or subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, decomposition not yet evaluated.
    Submitted,
    /// Subtask waiting for sibling dependencies.
    Pending,
    /// Eligible for scheduling.
    Ready,
    /// Split into subtasks; completes once its children settle.
    Decomposed,
    /// Reserved against an agent, execution not yet handed off.
    Assigned,
    /// Executing on an agent.
    InProgress,
    /// Finished with a result.
    Completed,
    /// Finished without a result.
    Failed,
    /// Withdrawn before finishing.
    Cancelled,
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [TaskStatus; 9] = [
        TaskStatus::Submitted,
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Decomposed,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Whether no further transition is expected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether an agent reservation is held for a task in this state.
    pub fn holds_reservation(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Decomposed => "decomposed",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Category of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Gateway,
    NoViableResult,
    AgentUnavailable,
    CyclicDependency,
    DanglingDependency,
    InvalidDecomposition,
    SubtaskFailed,
}

impl FailureKind {
    /// Whether a task failing for this reason may re-enter `Ready`.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::Gateway
                | FailureKind::NoViableResult
                | FailureKind::AgentUnavailable
        )
    }
}

/// The recorded cause of a failed attempt or a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Classify an engine error. Errors outside the task-failure taxonomy are
    /// reported as gateway failures, since they can only surface through a
    /// gateway interaction.
    pub fn from_error(err: &TroupeError) -> Self {
        let kind = match err {
            TroupeError::Timeout(_) => FailureKind::Timeout,
            TroupeError::NoViableResult(_) => FailureKind::NoViableResult,
            TroupeError::AgentUnavailable(_) => FailureKind::AgentUnavailable,
            TroupeError::CyclicDependency(_) => FailureKind::CyclicDependency,
            TroupeError::DanglingDependency { .. } => FailureKind::DanglingDependency,
            TroupeError::InvalidDecomposition(_) | TroupeError::AlreadyDecomposed(_) => {
                FailureKind::InvalidDecomposition
            }
            _ => FailureKind::Gateway,
        };
        Self::new(kind, err.to_string())
    }
}

/// A unit of work owned by the lifecycle controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    /// Opaque payload handed to the reasoning gateway.
    pub description: String,
    pub task_type: String,
    pub required_capabilities: CapabilitySet,
    pub status: TaskStatus,
    /// Higher values are scheduled first.
    pub priority: i32,
    /// Lookup-only link to the task this was decomposed from.
    pub parent_id: Option<Uuid>,
    /// Subtasks in declared order. Fixed once decomposition completes.
    pub children_ids: Vec<Uuid>,
    /// Sibling ids that must complete before this task is schedulable.
    pub dependencies: BTreeSet<Uuid>,
    pub assigned_agent_id: Option<Uuid>,
    pub attempt_count: u32,
    pub max_retries: u32,
    pub result: Option<String>,
    pub confidence: Option<f64>,
    /// Set when a parent completed from a subset of its children.
    #[serde(default)]
    pub partial_result: bool,
    pub error: Option<FailureCause>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// End of the current waiting or executing phase.
    pub deadline: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    /// Number of independent agent results to collect before consensus.
    pub redundancy: u32,
    pub tolerate_partial_failure: bool,
    /// Explicit decomposition request from the submitter.
    pub decompose: Option<bool>,
    /// Agents kept out of the next candidate pool.
    #[serde(default)]
    pub excluded_agents: BTreeSet<Uuid>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        required_capabilities: CapabilitySet,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            task_type: "general".to_string(),
            required_capabilities,
            status: TaskStatus::Submitted,
            priority: 1,
            parent_id: None,
            children_ids: Vec::new(),
            dependencies: BTreeSet::new(),
            assigned_agent_id: None,
            attempt_count: 0,
            max_retries: 3,
            result: None,
            confidence: None,
            partial_result: false,
            error: None,
            created_at: now,
            updated_at: now,
            deadline: now,
            started_at: None,
            completed_at: None,
            timeout_ms: 300_000,
            redundancy: 1,
            tolerate_partial_failure: false,
            decompose: None,
            excluded_agents: BTreeSet::new(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = Uuid>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self.deadline = self.deadline_from(self.created_at);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt is allowed after a retryable failure.
    pub fn has_retries_left(&self) -> bool {
        self.attempt_count < self.max_retries
    }

    /// Restart the deadline clock from `now`.
    pub fn refresh_deadline(&mut self, now: DateTime<Utc>) {
        self.deadline = self.deadline_from(now);
    }

    pub fn timeout(&self) -> Duration {
        i64::try_from(self.timeout_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .unwrap_or(Duration::MAX)
    }

    /// `start` plus the timeout, saturating at the latest representable instant.
    pub fn deadline_from(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_signed(self.timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A task as submitted through the public interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub redundancy: Option<u32>,
    #[serde(default)]
    pub decompose: Option<bool>,
    #[serde(default)]
    pub tolerate_partial_failure: Option<bool>,
}

impl TaskSubmission {
    pub fn new<I, S>(title: impl Into<String>, description: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            title: title.into(),
            description: description.into(),
            required_capabilities: caps.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_redundancy(mut self, redundancy: u32) -> Self {
        self.redundancy = Some(redundancy);
        self
    }

    pub fn with_decompose(mut self, decompose: bool) -> Self {
        self.decompose = Some(decompose);
        self
    }

    pub fn tolerating_partial_failure(mut self, tolerate: bool) -> Self {
        self.tolerate_partial_failure = Some(tolerate);
        self
    }
}

/// One subtask proposed by the gateway's decomposition capability.
///
/// `key` is local to the decomposition; `depends_on` refers to sibling keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskDescriptor {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Empty means "inherit the parent's capabilities".
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl SubtaskDescriptor {
    pub fn new(key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            description: String::new(),
            required_capabilities: Vec::new(),
            priority: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Specialization of an agent. The scheduler never branches on it; it only
/// selects default capabilities, concurrency and scoring weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Research,
    Code,
    Creative,
    Analysis,
    Communication,
}

impl AgentType {
    pub const ALL: [AgentType; 5] = [
        AgentType::Research,
        AgentType::Code,
        AgentType::Creative,
        AgentType::Analysis,
        AgentType::Communication,
    ];

    /// Parse a type name, case-insensitively.
    pub fn parse_type(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "research" => Some(AgentType::Research),
            "code" => Some(AgentType::Code),
            "creative" => Some(AgentType::Creative),
            "analysis" => Some(AgentType::Analysis),
            "communication" => Some(AgentType::Communication),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Research => write!(f, "research"),
            AgentType::Code => write!(f, "code"),
            AgentType::Creative => write!(f, "creative"),
            AgentType::Analysis => write!(f, "analysis"),
            AgentType::Communication => write!(f, "communication"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

/// Registration request for a worker agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub agent_type: AgentType,
    /// Defaults to the type profile's capabilities.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    /// Defaults to the type profile's concurrency limit.
    #[serde(default)]
    pub max_concurrency: Option<u32>,
}

impl AgentDescriptor {
    pub fn new(name: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            name: name.into(),
            agent_type,
            capabilities: None,
            max_concurrency: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = Some(caps.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_max_concurrency(mut self, limit: u32) -> Self {
        self.max_concurrency = Some(limit);
        self
    }
}

/// The view of an agent handed to the gateway's execute capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRef {
    pub id: Uuid,
    pub name: String,
    pub agent_type: AgentType,
    pub capabilities: CapabilitySet,
}

/// What an agent produced for one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub content: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
}

impl ExecutionOutput {
    pub fn new(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence,
        }
    }
}

/// One agent's contribution to a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub agent_id: Uuid,
    pub content: String,
    pub confidence: f64,
}

impl ResultEntry {
    pub fn new(agent_id: Uuid, content: impl Into<String>, confidence: f64) -> Self {
        Self {
            agent_id,
            content: content.into(),
            confidence,
        }
    }
}

/// The reconciled outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consensus {
    pub content: String,
    pub confidence: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn caps(tags: &[&str]) -> CapabilitySet {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("Quarterly report", "Summarize Q3", caps(&["data_processing"]));
        assert_eq!(task.status, TaskStatus::Submitted);
        assert!(task.dependencies.is_empty());
        assert!(task.children_ids.is_empty());
        assert_eq!(task.attempt_count, 0);
        assert!(task.assigned_agent_id.is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert!(!TaskStatus::Decomposed.is_terminal());
    }

    #[test]
    fn test_retries_left() {
        let mut task = Task::new("t", "d", caps(&["translation"]));
        task.max_retries = 2;
        assert!(task.has_retries_left());
        task.attempt_count = 2;
        assert!(!task.has_retries_left());
    }

    #[test]
    fn test_refresh_deadline() {
        let mut task = Task::new("t", "d", caps(&["translation"])).with_timeout_ms(5_000);
        let now = task.created_at + Duration::seconds(60);
        task.refresh_deadline(now);
        assert_eq!(task.deadline, now + Duration::seconds(5));
    }

    #[test]
    fn test_oversized_timeout_saturates() {
        let task = Task::new("t", "d", caps(&["translation"])).with_timeout_ms(u64::MAX);
        assert_eq!(task.timeout(), Duration::MAX);
        assert_eq!(task.deadline, DateTime::<Utc>::MAX_UTC);
        assert!(task.deadline > task.created_at);

        let task = Task::new("t", "d", caps(&["translation"]))
            .with_timeout_ms(10_000_000_000_000u64.saturating_mul(1000));
        assert!(task.deadline > task.created_at);
    }

    #[test]
    fn test_failure_kind_retryable() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::NoViableResult.is_retryable());
        assert!(!FailureKind::CyclicDependency.is_retryable());
        assert!(!FailureKind::SubtaskFailed.is_retryable());
    }

    #[test]
    fn test_failure_cause_from_error() {
        let cause = FailureCause::from_error(&TroupeError::CyclicDependency("a -> a".into()));
        assert_eq!(cause.kind, FailureKind::CyclicDependency);
        let cause = FailureCause::from_error(&TroupeError::Gateway("502".into()));
        assert_eq!(cause.kind, FailureKind::Gateway);
        assert!(cause.message.contains("502"));
    }

    #[test]
    fn test_agent_type_parse_and_display() {
        assert_eq!(AgentType::parse_type("Analysis"), Some(AgentType::Analysis));
        assert_eq!(AgentType::parse_type("unknown"), None);
        assert_eq!(AgentType::Communication.to_string(), "communication");
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::InProgress);
    }

    #[test]
    fn test_submission_deserializes_with_defaults() {
        let raw = serde_json::json!({
            "title": "Translate docs",
            "description": "EN -> ES",
            "required_capabilities": ["translation"]
        });
        let submission: TaskSubmission = serde_json::from_value(raw).unwrap();
        assert_eq!(submission.required_capabilities, vec!["translation"]);
        assert!(submission.priority.is_none());
        assert!(submission.decompose.is_none());
    }
}
