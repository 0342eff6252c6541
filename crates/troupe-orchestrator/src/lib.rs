//! Orchestration engine for pools of capability-tagged worker agents.
//!
//! Accepts tasks, decomposes complex ones into dependency-ordered subtasks,
//! places ready work on capable and lightly loaded agents, and reconciles
//! redundant results into a single consensus. The content of the work comes
//! from an external [`ReasoningGateway`]; the engine owns only the
//! scheduling, lifecycle and consensus decisions.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Cloneable engine handle: submit, cancel, tick, query.
//! - [`ReasoningGateway`]: Boundary to the decomposition/execution/adjudication service.
//! - [`AgentRegistry`]: Agent identities, load accounting and performance windows.
//! - [`EngineConfig`]: TOML-loadable tuning knobs.
//! - [`EventSubscription`]: Live stream of [`LifecycleEvent`]s.
//! - [`SystemStatus`] / [`TaskReport`]: Monitoring snapshots.

/// Collaboration requests and the message log.
pub mod collaboration;
/// Engine configuration.
pub mod config;
/// Result collection and consensus.
pub mod conflict;
/// Orchestrator handle and task intake.
pub mod engine;
/// Lifecycle event bus.
pub mod events;
/// Reasoning gateway boundary.
pub mod gateway;
/// Decomposition graph management.
pub mod graph;
/// Task state machine.
pub mod lifecycle;
/// Status snapshots and task reports.
pub mod monitor;
/// Built-in agent type profiles and task categories.
pub mod profiles;
/// Agent registry and candidate scoring.
pub mod registry;
/// Scheduling tick and background loop.
pub mod scheduler;
/// Task storage.
pub mod task_table;
/// Shared orchestration types (Task, AgentType, SubtaskDescriptor, etc.).
pub mod types;

pub use collaboration::{Collaboration, CollaborationDesk};
pub use config::{EngineConfig, ScoringWeights, SynthesisPolicy};
pub use conflict::{resolve, Collected, ResultBook, ResultSet};
pub use engine::Orchestrator;
pub use events::{EventBus, EventSubscription, LifecycleEvent};
pub use gateway::{concatenate, ChildResult, ReasoningGateway};
pub use graph::{should_decompose, topological_order, Settlement};
pub use lifecycle::can_transition;
pub use monitor::{LoadSummary, SystemStatus, TaskReport, TaskSummary};
pub use profiles::{default_profiles, profile_for, AgentProfile};
pub use registry::{AgentRegistry, AgentSnapshot};
pub use scheduler::TickReport;
pub use task_table::TaskTable;
pub use types::{
    AgentDescriptor, AgentRef, AgentStatus, AgentType, CapabilitySet, Consensus,
    ExecutionOutput, FailureCause, FailureKind, ResultEntry, SubtaskDescriptor, Task,
    TaskStatus, TaskSubmission, MAX_TIMEOUT_SECS,
};
