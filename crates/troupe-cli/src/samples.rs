//! Built-in demo workload: sample tasks and collaboration requests.

use anyhow::Context;
use std::path::Path;
use troupe_orchestrator::{AgentType, TaskSubmission};

/// A collaboration to open once the tasks are submitted.
pub struct CollaborationScenario {
    pub name: &'static str,
    pub requesting_type: AgentType,
    pub capabilities: &'static [&'static str],
    pub kind: &'static str,
    pub message: &'static str,
}

pub fn sample_tasks() -> Vec<TaskSubmission> {
    vec![
        TaskSubmission::new(
            "Market Research for AI Startup",
            "Market research for an AI startup in healthcare: competitors, market size, growth.",
            ["data_analysis", "web_research", "market_research"],
        )
        .with_task_type("research_task")
        .with_priority(2),
        TaskSubmission::new(
            "Build Customer Management API",
            "RESTful customer management API with CRUD, authentication and validation.",
            ["code_generation", "architecture_design", "testing"],
        )
        .with_task_type("development_task")
        .with_priority(3),
        TaskSubmission::new(
            "Create Marketing Campaign Content",
            "Campaign for a sustainable fashion brand: social posts, blog articles, newsletter.",
            ["content_creation", "creative_writing", "brainstorming"],
        )
        .with_task_type("creative_task"),
        TaskSubmission::new(
            "Sales Performance Analysis",
            "Quarterly sales trends, patterns and opportunities with statistical backing.",
            ["statistical_analysis", "data_processing", "pattern_recognition"],
        )
        .with_task_type("analysis_task")
        .with_priority(2)
        .with_redundancy(2),
        TaskSubmission::new(
            "Technical Documentation Translation",
            "Translate technical documentation from English to Spanish and French.",
            ["translation", "language_processing", "communication_drafting"],
        )
        .with_task_type("communication_task"),
        TaskSubmission::new(
            "E-commerce Platform Development",
            "Catalog, cart, payments, user management and an analytics dashboard.",
            [
                "code_generation",
                "architecture_design",
                "data_processing",
                "creative_writing",
                "testing",
            ],
        )
        .with_task_type("complex_task")
        .with_priority(5),
        TaskSubmission::new(
            "Brand Identity Research and Design",
            "Audience research plus logo concepts, color schemes and messaging guidelines.",
            ["market_research", "creative_writing", "design_thinking", "data_analysis"],
        )
        .with_task_type("complex_task")
        .with_priority(4)
        .tolerating_partial_failure(true),
        TaskSubmission::new(
            "Customer Feedback Sentiment Analysis",
            "Sentiment trends across feedback channels and actionable product insights.",
            ["sentiment_analysis", "data_processing", "statistical_analysis"],
        )
        .with_task_type("analysis_task")
        .with_priority(2),
    ]
}

pub fn collaboration_scenarios() -> Vec<CollaborationScenario> {
    vec![
        CollaborationScenario {
            name: "Code Review Collaboration",
            requesting_type: AgentType::Code,
            capabilities: &["statistical_analysis", "optimization"],
            kind: "review",
            message: "Please review this algorithm for performance bottlenecks",
        },
        CollaborationScenario {
            name: "Research Validation",
            requesting_type: AgentType::Research,
            capabilities: &["communication_drafting", "language_processing"],
            kind: "assistance",
            message: "Please help improve the clarity of this research report",
        },
        CollaborationScenario {
            name: "Creative Content Analysis",
            requesting_type: AgentType::Creative,
            capabilities: &["sentiment_analysis", "data_processing"],
            kind: "assistance",
            message: "Please analyze the sentiment of this marketing content",
        },
    ]
}

/// Read a JSON array of task submissions.
pub fn load_tasks(path: &Path) -> anyhow::Result<Vec<TaskSubmission>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task file '{}'", path.display()))?;
    let tasks: Vec<TaskSubmission> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse task file '{}'", path.display()))?;
    Ok(tasks)
}
