mod demo_gateway;
mod samples;

use clap::{Parser, Subcommand};
use demo_gateway::DemoGateway;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use troupe_orchestrator::{
    default_profiles, AgentDescriptor, AgentType, EngineConfig, Orchestrator, TaskSubmission,
};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "troupe", about = "Troupe: multi-agent task orchestration")]
struct Cli {
    /// Path to config file (defaults apply when it does not exist)
    #[arg(short, long, default_value = "troupe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Seed an agent pool, submit a workload and drive it to completion
    Run {
        /// JSON file with an array of task submissions (built-in samples otherwise)
        #[arg(long)]
        tasks: Option<PathBuf>,
        /// Agents to register per agent type (overrides config)
        #[arg(long)]
        agents_per_type: Option<u32>,
        /// Give up after this many scheduling passes (overrides config)
        #[arg(long)]
        max_ticks: Option<u32>,
        /// Also open the sample collaboration requests
        #[arg(long)]
        collaborate: bool,
    },
    /// List the built-in agent profiles
    Profiles,
}

#[derive(Deserialize, Default)]
struct TroupeConfig {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    run: RunConfig,
}

#[derive(Deserialize)]
struct RunConfig {
    #[serde(default = "default_agents_per_type")]
    agents_per_type: u32,
    #[serde(default = "default_max_ticks")]
    max_ticks: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            agents_per_type: default_agents_per_type(),
            max_ticks: default_max_ticks(),
        }
    }
}

fn default_agents_per_type() -> u32 {
    2
}
fn default_max_ticks() -> u32 {
    500
}

async fn load_config(path: &Path) -> anyhow::Result<TroupeConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(TroupeConfig::default());
    }
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
    })?;
    let config: TroupeConfig = toml::from_str(&raw)?;
    config.engine.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Run {
            tasks,
            agents_per_type,
            max_ticks,
            collaborate,
        } => {
            let submissions = match tasks {
                Some(path) => samples::load_tasks(&path)?,
                None => samples::sample_tasks(),
            };
            let agents_per_type = agents_per_type.unwrap_or(config.run.agents_per_type);
            let max_ticks = max_ticks.unwrap_or(config.run.max_ticks);
            run(
                config.engine,
                submissions,
                agents_per_type,
                max_ticks,
                collaborate,
            )
            .await?;
        }
        Commands::Profiles => {
            println!("Built-in agent profiles:");
            for profile in default_profiles() {
                println!(
                    "  {:<14} concurrency {}  weight {:.1}",
                    profile.agent_type.to_string(),
                    profile.max_concurrency,
                    profile.priority_weight
                );
                println!("    {}", profile.capabilities.join(", "));
            }
        }
    }

    Ok(())
}

async fn run(
    engine: EngineConfig,
    submissions: Vec<TaskSubmission>,
    agents_per_type: u32,
    max_ticks: u32,
    collaborate: bool,
) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::new(engine, Arc::new(DemoGateway::new()))?;

    let mut representatives: Vec<(AgentType, Uuid)> = Vec::new();
    for agent_type in AgentType::ALL {
        for i in 1..=agents_per_type {
            let id = orchestrator
                .register_agent(AgentDescriptor::new(format!("{agent_type}-{i}"), agent_type))?;
            if i == 1 {
                representatives.push((agent_type, id));
            }
        }
    }
    info!(agents = orchestrator.registry().len(), "Agent pool ready");

    let mut events = Box::pin(orchestrator.subscribe().into_stream());
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(
                task_id = %event.task_id,
                from = ?event.previous_status,
                to = %event.new_status,
                detail = ?event.detail,
                "Lifecycle"
            );
        }
    });

    let mut submitted = Vec::new();
    for submission in submissions {
        let title = submission.title.clone();
        match orchestrator.submit(submission).await {
            Ok(id) => submitted.push(id),
            Err(e) => warn!(title = %title, error = %e, "Submission rejected"),
        }
    }
    info!(count = submitted.len(), "Tasks submitted");

    if collaborate {
        if let Some(&task_id) = submitted.first() {
            for scenario in samples::collaboration_scenarios() {
                let Some(&(_, requester)) = representatives
                    .iter()
                    .find(|(t, _)| *t == scenario.requesting_type)
                else {
                    continue;
                };
                match orchestrator
                    .request_collaboration(
                        requester,
                        task_id,
                        scenario.capabilities,
                        scenario.kind,
                        scenario.message,
                    )
                    .await
                {
                    Ok(c) => info!(
                        scenario = scenario.name,
                        participants = c.participants.len(),
                        "Collaboration opened"
                    ),
                    Err(e) => warn!(scenario = scenario.name, error = %e, "Collaboration failed"),
                }
            }
        }
    }

    let mut settled = false;
    for tick in 1..=max_ticks {
        orchestrator.tick().await;
        orchestrator.settle().await;
        if orchestrator.is_settled().await {
            info!(ticks = tick, "All tasks settled");
            settled = true;
            break;
        }
    }
    if !settled {
        warn!(max_ticks, "Stopped before every task settled");
    }

    println!("Tasks:");
    for task in orchestrator.list_tasks(None, usize::MAX).await {
        let indent = if task.parent_id.is_some() { "    " } else { "  " };
        println!(
            "{indent}{:<11} {} (attempts {}, confidence {})",
            task.status.to_string(),
            task.title,
            task.attempt_count,
            task.confidence
                .map_or_else(|| "-".to_string(), |c| format!("{c:.2}"))
        );
    }
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&orchestrator.status_json().await)?
    );

    event_log.abort();
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.run.agents_per_type, 2);
        assert_eq!(config.engine.max_retries, EngineConfig::default().max_retries);
    }

    #[tokio::test]
    async fn test_config_sections_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[engine]\nconfidence_floor = 0.6\n\n[run]\nagents_per_type = 3\n"
        )
        .unwrap();
        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.run.agents_per_type, 3);
        assert_eq!(config.run.max_ticks, 500);
        assert!((config.engine.confidence_floor - 0.6).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_invalid_engine_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[engine]\nconfidence_floor = 1.5\n").unwrap();
        assert!(load_config(file.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_sample_run_settles() {
        run(EngineConfig::default(), samples::sample_tasks(), 2, 200, true)
            .await
            .unwrap();
    }
}
