//! CLI command handlers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::container::DockerContainers;
use crate::engine::PipelineEngine;
use crate::model::{PipelineDefinition, Project};
use crate::repo::GitRepository;
use crate::storage::{Database, DataService, MemoryStore};
use crate::transcript::AdapterRegistry;
use crate::workflows::{StartPipelineCommand, WorkflowError};

/// Builds an engine from the environment configuration.
async fn build_engine(memory: bool) -> anyhow::Result<PipelineEngine> {
    let config = EngineConfig::from_env()?;

    let data: Arc<dyn DataService> = if memory {
        info!("using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let database = Database::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        database.run_migrations().await.context("running migrations")?;
        Arc::new(database)
    };

    let containers = Arc::new(DockerContainers::new().context("connecting to docker")?);
    let repo = Arc::new(GitRepository::new());
    let adapters = Arc::new(AdapterRegistry::with_defaults());

    Ok(PipelineEngine::new(repo, containers, data, adapters, config))
}

/// `pipeforge serve`: run the orchestrator worker, logging every bus
/// event until interrupted.
pub async fn serve(memory: bool) -> anyhow::Result<()> {
    let engine = build_engine(memory).await?;
    let mut events = engine.subscribe();

    info!("orchestrator worker running; Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(envelope) => {
                    info!(
                        kind = envelope.event.kind(),
                        key = %envelope.metadata.idempotency_key,
                        "event"
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event log fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

/// Arguments of `pipeforge start`.
pub struct StartArgs {
    pub project_id: String,
    pub repo: Option<PathBuf>,
    pub file: PathBuf,
    pub run_id: Option<String>,
    pub base_commit: Option<String>,
    pub fork_from: Option<String>,
    pub fork_after: Option<String>,
    pub no_auto_fork: bool,
    pub memory: bool,
    pub wait: bool,
}

/// `pipeforge start`: submit one pipeline run.
pub async fn start(args: StartArgs) -> anyhow::Result<()> {
    let engine = build_engine(args.memory).await?;

    if let Some(repo_path) = &args.repo {
        let repo_path = repo_path
            .canonicalize()
            .with_context(|| format!("repository path {}", repo_path.display()))?;
        let project = Project::new(&args.project_id, &args.project_id, repo_path);
        engine.register_project(&project).await?;
    }

    let definition: PipelineDefinition = {
        let content = std::fs::read_to_string(&args.file)
            .with_context(|| format!("reading {}", args.file.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", args.file.display()))?
    };

    let mut cmd = StartPipelineCommand::new(
        &args.project_id,
        &definition.id,
        &definition.name,
        definition.steps.clone(),
    );
    cmd.run_id = args.run_id;
    cmd.prompt_prefix = definition.prompt_prefix.clone();
    cmd.prompt_suffix = definition.prompt_suffix.clone();
    cmd.base_commit = args.base_commit;
    cmd.fork_from_run_id = args.fork_from;
    cmd.fork_after_step_id = args.fork_after;
    cmd.no_auto_fork = args.no_auto_fork;

    let outcome = engine.start_pipeline(cmd).await?;
    println!("run id: {}", outcome.run_id);
    if outcome.already_exists {
        println!("already exists: true");
        return Ok(());
    }

    if !args.wait {
        // The run continues inside this process; without --wait there is
        // nothing to keep it alive.
        warn!("running without --wait detaches nothing in embedded mode; waiting anyway");
    }

    // First Ctrl-C cancels gracefully, the second force-quits.
    let run_id = outcome.run_id.clone();
    tokio::select! {
        result = engine.wait(&run_id) => {
            print_summary(&engine, &run_id, result).await;
        }
        _ = tokio::signal::ctrl_c() => {
            engine.cancel(&run_id, Some("Ctrl-C"));
            tokio::select! {
                result = engine.wait(&run_id) => {
                    print_summary(&engine, &run_id, result).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    engine.force_quit(&run_id);
                    println!("force quit");
                }
            }
        }
    }

    Ok(())
}

async fn print_summary(
    engine: &PipelineEngine,
    run_id: &str,
    result: Result<crate::workflows::PipelineOutcome, WorkflowError>,
) {
    match result {
        Ok(outcome) => {
            println!("status: {}", outcome.status);
            if let Some(head) = &outcome.head_commit_sha {
                println!("head commit: {}", head);
            }
            for step in &outcome.step_results {
                println!(
                    "  step {} [{}] {} (+{} -{}) {}",
                    step.step_index,
                    step.step_id,
                    step.status,
                    step.insertions,
                    step.deletions,
                    step.commit_sha.as_deref().unwrap_or("-"),
                );
            }
            let mut totals = crate::model::TokenUsage::default();
            for step in &outcome.step_results {
                let task = crate::model::task_id(run_id, &step.step_id);
                if let Ok(task_totals) = engine.context().data.token_totals_by_task(&task).await {
                    totals.add(&task_totals);
                }
            }
            if !totals.is_zero() {
                println!(
                    "tokens: in={} out={} cache_read={} cache_create={}",
                    totals.input_tokens,
                    totals.output_tokens,
                    totals.cache_read_tokens,
                    totals.cache_creation_tokens,
                );
            }
        }
        Err(err) => println!("run failed: {}", err),
    }
}
