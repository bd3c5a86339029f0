//! # Pipeline Demo
//!
//! Runs one marketing-video job end to end against simulated collaborators
//! and prints status polls until the run settles. Failures can be injected
//! per scene to watch retries, partial fan-out success and cancellation.

use anyhow::{bail, Context, Result};
use clap::Parser;
use reelforge_core::collaborators::simulated::{SimulatedCollaborators, SimulatedGeneration};
use reelforge_core::collaborators::CollaboratorError;
use reelforge_core::config::{ConfigManager, StoreBackend};
use reelforge_core::logging::init_structured_logging;
use reelforge_core::orchestration::{HandlerRegistry, Orchestrator};
use reelforge_core::pipeline::{register_handlers, HandlerSettings, MarketingVideoPipeline};
use reelforge_core::store::{open_store, InMemoryStateStore, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "pipeline-demo")]
#[command(about = "Run a simulated marketing-video job")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Number of scenes to fan out into
    #[arg(short, long, default_value_t = 5)]
    scenes: usize,

    /// Scene (1-based) whose first generation submits fail transiently; repeatable
    #[arg(long = "flaky-scene")]
    flaky_scenes: Vec<usize>,

    /// Transient failures injected per flaky scene
    #[arg(long, default_value_t = 1)]
    flaky_failures: usize,

    /// Scene (1-based) the generation service permanently rejects; repeatable
    #[arg(long = "reject-scene")]
    reject_scenes: Vec<usize>,

    /// Simulated generation latency per submit
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Request cancellation after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// Persist the run in a SQLite database at this path
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Configuration directory (default: ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Job id of the run
    #[arg(long, default_value = "demo-job")]
    job_id: String,

    /// Status poll interval
    #[arg(long, default_value_t = 200)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_structured_logging();
    let cli = Cli::parse();
    if cli.scenes == 0 {
        bail!("--scenes must be at least 1");
    }

    let manager = ConfigManager::load_from_directory(cli.config_dir.clone())
        .context("failed to load configuration")?;
    let mut config = manager.config().clone();
    config.pipeline.max_scenes = config.pipeline.max_scenes.max(cli.scenes);

    let store: Arc<dyn StateStore> = match &cli.sqlite {
        Some(path) => {
            config.state_store.backend = StoreBackend::Sqlite;
            config.state_store.url = format!("sqlite://{}", path.display());
            open_store(&config.state_store)
                .await
                .context("failed to open sqlite state store")?
        }
        None => Arc::new(InMemoryStateStore::new()),
    };

    let latency = Duration::from_millis(cli.latency_ms);
    let simulated = SimulatedCollaborators::new()
        .with_generation(|storage| SimulatedGeneration::new(storage).with_latency(latency));
    for scene in &cli.flaky_scenes {
        simulated.generation.inject_submit_failures(
            &format!("(scene {scene})"),
            (0..cli.flaky_failures)
                .map(|_| CollaboratorError::Transient("503 service unavailable".to_string()))
                .collect(),
        );
    }
    for scene in &cli.reject_scenes {
        simulated
            .generation
            .inject_permanent_failures(&format!("(scene {scene})"), 1, "content policy");
    }

    let mut registry = HandlerRegistry::new();
    register_handlers(
        &mut registry,
        simulated.collaborators(),
        HandlerSettings::from_config(&config),
    );

    let orchestrator = Orchestrator::builder()
        .store(store.clone())
        .registry(registry)
        .graph_builder(Arc::new(MarketingVideoPipeline::new(config.pipeline.clone())))
        .config(config)
        .build()?;

    let asset_urls: Vec<String> = (0..=cli.scenes).map(|i| format!("assets/frame-{i}.png")).collect();
    let run = orchestrator
        .create_run(
            &cli.job_id,
            serde_json::json!({
                "campaign_id": "demo",
                "title": "Demo launch",
                "brief": "upbeat product walkthrough",
                "asset_urls": asset_urls,
                "max_scenes": cli.scenes,
            }),
        )
        .await?;
    info!(job_id = %run.job_id, correlation_id = %run.correlation_id, "Run started");

    if let Some(after) = cli.cancel_after_ms {
        tokio::time::sleep(Duration::from_millis(after)).await;
        match orchestrator.cancel(&cli.job_id).await {
            Ok(()) => println!("cancellation requested after {after}ms"),
            Err(e) => println!("cancellation refused: {e}"),
        }
    }

    let poll = Duration::from_millis(cli.poll_ms);
    loop {
        let status = orchestrator.get_status(&cli.job_id).await?;
        println!(
            "[{:>9}] {:>5.1}% stage={} units ok={} failed={} | {}",
            status.overall_status.to_string(),
            status.percent_complete,
            status.stage,
            status.succeeded_units,
            status.failed_units,
            status.message
        );
        if status.overall_status.is_terminal() || !orchestrator.is_active(&cli.job_id) {
            break;
        }
        tokio::time::sleep(poll).await;
    }

    let outcome = orchestrator.wait(&cli.job_id).await?;
    println!(
        "run {} finished {}: {}/{} tasks done, {} units ok, {} failed",
        outcome.job_id,
        outcome.status,
        outcome.done_tasks,
        outcome.total_tasks,
        outcome.succeeded_units,
        outcome.failed_units
    );
    if let Some(output) = &outcome.output {
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    if let Some(error) = &outcome.last_error {
        println!("last error: {}: {}", error.code, error.message);
    }

    orchestrator.shutdown();
    store.close().await?;
    Ok(())
}
