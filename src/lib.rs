#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Reelforge Core
//!
//! Pipeline orchestration core for AI-assisted marketing video production.
//!
//! ## Overview
//!
//! A video job is a DAG of tasks: collect assets, interpret the brief into
//! scene pairs, generate one clip per scene, narrate, combine, merge and
//! store. The number of scenes is only known at runtime, so the generator
//! stage fans out into per-scene member chains that are joined again before
//! the downstream stages run. Collaborators (generation, storage,
//! interpretation) are slow, rate-limited and fallible; every failure is
//! classified as retryable, terminal for one unit, or terminal for the run.
//!
//! ## Architecture
//!
//! The state store is the single source of truth. Every task status change
//! is a compare-and-set transition, and run status is always derived from
//! task statuses. A driver that dies mid-run loses nothing: resuming the run
//! reloads the store, recovers orphaned attempts and continues.
//!
//! ## Module Organization
//!
//! - [`models`] - Tasks, runs, fan-out batches and the task graph builder
//! - [`state_machine`] - Task status transitions and derived run status
//! - [`store`] - State store trait with in-memory and SQLite backends
//! - [`orchestration`] - Resolver, executor, fan-out, retry and job facade
//! - [`pipeline`] - The marketing-video graph and its stage handlers
//! - [`collaborators`] - External service boundaries and simulations
//! - [`config`] - Layered configuration
//! - [`events`] - Lifecycle event broadcasting
//! - [`logging`] - Structured logging setup
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reelforge_core::collaborators::simulated::SimulatedCollaborators;
//! use reelforge_core::config::ConfigManager;
//! use reelforge_core::orchestration::{HandlerRegistry, Orchestrator};
//! use reelforge_core::pipeline::{register_handlers, HandlerSettings, MarketingVideoPipeline};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?.config().clone();
//! let simulated = SimulatedCollaborators::new();
//!
//! let mut registry = HandlerRegistry::new();
//! register_handlers(&mut registry, simulated.collaborators(), HandlerSettings::from_config(&config));
//!
//! let orchestrator = Orchestrator::builder()
//!     .config(config.clone())
//!     .registry(registry)
//!     .graph_builder(Arc::new(MarketingVideoPipeline::new(config.pipeline.clone())))
//!     .build()?;
//!
//! orchestrator
//!     .create_run(
//!         "job-1",
//!         serde_json::json!({
//!             "campaign_id": "spring",
//!             "title": "Spring launch",
//!             "brief": "bright and fast",
//!             "asset_urls": ["a.png", "b.png", "c.png"],
//!         }),
//!     )
//!     .await?;
//! let status = orchestrator.get_status("job-1").await?;
//! println!("{} at {:.0}%", status.overall_status, status.percent_complete);
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod pipeline;
pub mod state_machine;
pub mod store;

pub use config::{ConfigManager, OrchestratorConfig};
pub use error::{ReelforgeError, Result};
pub use events::EventPublisher;
pub use models::{PipelineRun, SubJobBatch, Task, TaskGraph, TaskId, TaskKind};
pub use orchestration::{
    GraphBuilder, HandlerRegistry, JobStatusReport, Orchestrator, OrchestratorBuilder, RunOutcome,
    TaskHandler,
};
pub use state_machine::{RunStatus, TaskStatus};
pub use store::{InMemoryStateStore, SqliteStateStore, StateStore};
