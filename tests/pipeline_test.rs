//! The marketing-video pipeline end to end: real stage handlers against
//! simulated collaborators.

mod common;

use common::fast_config;
use reelforge_core::collaborators::simulated::SimulatedCollaborators;
use reelforge_core::collaborators::CollaboratorError;
use reelforge_core::error::ReelforgeError;
use reelforge_core::orchestration::{HandlerRegistry, Orchestrator};
use reelforge_core::pipeline::handlers::FinalOutput;
use reelforge_core::pipeline::{register_handlers, HandlerSettings, MarketingVideoPipeline};
use reelforge_core::state_machine::RunStatus;
use reelforge_core::store::{SqliteStateStore, StateStore};
use serde_json::{json, Value};
use std::sync::Arc;

const JOB: &str = "job-1";

fn build(simulated: &SimulatedCollaborators) -> Orchestrator {
    build_with_store(simulated, None)
}

fn build_with_store(simulated: &SimulatedCollaborators, store: Option<Arc<dyn StateStore>>) -> Orchestrator {
    let config = fast_config();
    let mut registry = HandlerRegistry::new();
    register_handlers(
        &mut registry,
        simulated.collaborators(),
        HandlerSettings::from_config(&config),
    );
    let mut builder = Orchestrator::builder()
        .registry(registry)
        .graph_builder(Arc::new(MarketingVideoPipeline::new(config.pipeline.clone())))
        .config(config);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    builder.build().unwrap()
}

fn four_asset_brief() -> Value {
    json!({
        "campaign_id": "spring",
        "title": "Spring launch",
        "brief": "bright and fast",
        "asset_urls": ["a.png", "b.png", "c.png", "d.png"],
        "voice": "warm",
    })
}

fn final_output(output: Option<Value>) -> FinalOutput {
    serde_json::from_value(output.expect("completed runs carry the root output")).unwrap()
}

#[tokio::test]
async fn test_brief_becomes_a_stored_video() {
    let simulated = SimulatedCollaborators::new();
    let orchestrator = build(&simulated);
    orchestrator.create_run(JOB, four_asset_brief()).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.succeeded_units, 3);
    let output = final_output(outcome.output);
    assert_eq!(output.url, "mem://renders/spring/job-1.mp4");
    assert_eq!(output.campaign_id, "spring");
    assert_eq!(output.units_included, vec![0, 1, 2]);
    assert!(output.units_failed.is_empty());

    let video = String::from_utf8(simulated.storage.object(&output.url).unwrap()).unwrap();
    let (clips, narration) = video.split_once('+').unwrap();
    let scenes: Vec<&str> = clips.split('|').collect();
    assert_eq!(scenes.len(), 3);
    for (index, scene) in scenes.iter().enumerate() {
        assert!(scene.ends_with(&format!("(scene {})", index + 1)), "{scene}");
    }
    assert!(narration.contains("Narration: bright and fast"), "{narration}");

    assert_eq!(simulated.interpretation.call_count(), 1);
    assert_eq!(simulated.media.combine_count(), 1);
    // Three subclips and one narration
    assert_eq!(simulated.generation.total_submissions(), 4);
}

#[tokio::test]
async fn test_max_scenes_caps_the_fan_out() {
    let simulated = SimulatedCollaborators::new();
    let orchestrator = build(&simulated);
    let mut brief = four_asset_brief();
    brief["max_scenes"] = json!(2);
    orchestrator.create_run(JOB, brief).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.succeeded_units, 2);
    assert_eq!(simulated.generation.submissions_matching("(scene 3)"), 0);
}

#[tokio::test]
async fn test_rejected_scene_is_left_out_of_the_video() {
    let simulated = SimulatedCollaborators::new();
    simulated
        .generation
        .inject_permanent_failures("(scene 2)", 1, "content policy");
    let orchestrator = build(&simulated);
    orchestrator.create_run(JOB, four_asset_brief()).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.succeeded_units, 2);
    assert_eq!(outcome.failed_units, 1);
    let output = final_output(outcome.output);
    assert_eq!(output.units_included, vec![0, 2]);
    assert_eq!(output.units_failed, vec![1]);
    // Rejections are not retried
    assert_eq!(simulated.generation.submissions_matching("(scene 2)"), 1);

    let video = String::from_utf8(simulated.storage.object(&output.url).unwrap()).unwrap();
    assert!(!video.contains("(scene 2)"));
}

#[tokio::test]
async fn test_flaky_generation_is_retried() {
    let simulated = SimulatedCollaborators::new();
    simulated.generation.inject_submit_failures(
        "(scene 1)",
        vec![CollaboratorError::Transient("503 service unavailable".to_string())],
    );
    simulated.generation.inject_submit_failures(
        "(scene 3)",
        vec![CollaboratorError::RateLimited { retry_after: None }],
    );
    let orchestrator = build(&simulated);
    orchestrator.create_run(JOB, four_asset_brief()).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.failed_units, 0);
    assert_eq!(simulated.generation.submissions_matching("(scene 1)"), 2);
    assert_eq!(simulated.generation.submissions_matching("(scene 2)"), 1);
    assert_eq!(simulated.generation.submissions_matching("(scene 3)"), 2);
}

#[tokio::test]
async fn test_storage_hiccup_on_download_is_retried() {
    let simulated = SimulatedCollaborators::new();
    simulated.storage.inject_failures(
        "clips/0.mp4",
        vec![CollaboratorError::Network("connection reset".to_string())],
    );
    let orchestrator = build(&simulated);
    orchestrator.create_run(JOB, four_asset_brief()).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.failed_units, 0);
    let download = orchestrator
        .store()
        .get_task(&"job-1:download-result:0".into())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(download.attempt_count, 2);
    assert_eq!(download.last_error.unwrap().code, "network_error");
}

#[tokio::test]
async fn test_invalid_brief_is_rejected() {
    let simulated = SimulatedCollaborators::new();
    let orchestrator = build(&simulated);
    let err = orchestrator
        .create_run(
            JOB,
            json!({
                "campaign_id": "spring",
                "title": "Spring launch",
                "brief": "bright and fast",
                "asset_urls": ["only.png"],
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReelforgeError::InvalidParameters(_)), "{err}");
    assert_eq!(simulated.interpretation.call_count(), 0);
}

#[tokio::test]
async fn test_uninterpretable_brief_fails_the_run() {
    let simulated = SimulatedCollaborators::new();
    simulated.interpretation.inject_failures(
        "bright",
        vec![CollaboratorError::Rejected("brief violates guidelines".to_string())],
    );
    let orchestrator = build(&simulated);
    orchestrator.create_run(JOB, four_asset_brief()).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.last_error.unwrap();
    assert_eq!(error.code, "rejected");
    assert_eq!(simulated.generation.total_submissions(), 0);

    let status = orchestrator.get_status(JOB).await.unwrap();
    assert!(status.message.contains("select-pairs"), "{}", status.message);
}

#[tokio::test]
async fn test_pipeline_on_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StateStore> =
        Arc::new(SqliteStateStore::open_path(dir.path().join("runs.db")).await.unwrap());
    let simulated = SimulatedCollaborators::new();
    let orchestrator = build_with_store(&simulated, Some(store.clone()));

    orchestrator.create_run(JOB, four_asset_brief()).await.unwrap();
    let outcome = orchestrator.wait(JOB).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.total_tasks, 12);

    let batch = store.get_batch(JOB, "subclips").await.unwrap().unwrap();
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.join_task_id.as_str(), "job-1:combine-clips");
    store.close().await.unwrap();
}
