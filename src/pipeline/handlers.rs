//! # Pipeline Stage Handlers
//!
//! One [`TaskHandler`] per marketing-video stage. Handlers talk only to the
//! collaborator traits and classify every collaborator error at this boundary
//! with the [`StandardErrorClassifier`], so a rejected prompt inside a scene
//! costs that scene while the same rejection in a single-instance stage ends
//! the run.
//!
//! Outputs are plain serde structs; downstream stages read them back with
//! [`TaskExecutionContext::dependency_as`].

use super::{HandlerSettings, VideoBrief};
use crate::collaborators::{
    CollaboratorError, Collaborators, GenerationHandle, GenerationRequest, GenerationStatus,
    InterpretationContext, Medium,
};
use crate::models::{FanOutMember, FanOutSpec, TaskKind, TaskOutput, TaskParameters};
use crate::orchestration::error_classifier::{ErrorClassifier, ErrorContext, StandardErrorClassifier};
use crate::orchestration::task_handler::{TaskExecutionContext, TaskFailure, TaskHandler};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

type HandlerResult = Result<TaskOutput, TaskFailure>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub assets: Vec<String>,
    pub manifest_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutput {
    pub scene_count: usize,
    pub narration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubclipOutput {
    pub unit_index: usize,
    pub handle: String,
    pub result_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipOutput {
    pub unit_index: usize,
    pub url: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioOutput {
    pub handle: String,
    pub result_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedOutput {
    pub url: String,
    pub units_included: Vec<usize>,
    pub units_failed: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedOutput {
    pub url: String,
    pub units_included: Vec<usize>,
    pub units_failed: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalOutput {
    pub url: String,
    pub campaign_id: String,
    pub title: String,
    pub units_included: Vec<usize>,
    pub units_failed: Vec<usize>,
}

fn collaborator_failure(
    context: &TaskExecutionContext,
    operation: &str,
    error: CollaboratorError,
) -> TaskFailure {
    let error_context = ErrorContext::new(
        context.task_id.clone(),
        context.kind,
        context.attempt,
        operation,
    )
    .in_fan_out(context.is_fan_out_member());
    StandardErrorClassifier::new().to_failure(&error, &error_context)
}

fn to_output<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value)
        .map(TaskOutput::new)
        .map_err(|e| TaskFailure::terminal_run("output_serialization", e.to_string()))
}

fn unexpected_parameters(context: &TaskExecutionContext) -> TaskFailure {
    TaskFailure::terminal_run(
        "unexpected_parameters",
        format!("{} received parameters of kind {}", context.kind, context.parameters.kind()),
    )
}

/// Submit a generation request and poll its handle until it settles.
///
/// The attempt timeout bounds the loop; a permanent failure reported by the
/// service is classified like a rejection, anything else like a transient
/// error.
async fn generate(
    collaborators: &Collaborators,
    context: &TaskExecutionContext,
    request: GenerationRequest,
    poll_interval: Duration,
) -> Result<(GenerationHandle, String), TaskFailure> {
    let handle = collaborators
        .generation
        .submit(request)
        .await
        .map_err(|e| collaborator_failure(context, "generation.submit", e))?;
    debug!(task_id = %context.task_id, handle = %handle.0, "Submitted generation request");

    loop {
        let status = collaborators
            .generation
            .poll(&handle)
            .await
            .map_err(|e| collaborator_failure(context, "generation.poll", e))?;
        match status {
            GenerationStatus::Pending => tokio::time::sleep(poll_interval).await,
            GenerationStatus::Succeeded { result_url } => return Ok((handle, result_url)),
            GenerationStatus::Failed { reason, permanent } => {
                let error = if permanent {
                    CollaboratorError::Rejected(reason)
                } else {
                    CollaboratorError::Transient(reason)
                };
                return Err(collaborator_failure(context, "generation.poll", error));
            }
        }
    }
}

/// Validates the uploaded assets and writes the job's asset manifest
#[derive(Debug, Clone)]
pub struct CollectAssetsHandler {
    collaborators: Collaborators,
}

impl CollectAssetsHandler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl TaskHandler for CollectAssetsHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::CollectAssets
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::CollectAssets { asset_urls } = &context.parameters else {
            return Err(unexpected_parameters(&context));
        };
        let brief: VideoBrief = context.run_parameters_as()?;

        let mut assets: Vec<String> = Vec::with_capacity(asset_urls.len());
        for url in asset_urls.iter().map(|u| u.trim()).filter(|u| !u.is_empty()) {
            if !assets.iter().any(|seen| seen == url) {
                assets.push(url.to_string());
            }
        }
        if assets.len() < 2 {
            return Err(TaskFailure::terminal_run(
                "insufficient_assets",
                format!("{} distinct assets, at least two are needed", assets.len()),
            ));
        }

        let manifest = serde_json::to_vec(&assets)
            .map_err(|e| TaskFailure::terminal_run("output_serialization", e.to_string()))?;
        let manifest_url = self
            .collaborators
            .storage
            .put(&brief.job_key(&context.job_id, "manifest.json"), manifest)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.put", e))?;

        to_output(&AssetManifest {
            assets,
            manifest_url,
        })
    }
}

/// Interprets the brief into scene pairs and fans out one chain per scene
#[derive(Debug, Clone)]
pub struct SelectPairsHandler {
    collaborators: Collaborators,
    settings: HandlerSettings,
}

impl SelectPairsHandler {
    pub fn new(collaborators: Collaborators, settings: HandlerSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }
}

#[async_trait]
impl TaskHandler for SelectPairsHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::SelectPairs
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::SelectPairs { brief, max_pairs } = &context.parameters else {
            return Err(unexpected_parameters(&context));
        };
        let video: VideoBrief = context.run_parameters_as()?;
        let manifest: AssetManifest = context.dependency_as(TaskKind::CollectAssets)?;

        let plan = self
            .collaborators
            .interpretation
            .interpret(InterpretationContext {
                brief: brief.clone(),
                asset_urls: manifest.assets,
                max_pairs: *max_pairs,
            })
            .await
            .map_err(|e| collaborator_failure(&context, "interpretation.interpret", e))?;

        let scenes: Vec<_> = plan.scenes.into_iter().take(*max_pairs).collect();
        if scenes.is_empty() {
            return Err(TaskFailure::terminal_run(
                "empty_plan",
                "interpretation produced no scenes",
            ));
        }

        let members = scenes
            .into_iter()
            .enumerate()
            .map(|(unit_index, scene)| FanOutMember {
                parameters: vec![
                    TaskParameters::GenerateSubclip {
                        unit_index,
                        prompt: scene.prompt,
                        first_asset: scene.first_asset,
                        second_asset: scene.second_asset,
                        duration_seconds: self.settings.subclip_duration_seconds,
                    },
                    TaskParameters::DownloadResult {
                        unit_index,
                        destination_key: video
                            .job_key(&context.job_id, &format!("clips/{unit_index}.mp4")),
                    },
                ],
            })
            .collect::<Vec<_>>();

        info!(
            job_id = %context.job_id,
            scenes = members.len(),
            "Creative plan selected"
        );
        let selection = SelectionOutput {
            scene_count: members.len(),
            narration: plan.narration,
        };
        let payload = serde_json::to_value(&selection)
            .map_err(|e| TaskFailure::terminal_run("output_serialization", e.to_string()))?;
        Ok(TaskOutput::with_fan_out(payload, FanOutSpec { members }))
    }
}

/// Generates one scene's video clip
#[derive(Debug, Clone)]
pub struct GenerateSubclipHandler {
    collaborators: Collaborators,
    settings: HandlerSettings,
}

impl GenerateSubclipHandler {
    pub fn new(collaborators: Collaborators, settings: HandlerSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }
}

#[async_trait]
impl TaskHandler for GenerateSubclipHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::GenerateSubclip
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::GenerateSubclip {
            unit_index,
            prompt,
            first_asset,
            second_asset,
            duration_seconds,
        } = &context.parameters
        else {
            return Err(unexpected_parameters(&context));
        };

        let request = GenerationRequest {
            medium: Medium::Video,
            prompt: prompt.clone(),
            inputs: vec![first_asset.clone(), second_asset.clone()],
            duration_seconds: Some(*duration_seconds),
            voice: None,
        };
        let (handle, result_url) =
            generate(&self.collaborators, &context, request, self.settings.poll_interval).await?;

        to_output(&SubclipOutput {
            unit_index: *unit_index,
            handle: handle.0,
            result_url,
        })
    }
}

/// Copies a generated clip into the job's storage workspace
#[derive(Debug, Clone)]
pub struct DownloadResultHandler {
    collaborators: Collaborators,
}

impl DownloadResultHandler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl TaskHandler for DownloadResultHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::DownloadResult
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::DownloadResult {
            unit_index,
            destination_key,
        } = &context.parameters
        else {
            return Err(unexpected_parameters(&context));
        };
        let subclip: SubclipOutput = context.dependency_as(TaskKind::GenerateSubclip)?;

        let bytes = self
            .collaborators
            .storage
            .get(&subclip.result_url)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.get", e))?;
        let size = bytes.len();
        let url = self
            .collaborators
            .storage
            .put(destination_key, bytes)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.put", e))?;

        to_output(&ClipOutput {
            unit_index: *unit_index,
            url,
            bytes: size,
        })
    }
}

/// Synthesizes the narration track
#[derive(Debug, Clone)]
pub struct GenerateAudioHandler {
    collaborators: Collaborators,
    settings: HandlerSettings,
}

impl GenerateAudioHandler {
    pub fn new(collaborators: Collaborators, settings: HandlerSettings) -> Self {
        Self {
            collaborators,
            settings,
        }
    }
}

#[async_trait]
impl TaskHandler for GenerateAudioHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::GenerateAudio
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::GenerateAudio { voice } = &context.parameters else {
            return Err(unexpected_parameters(&context));
        };
        let selection: SelectionOutput = context.dependency_as(TaskKind::SelectPairs)?;

        let request = GenerationRequest {
            medium: Medium::Audio,
            prompt: selection.narration,
            inputs: Vec::new(),
            duration_seconds: None,
            voice: voice.clone(),
        };
        let (handle, result_url) =
            generate(&self.collaborators, &context, request, self.settings.poll_interval).await?;

        to_output(&AudioOutput {
            handle: handle.0,
            result_url,
        })
    }
}

/// Join of the `subclips` batch: concatenates every successful clip in
/// scene order
#[derive(Debug, Clone)]
pub struct CombineClipsHandler {
    collaborators: Collaborators,
}

impl CombineClipsHandler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl TaskHandler for CombineClipsHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::CombineClips
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::CombineClips { destination_key } = &context.parameters else {
            return Err(unexpected_parameters(&context));
        };
        let results = context.batch_results.as_ref().ok_or_else(|| {
            TaskFailure::terminal_run("missing_batch_results", "combine-clips ran without its batch")
        })?;

        let mut clips: Vec<ClipOutput> = results
            .succeeded
            .iter()
            .map(|unit| serde_json::from_value(unit.payload.clone()))
            .collect::<Result<_, _>>()
            .map_err(|e| TaskFailure::terminal_run("malformed_dependency_output", e.to_string()))?;
        clips.sort_by_key(|clip| clip.unit_index);

        let mut bodies = Vec::with_capacity(clips.len());
        for clip in &clips {
            let bytes = self
                .collaborators
                .storage
                .get(&clip.url)
                .await
                .map_err(|e| collaborator_failure(&context, "storage.get", e))?;
            bodies.push(bytes);
        }

        let combined = self
            .collaborators
            .media
            .combine_clips(bodies)
            .await
            .map_err(|e| collaborator_failure(&context, "media.combine_clips", e))?;
        let url = self
            .collaborators
            .storage
            .put(destination_key, combined)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.put", e))?;

        let mut units_failed: Vec<usize> = results.failed.iter().map(|u| u.unit_index).collect();
        units_failed.sort_unstable();
        to_output(&CombinedOutput {
            url,
            units_included: clips.iter().map(|c| c.unit_index).collect(),
            units_failed,
        })
    }
}

/// Lays the narration track under the combined video
#[derive(Debug, Clone)]
pub struct MergeAudioHandler {
    collaborators: Collaborators,
}

impl MergeAudioHandler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl TaskHandler for MergeAudioHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::MergeAudio
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::MergeAudio { destination_key } = &context.parameters else {
            return Err(unexpected_parameters(&context));
        };
        let combined: CombinedOutput = context.dependency_as(TaskKind::CombineClips)?;
        let audio: AudioOutput = context.dependency_as(TaskKind::GenerateAudio)?;

        let storage = &self.collaborators.storage;
        let video = storage
            .get(&combined.url)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.get", e))?;
        let track = storage
            .get(&audio.result_url)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.get", e))?;
        let merged = self
            .collaborators
            .media
            .merge_audio(video, track)
            .await
            .map_err(|e| collaborator_failure(&context, "media.merge_audio", e))?;
        let url = storage
            .put(destination_key, merged)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.put", e))?;

        to_output(&MergedOutput {
            url,
            units_included: combined.units_included,
            units_failed: combined.units_failed,
        })
    }
}

/// Publishes the finished video under the campaign
#[derive(Debug, Clone)]
pub struct StoreFinalHandler {
    collaborators: Collaborators,
}

impl StoreFinalHandler {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }
}

#[async_trait]
impl TaskHandler for StoreFinalHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::StoreFinal
    }

    async fn execute(&self, context: TaskExecutionContext) -> HandlerResult {
        let TaskParameters::StoreFinal { destination_key } = &context.parameters else {
            return Err(unexpected_parameters(&context));
        };
        let brief: VideoBrief = context.run_parameters_as()?;
        let merged: MergedOutput = context.dependency_as(TaskKind::MergeAudio)?;

        let storage = &self.collaborators.storage;
        let bytes = storage
            .get(&merged.url)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.get", e))?;
        let url = storage
            .put(destination_key, bytes)
            .await
            .map_err(|e| collaborator_failure(&context, "storage.put", e))?;

        info!(job_id = %context.job_id, url = %url, "Final video stored");
        to_output(&FinalOutput {
            url,
            campaign_id: brief.campaign_id,
            title: brief.title,
            units_included: merged.units_included,
            units_failed: merged.units_failed,
        })
    }
}
