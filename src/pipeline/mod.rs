//! # Marketing-Video Pipeline
//!
//! The concrete job this orchestration core drives. A [`VideoBrief`] is
//! turned into the static graph
//!
//! ```text
//! collect-assets → select-pairs ─┬─ [generate-subclip → download-result] × N ─→ combine-clips ─┐
//!                                └─ generate-audio ──────────────────────────────────────────┴→ merge-audio → store-final
//! ```
//!
//! where `select-pairs` is the generator of the `subclips` batch and
//! `combine-clips` its join. The number of scenes is only known once the
//! brief has been interpreted, so member chains are materialized at runtime.

pub mod handlers;

use crate::collaborators::Collaborators;
use crate::config::{OrchestratorConfig, PipelineConfig};
use crate::constants::SUBCLIP_BATCH;
use crate::error::{ReelforgeError, Result};
use crate::models::{TaskGraph, TaskGraphBuilder, TaskKind, TaskParameters};
use crate::orchestration::job_facade::GraphBuilder;
use crate::orchestration::task_handler::HandlerRegistry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use handlers::{
    AssetManifest, AudioOutput, ClipOutput, CollectAssetsHandler, CombineClipsHandler,
    CombinedOutput, DownloadResultHandler, FinalOutput, GenerateAudioHandler,
    GenerateSubclipHandler, MergeAudioHandler, MergedOutput, SelectPairsHandler, SelectionOutput,
    StoreFinalHandler, SubclipOutput,
};

fn default_destination_prefix() -> String {
    "renders".to_string()
}

/// Root parameters of a marketing-video job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoBrief {
    pub campaign_id: String,
    pub title: String,
    /// Free-text creative brief handed to the interpretation service
    pub brief: String,
    pub asset_urls: Vec<String>,
    /// Requested scene count, capped by `pipeline.max_scenes`
    #[serde(default)]
    pub max_scenes: Option<usize>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default = "default_destination_prefix")]
    pub destination_prefix: String,
}

impl VideoBrief {
    pub fn from_value(parameters: &Value) -> Result<Self> {
        let brief: Self = serde_json::from_value(parameters.clone())
            .map_err(|e| ReelforgeError::InvalidParameters(format!("malformed video brief: {e}")))?;
        brief.validate()?;
        Ok(brief)
    }

    pub fn validate(&self) -> Result<()> {
        if self.campaign_id.trim().is_empty() {
            return Err(ReelforgeError::InvalidParameters(
                "campaign_id must not be empty".to_string(),
            ));
        }
        if self.brief.trim().is_empty() {
            return Err(ReelforgeError::InvalidParameters(
                "brief must not be empty".to_string(),
            ));
        }
        if self.asset_urls.len() < 2 {
            return Err(ReelforgeError::InvalidParameters(format!(
                "at least two assets are needed to build a scene, got {}",
                self.asset_urls.len()
            )));
        }
        if self.max_scenes == Some(0) {
            return Err(ReelforgeError::InvalidParameters(
                "max_scenes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Storage key under this job's workspace
    pub fn job_key(&self, job_id: &str, name: &str) -> String {
        format!("{}/{job_id}/{name}", self.destination_prefix.trim_end_matches('/'))
    }

    pub fn final_key(&self, job_id: &str) -> String {
        format!(
            "{}/{}/{job_id}.mp4",
            self.destination_prefix.trim_end_matches('/'),
            self.campaign_id
        )
    }
}

/// Builds the marketing-video task graph from a [`VideoBrief`]
#[derive(Debug, Clone, Default)]
pub struct MarketingVideoPipeline {
    config: PipelineConfig,
}

impl MarketingVideoPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn scene_cap(&self, brief: &VideoBrief) -> usize {
        brief
            .max_scenes
            .map_or(self.config.max_scenes, |requested| requested.min(self.config.max_scenes))
    }
}

impl GraphBuilder for MarketingVideoPipeline {
    fn build(&self, job_id: &str, parameters: &Value) -> Result<TaskGraph> {
        let brief = VideoBrief::from_value(parameters)?;
        let mut graph = TaskGraphBuilder::new(job_id);

        let collect = graph.add(
            TaskParameters::CollectAssets {
                asset_urls: brief.asset_urls.clone(),
            },
            &[],
        );
        let select = graph.add(
            TaskParameters::SelectPairs {
                brief: brief.brief.clone(),
                max_pairs: self.scene_cap(&brief),
            },
            &[collect],
        );
        let combine = graph.add(
            TaskParameters::CombineClips {
                destination_key: brief.job_key(job_id, "combined.mp4"),
            },
            &[select.clone()],
        );
        let audio = graph.add(
            TaskParameters::GenerateAudio {
                voice: brief.voice.clone(),
            },
            &[select.clone()],
        );
        let merge = graph.add(
            TaskParameters::MergeAudio {
                destination_key: brief.job_key(job_id, "merged.mp4"),
            },
            &[combine.clone(), audio],
        );
        let store = graph.add(
            TaskParameters::StoreFinal {
                destination_key: brief.final_key(job_id),
            },
            &[merge],
        );

        graph.fan_out(
            &select,
            SUBCLIP_BATCH,
            vec![TaskKind::GenerateSubclip, TaskKind::DownloadResult],
            &combine,
        )?;
        Ok(graph.build(store))
    }
}

/// Handler tuning shared by every pipeline stage
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSettings {
    /// Cadence for polling outstanding generation handles
    pub poll_interval: Duration,
    pub subclip_duration_seconds: f32,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            subclip_duration_seconds: PipelineConfig::default().subclip_duration_seconds,
        }
    }
}

impl HandlerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            poll_interval: config.execution.generation_poll_interval(),
            subclip_duration_seconds: config.pipeline.subclip_duration_seconds,
        }
    }
}

/// Register a handler for every marketing-video task kind
pub fn register_handlers(
    registry: &mut HandlerRegistry,
    collaborators: Collaborators,
    settings: HandlerSettings,
) {
    registry
        .register(Arc::new(CollectAssetsHandler::new(collaborators.clone())))
        .register(Arc::new(SelectPairsHandler::new(
            collaborators.clone(),
            settings.clone(),
        )))
        .register(Arc::new(GenerateSubclipHandler::new(
            collaborators.clone(),
            settings.clone(),
        )))
        .register(Arc::new(DownloadResultHandler::new(collaborators.clone())))
        .register(Arc::new(GenerateAudioHandler::new(
            collaborators.clone(),
            settings,
        )))
        .register(Arc::new(CombineClipsHandler::new(collaborators.clone())))
        .register(Arc::new(MergeAudioHandler::new(collaborators.clone())))
        .register(Arc::new(StoreFinalHandler::new(collaborators)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::dependency_resolver::DependencyResolver;
    use serde_json::json;

    fn brief() -> Value {
        json!({
            "campaign_id": "spring",
            "title": "Spring launch",
            "brief": "bright and fast",
            "asset_urls": ["a.png", "b.png", "c.png"],
        })
    }

    #[test]
    fn test_brief_defaults() {
        let brief = VideoBrief::from_value(&brief()).unwrap();
        assert_eq!(brief.destination_prefix, "renders");
        assert_eq!(brief.max_scenes, None);
        assert_eq!(brief.final_key("job-1"), "renders/spring/job-1.mp4");
        assert_eq!(brief.job_key("job-1", "merged.mp4"), "renders/job-1/merged.mp4");
    }

    #[test]
    fn test_brief_validation() {
        let mut params = brief();
        params["asset_urls"] = json!(["only-one.png"]);
        assert!(matches!(
            VideoBrief::from_value(&params),
            Err(ReelforgeError::InvalidParameters(_))
        ));

        assert!(VideoBrief::from_value(&json!({"title": "no campaign"})).is_err());
    }

    #[test]
    fn test_graph_shape() {
        let pipeline = MarketingVideoPipeline::default();
        let graph = pipeline.build("job-1", &brief()).unwrap();

        assert_eq!(graph.tasks.len(), 6);
        assert_eq!(graph.root.as_str(), "job-1:store-final");

        let select = graph
            .tasks
            .iter()
            .find(|t| t.kind == TaskKind::SelectPairs)
            .unwrap();
        let template = select.fan_out.as_ref().unwrap();
        assert_eq!(template.batch_name, SUBCLIP_BATCH);
        assert_eq!(template.join_task_id.as_str(), "job-1:combine-clips");

        let merge = graph
            .tasks
            .iter()
            .find(|t| t.kind == TaskKind::MergeAudio)
            .unwrap();
        assert_eq!(merge.dependencies.len(), 2);

        let plan = DependencyResolver::resolve(&graph.root, &graph.tasks).unwrap();
        assert_eq!(plan.len(), 6);
        assert!(plan.position(&select.id) < plan.position(&merge.id));
    }

    #[test]
    fn test_scene_cap_respects_config() {
        let pipeline = MarketingVideoPipeline::new(PipelineConfig {
            max_scenes: 3,
            ..PipelineConfig::default()
        });
        let mut params = brief();
        params["max_scenes"] = json!(10);
        let graph = pipeline.build("job-1", &params).unwrap();
        let select = graph
            .tasks
            .iter()
            .find(|t| t.kind == TaskKind::SelectPairs)
            .unwrap();
        assert_eq!(
            select.parameters,
            TaskParameters::SelectPairs {
                brief: "bright and fast".to_string(),
                max_pairs: 3
            }
        );
    }
}
