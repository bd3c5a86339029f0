//! # External Collaborators
//!
//! Boundaries to the services a pipeline run consumes. All of them are
//! fallible, rate-limited and asynchronous; their errors are classified at
//! the task-body boundary (see `orchestration::error_classifier`) before the
//! scheduler ever sees them.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient service error: {0}")]
    Transient(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rejected by service: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub medium: Medium,
    pub prompt: String,
    /// Input asset urls (keyframes for video)
    pub inputs: Vec<String>,
    pub duration_seconds: Option<f32>,
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GenerationHandle(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GenerationStatus {
    Pending,
    Succeeded { result_url: String },
    Failed { reason: String, permanent: bool },
}

/// Image/video/audio synthesis service
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn submit(&self, request: GenerationRequest) -> CollaboratorResult<GenerationHandle>;
    async fn poll(&self, handle: &GenerationHandle) -> CollaboratorResult<GenerationStatus>;
}

/// Object storage
#[async_trait]
pub trait StorageService: Send + Sync {
    /// Store `bytes` under `key`, returning the object's url
    async fn put(&self, key: &str, bytes: Vec<u8>) -> CollaboratorResult<String>;
    async fn get(&self, url: &str) -> CollaboratorResult<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretationContext {
    pub brief: String,
    pub asset_urls: Vec<String>,
    pub max_pairs: usize,
}

/// One scene: a transition between two keyframe assets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenePair {
    pub first_asset: String,
    pub second_asset: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreativePlan {
    pub scenes: Vec<ScenePair>,
    pub narration: String,
}

/// Prompt interpretation service turning a brief into a structured plan
#[async_trait]
pub trait InterpretationService: Send + Sync {
    async fn interpret(&self, context: InterpretationContext) -> CollaboratorResult<CreativePlan>;
}

/// Local media post-processing
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    async fn combine_clips(&self, clips: Vec<Vec<u8>>) -> CollaboratorResult<Vec<u8>>;
    async fn merge_audio(&self, video: Vec<u8>, audio: Vec<u8>) -> CollaboratorResult<Vec<u8>>;
}

/// The collaborator set a pipeline's task handlers are wired against
#[derive(Clone)]
pub struct Collaborators {
    pub generation: Arc<dyn GenerationService>,
    pub storage: Arc<dyn StorageService>,
    pub interpretation: Arc<dyn InterpretationService>,
    pub media: Arc<dyn MediaProcessor>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
