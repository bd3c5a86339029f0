//! Deterministic in-memory collaborators with failure injection.
//!
//! Used by the integration tests and the demo binary. Failures are scripted
//! per subject substring (a prompt, a storage key): each matching call pops
//! the next scripted error until the script for that rule runs dry.

use super::{
    CollaboratorError, CollaboratorResult, Collaborators, CreativePlan, GenerationHandle,
    GenerationRequest, GenerationService, GenerationStatus, InterpretationContext,
    InterpretationService, MediaProcessor, Medium, ScenePair, StorageService,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MEMORY_SCHEME: &str = "mem://";

#[derive(Debug, Default)]
struct FailureScript {
    rules: Mutex<Vec<(String, VecDeque<CollaboratorError>)>>,
}

impl FailureScript {
    fn push(&self, subject: &str, errors: Vec<CollaboratorError>) {
        self.rules
            .lock()
            .push((subject.to_string(), errors.into_iter().collect()));
    }

    fn next_failure(&self, subject: &str) -> Option<CollaboratorError> {
        let mut rules = self.rules.lock();
        rules
            .iter_mut()
            .find(|(pattern, errors)| subject.contains(pattern.as_str()) && !errors.is_empty())
            .and_then(|(_, errors)| errors.pop_front())
    }
}

#[derive(Debug, Default)]
pub struct SimulatedStorage {
    objects: DashMap<String, Vec<u8>>,
    failures: FailureScript,
    puts: AtomicUsize,
}

impl SimulatedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `put`/`get` calls whose key contains `subject`
    pub fn inject_failures(&self, subject: &str, errors: Vec<CollaboratorError>) {
        self.failures.push(subject, errors);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object(&self, url: &str) -> Option<Vec<u8>> {
        self.objects
            .get(url.trim_start_matches(MEMORY_SCHEME))
            .map(|entry| entry.value().clone())
    }

    pub fn seed(&self, key: &str, bytes: impl Into<Vec<u8>>) -> String {
        self.objects.insert(key.to_string(), bytes.into());
        format!("{MEMORY_SCHEME}{key}")
    }
}

#[async_trait]
impl StorageService for SimulatedStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> CollaboratorResult<String> {
        if let Some(error) = self.failures.next_failure(key) {
            return Err(error);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.insert(key.to_string(), bytes);
        Ok(format!("{MEMORY_SCHEME}{key}"))
    }

    async fn get(&self, url: &str) -> CollaboratorResult<Vec<u8>> {
        if let Some(error) = self.failures.next_failure(url) {
            return Err(error);
        }
        self.object(url)
            .ok_or_else(|| CollaboratorError::NotFound(url.to_string()))
    }
}

#[derive(Debug)]
struct GenerationJob {
    request: GenerationRequest,
    polls_remaining: u32,
    permanent_failure: Option<String>,
}

/// Generation service that completes every job after a fixed number of polls
#[derive(Debug)]
pub struct SimulatedGeneration {
    storage: Arc<SimulatedStorage>,
    jobs: DashMap<String, GenerationJob>,
    submit_failures: FailureScript,
    rejections: FailureScript,
    polls_until_done: u32,
    latency: Duration,
    next_handle: AtomicU64,
    submissions: DashMap<String, usize>,
}

impl SimulatedGeneration {
    pub fn new(storage: Arc<SimulatedStorage>) -> Self {
        Self {
            storage,
            jobs: DashMap::new(),
            submit_failures: FailureScript::default(),
            rejections: FailureScript::default(),
            polls_until_done: 1,
            latency: Duration::ZERO,
            next_handle: AtomicU64::new(1),
            submissions: DashMap::new(),
        }
    }

    pub fn with_polls_until_done(mut self, polls: u32) -> Self {
        self.polls_until_done = polls;
        self
    }

    /// Delay applied to every submit, to hold tasks in flight
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next submits whose prompt contains `subject`
    pub fn inject_submit_failures(&self, subject: &str, errors: Vec<CollaboratorError>) {
        self.submit_failures.push(subject, errors);
    }

    /// Make the next `count` jobs whose prompt contains `subject` end in a
    /// permanent failure reported by `poll`
    pub fn inject_permanent_failures(&self, subject: &str, count: usize, reason: &str) {
        let errors = (0..count)
            .map(|_| CollaboratorError::Rejected(reason.to_string()))
            .collect();
        self.rejections.push(subject, errors);
    }

    /// Number of submit calls that reached the service for prompts containing `subject`
    pub fn submissions_matching(&self, subject: &str) -> usize {
        self.submissions
            .iter()
            .filter(|entry| entry.key().contains(subject))
            .map(|entry| *entry.value())
            .sum()
    }

    pub fn total_submissions(&self) -> usize {
        self.submissions.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait]
impl GenerationService for SimulatedGeneration {
    async fn submit(&self, request: GenerationRequest) -> CollaboratorResult<GenerationHandle> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        *self.submissions.entry(request.prompt.clone()).or_insert(0) += 1;
        if let Some(error) = self.submit_failures.next_failure(&request.prompt) {
            return Err(error);
        }
        if request.prompt.trim().is_empty() {
            return Err(CollaboratorError::InvalidInput("empty prompt".to_string()));
        }

        let permanent_failure = self
            .rejections
            .next_failure(&request.prompt)
            .map(|error| error.to_string());
        let handle = format!("gen-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.jobs.insert(
            handle.clone(),
            GenerationJob {
                request,
                polls_remaining: self.polls_until_done,
                permanent_failure,
            },
        );
        Ok(GenerationHandle(handle))
    }

    async fn poll(&self, handle: &GenerationHandle) -> CollaboratorResult<GenerationStatus> {
        let mut job = self
            .jobs
            .get_mut(&handle.0)
            .ok_or_else(|| CollaboratorError::NotFound(handle.0.clone()))?;

        if job.polls_remaining > 1 {
            job.polls_remaining -= 1;
            return Ok(GenerationStatus::Pending);
        }
        if let Some(reason) = job.permanent_failure.clone() {
            return Ok(GenerationStatus::Failed {
                reason,
                permanent: true,
            });
        }

        let extension = match job.request.medium {
            Medium::Video => "mp4",
            Medium::Audio => "wav",
        };
        let body = format!("{:?}:{}", job.request.medium, job.request.prompt);
        drop(job);
        let url = self
            .storage
            .seed(&format!("generated/{}.{extension}", handle.0), body);
        Ok(GenerationStatus::Succeeded { result_url: url })
    }
}

/// Pairs consecutive assets into scenes
#[derive(Debug, Default)]
pub struct SimulatedInterpretation {
    failures: FailureScript,
    calls: AtomicUsize,
}

impl SimulatedInterpretation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_failures(&self, subject: &str, errors: Vec<CollaboratorError>) {
        self.failures.push(subject, errors);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InterpretationService for SimulatedInterpretation {
    async fn interpret(&self, context: InterpretationContext) -> CollaboratorResult<CreativePlan> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.next_failure(&context.brief) {
            return Err(error);
        }
        if context.asset_urls.len() < 2 {
            return Err(CollaboratorError::InvalidInput(format!(
                "need at least two assets to build a scene, got {}",
                context.asset_urls.len()
            )));
        }

        let scenes = context
            .asset_urls
            .windows(2)
            .take(context.max_pairs)
            .enumerate()
            .map(|(index, pair)| ScenePair {
                first_asset: pair[0].clone(),
                second_asset: pair[1].clone(),
                prompt: format!("{} (scene {})", context.brief, index + 1),
            })
            .collect();

        Ok(CreativePlan {
            scenes,
            narration: format!("Narration: {}", context.brief),
        })
    }
}

/// Byte-level stand-in for ffmpeg-style combine and merge
#[derive(Debug, Default)]
pub struct SimulatedMedia {
    combines: AtomicUsize,
}

impl SimulatedMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn combine_count(&self) -> usize {
        self.combines.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProcessor for SimulatedMedia {
    async fn combine_clips(&self, clips: Vec<Vec<u8>>) -> CollaboratorResult<Vec<u8>> {
        if clips.is_empty() {
            return Err(CollaboratorError::InvalidInput("no clips to combine".to_string()));
        }
        self.combines.fetch_add(1, Ordering::SeqCst);
        Ok(clips.join(&b'|'))
    }

    async fn merge_audio(&self, video: Vec<u8>, audio: Vec<u8>) -> CollaboratorResult<Vec<u8>> {
        let mut merged = video;
        merged.extend_from_slice(b"+");
        merged.extend(audio);
        Ok(merged)
    }
}

/// A full simulated collaborator set with handles kept for assertions
#[derive(Debug, Clone)]
pub struct SimulatedCollaborators {
    pub storage: Arc<SimulatedStorage>,
    pub generation: Arc<SimulatedGeneration>,
    pub interpretation: Arc<SimulatedInterpretation>,
    pub media: Arc<SimulatedMedia>,
}

impl SimulatedCollaborators {
    pub fn new() -> Self {
        let storage = Arc::new(SimulatedStorage::new());
        Self {
            generation: Arc::new(SimulatedGeneration::new(storage.clone())),
            storage,
            interpretation: Arc::new(SimulatedInterpretation::new()),
            media: Arc::new(SimulatedMedia::new()),
        }
    }

    /// Replace the generation service, e.g. one configured with latency
    pub fn with_generation(mut self, build: impl FnOnce(Arc<SimulatedStorage>) -> SimulatedGeneration) -> Self {
        self.generation = Arc::new(build(self.storage.clone()));
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            generation: self.generation.clone(),
            storage: self.storage.clone(),
            interpretation: self.interpretation.clone(),
            media: self.media.clone(),
        }
    }
}

impl Default for SimulatedCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            medium: Medium::Video,
            prompt: prompt.to_string(),
            inputs: vec![],
            duration_seconds: Some(4.0),
            voice: None,
        }
    }

    #[tokio::test]
    async fn test_generation_completes_after_polls() {
        let storage = Arc::new(SimulatedStorage::new());
        let generation = SimulatedGeneration::new(storage.clone()).with_polls_until_done(2);

        let handle = generation.submit(request("sunrise")).await.unwrap();
        assert_eq!(generation.poll(&handle).await.unwrap(), GenerationStatus::Pending);
        let GenerationStatus::Succeeded { result_url } = generation.poll(&handle).await.unwrap() else {
            panic!("expected success");
        };
        assert!(storage.get(&result_url).await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_failures_run_dry() {
        let storage = Arc::new(SimulatedStorage::new());
        let generation = SimulatedGeneration::new(storage);
        generation.inject_submit_failures(
            "scene 2",
            vec![CollaboratorError::Transient("503".to_string())],
        );

        assert!(generation.submit(request("brief (scene 2)")).await.is_err());
        assert!(generation.submit(request("brief (scene 2)")).await.is_ok());
        assert!(generation.submit(request("brief (scene 1)")).await.is_ok());
        assert_eq!(generation.submissions_matching("scene 2"), 2);
    }

    #[tokio::test]
    async fn test_interpretation_pairs_consecutive_assets() {
        let interpretation = SimulatedInterpretation::new();
        let plan = interpretation
            .interpret(InterpretationContext {
                brief: "launch".to_string(),
                asset_urls: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                max_pairs: 2,
            })
            .await
            .unwrap();
        assert_eq!(plan.scenes.len(), 2);
        assert_eq!(plan.scenes[1].first_asset, "b");
        assert_eq!(plan.scenes[1].second_asset, "c");
    }
}
