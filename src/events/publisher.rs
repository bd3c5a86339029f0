//! Broadcast channel for run, batch and task lifecycle events.
//!
//! Every event names the job it belongs to so that a caller watching one run
//! can use [`EventPublisher::subscribe_job`] instead of filtering the shared
//! stream itself.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;

/// A lifecycle event as seen by subscribers
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: String,
    /// Owning job, taken from the context's `job_id` or derived from its `task_id`
    pub job_id: Option<String>,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl PublishedEvent {
    fn new(name: String, context: Value) -> Self {
        let job_id = context
            .get("job_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| {
                // Task ids are `<job_id>:<kind>[:<discriminator>]`
                context
                    .get("task_id")
                    .and_then(Value::as_str)
                    .and_then(|id| id.split(':').next())
                    .map(str::to_string)
            });
        Self {
            name,
            job_id,
            context,
            published_at: Utc::now(),
        }
    }

    pub fn belongs_to(&self, job_id: &str) -> bool {
        self.job_id.as_deref() == Some(job_id)
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

impl EventPublisher {
    /// `capacity` is the per-subscriber backlog; slow subscribers lose the oldest events
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Fire and forget. Nobody listening is not an error.
    pub fn publish(&self, event_name: impl Into<String>, context: Value) {
        let event = PublishedEvent::new(event_name.into(), context);
        trace!(event = %event.name, job_id = ?event.job_id, "Publishing lifecycle event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Events of a single job, in publication order
    pub fn subscribe_job(&self, job_id: impl Into<String>) -> JobEvents {
        JobEvents {
            job_id: job_id.into(),
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Receiver filtered to one job
#[derive(Debug)]
pub struct JobEvents {
    job_id: String,
    receiver: broadcast::Receiver<PublishedEvent>,
    missed: u64,
}

impl JobEvents {
    /// Next event for this job, or `None` once the publisher is gone.
    /// Events dropped because the subscriber lagged are counted in [`missed`](Self::missed).
    pub async fn recv(&mut self) -> Option<PublishedEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.belongs_to(&self.job_id) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => self.missed += skipped,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events on the shared channel this receiver never saw
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let publisher = EventPublisher::new(8);
        publisher.publish("task.completed", json!({"task_id": "job:collect-assets"}));
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_job_id_is_derived_from_task_id() {
        let publisher = EventPublisher::new(8);
        let mut receiver = publisher.subscribe();
        publisher.publish("task.claimed", json!({"task_id": "job-7:generate-subclip:2"}));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.job_id.as_deref(), Some("job-7"));
        assert!(event.belongs_to("job-7"));
    }

    #[tokio::test]
    async fn test_job_subscription_skips_other_jobs() {
        let publisher = EventPublisher::new(8);
        let mut events = publisher.subscribe_job("job-2");
        publisher.publish("run.created", json!({"job_id": "job-1"}));
        publisher.publish("run.created", json!({"job_id": "job-2"}));
        publisher.publish("task.ready", json!({"task_id": "job-2:collect-assets"}));

        assert_eq!(events.recv().await.unwrap().name, "run.created");
        let ready = events.recv().await.unwrap();
        assert_eq!(ready.name, "task.ready");
        assert_eq!(ready.context["task_id"], "job-2:collect-assets");
        assert_eq!(events.missed(), 0);
    }

    #[tokio::test]
    async fn test_lagging_job_subscriber_counts_missed_events() {
        let publisher = EventPublisher::new(2);
        let mut events = publisher.subscribe_job("job-1");
        for i in 0..5 {
            publisher.publish("task.ready", json!({"job_id": "job-1", "n": i}));
        }

        let first = events.recv().await.unwrap();
        assert_eq!(first.context["n"], 3);
        assert_eq!(events.missed(), 3);
    }

    #[tokio::test]
    async fn test_closed_publisher_ends_job_stream() {
        let publisher = EventPublisher::new(4);
        let mut events = publisher.subscribe_job("job-1");
        drop(publisher);
        assert!(events.recv().await.is_none());
    }
}
