pub mod publisher;

pub use publisher::{EventPublisher, JobEvents, PublishedEvent};
