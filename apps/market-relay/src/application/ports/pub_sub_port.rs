//! Publish/Subscribe Port (Driven Port)
//!
//! Topic-based distribution of canonical records. A durable broker bridge or
//! the in-process bus can sit behind it; the normalizers only publish and the
//! consumers only subscribe.

use tokio::sync::broadcast;

/// Port for topic publish/subscribe.
pub trait PubSub<T>: Send + Sync {
    /// Publish a record on a topic. Returns the number of receivers reached.
    fn publish(&self, topic: &str, record: T) -> usize;

    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<T>;
}
