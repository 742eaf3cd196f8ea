//! Registry message bus over Redis pub/sub.

pub mod publisher;
pub mod subscriber;

pub use publisher::{CollectingPublisher, EventPublisher, RedisPublisher};
pub use subscriber::{BusSubscriber, MessageHandler};
