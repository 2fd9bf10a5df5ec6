// Core moderation module - probation engine, content checks and room actions.
// Ports (VerdictStore, RoomGateway, MediaSource) live here; infra implements them.

pub mod action_gateway;
pub mod classifier;
pub mod cleanup_queue;
pub mod fallback;
pub mod moderation_models;
pub mod moderation_service;
pub mod polls;
pub mod prompt;
pub mod verdict_store;

pub use action_gateway::{ActionGateway, GatewayError, MediaSource, RetryPolicy, RoomGateway};
pub use classifier::{ClassifierModels, ContentClassifier};
pub use cleanup_queue::CleanupQueue;
pub use fallback::FallbackFilter;
pub use moderation_models::*;
pub use moderation_service::{EngineContext, ModerationService};
pub use verdict_store::{ModerationState, StoreError, VerdictStore};
