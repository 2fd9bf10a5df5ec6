// Matrix layer - sync loop and translation of raw events into core types.

#[path = "dispatcher.rs"]
pub mod dispatcher;

#[path = "events.rs"]
pub mod events;

pub use dispatcher::SyncDispatcher;
