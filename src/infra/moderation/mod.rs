pub mod in_memory_store;
pub mod sqlite_verdict_store;

pub use in_memory_store::InMemoryVerdictStore;
pub use sqlite_verdict_store::SqliteVerdictStore;
