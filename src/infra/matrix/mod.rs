pub mod matrix_client;

pub use matrix_client::{MatrixHttpClient, SyncBatch};
