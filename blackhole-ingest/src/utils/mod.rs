//! Utility modules for blackhole-ingest

pub mod retry;

pub use retry::{retry_on_lock, Backoff};
