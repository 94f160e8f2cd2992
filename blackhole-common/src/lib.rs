//! # Blackhole Common Library
//!
//! Shared code for the Blackhole take-ingest services:
//! - Error type shared by storage-facing code
//! - Bootstrap configuration (TOML + environment)
//! - SQLite initialization and the `takes` row model
//! - Timestamp helpers

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use error::{Error, Result};
