//! Test Helper Utilities
//!
//! Shared utilities for testing blackhole-ingest

#![allow(dead_code)]

pub mod error_injection;
pub mod samples;

pub use error_injection::FlakyRepository;
pub use samples::{batch, frame_samples, open_request, translate_frames_by_entity};

// Trait methods on `FlakyRepository` (get, scan) need the trait in scope
pub use blackhole_ingest::repository::TakeRepository;

use blackhole_common::config::IngestSettings;
use blackhole_ingest::repository::SqliteTakeRepository;
use blackhole_ingest::IngestEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Engine on a temporary archive and database, with an injectable repository
///
/// `temp_dir` must stay alive for the duration of the test.
pub struct TestHarness {
    pub temp_dir: TempDir,
    pub archive: PathBuf,
    pub repo: Arc<FlakyRepository>,
    pub engine: IngestEngine,
}

/// Settings with short backoffs so retry paths finish quickly
pub fn fast_settings() -> IngestSettings {
    IngestSettings {
        finalize_backoff_ms: 5,
        finalize_backoff_max_ms: 20,
        ..IngestSettings::default()
    }
}

pub async fn harness(settings: IngestSettings) -> TestHarness {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("archive");
    std::fs::create_dir_all(&archive).unwrap();

    let pool = blackhole_common::db::init_database(&temp_dir.path().join("test.db"))
        .await
        .unwrap();
    let repo = Arc::new(FlakyRepository::new(SqliteTakeRepository::new(pool.clone())));
    let dyn_repo: Arc<dyn TakeRepository> = repo.clone();
    let engine = IngestEngine::with_repository(pool, &archive, settings, dyn_repo);

    TestHarness {
        temp_dir,
        archive,
        repo,
        engine,
    }
}

/// Regular files under `dir`, relative, sorted
pub fn files_under(dir: &std::path::Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}
