//! blackhole-ingest - camera-tracking take ingestion
//!
//! Records each take as a time-sampled USD scene document and mirrors its
//! metadata into SQLite, keeping the two stores consistent:
//!
//! - `lock_table`: single writer per take id, lease based
//! - `normalizer`: timecodes to take-relative frames, duplicate/gap checks
//! - `scene`: staged, atomically committed scene documents
//! - `recorder` / `repository`: the `takes` row
//! - `session`: the take state machine driving all of the above
//! - `reconciler`: detects and resolves divergence between the stores

pub mod error;
pub mod lock_table;
pub mod models;
pub mod normalizer;
pub mod reconciler;
pub mod recorder;
pub mod repository;
pub mod scene;
pub mod session;
pub mod timecode;
pub mod utils;

pub use crate::error::{ErrorReport, IngestError, IngestResult};

use blackhole_common::config::IngestSettings;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::Arc;

use crate::reconciler::Reconciler;
use crate::repository::{SqliteTakeRepository, TakeRepository};
use crate::session::TakeSessionManager;

/// Session manager and reconciler wired to one database and lock table
pub struct IngestEngine {
    pub pool: SqlitePool,
    pub sessions: Arc<TakeSessionManager>,
    pub reconciler: Reconciler,
}

impl IngestEngine {
    /// Open (or create) the database and build the engine around it
    pub async fn open(
        archive_dir: &Path,
        database_path: &Path,
        settings: IngestSettings,
    ) -> IngestResult<Self> {
        settings.validate()?;
        std::fs::create_dir_all(archive_dir)?;

        let pool = blackhole_common::db::init_database(database_path).await?;
        let repository: Arc<dyn TakeRepository> = Arc::new(SqliteTakeRepository::new(pool.clone()));
        Ok(Self::with_repository(pool, archive_dir, settings, repository))
    }

    /// Build the engine on an existing pool and repository
    pub fn with_repository(
        pool: SqlitePool,
        archive_dir: &Path,
        settings: IngestSettings,
        repository: Arc<dyn TakeRepository>,
    ) -> Self {
        let policy = settings.orphan_policy;
        let sessions = Arc::new(TakeSessionManager::new(archive_dir, settings, repository));
        let reconciler = Reconciler::for_sessions(Arc::clone(&sessions), policy);

        Self {
            pool,
            sessions,
            reconciler,
        }
    }
}
