//! Metadata recorder
//!
//! Mirrors a committed scene document into the metadata store. Must only be
//! called after the document is durable; it never touches the file.

use blackhole_common::db::{TakeRow, TakeStatus};
use blackhole_common::time::now;
use std::sync::Arc;

use crate::error::{IngestError, IngestResult};
use crate::models::TakeDescriptor;
use crate::repository::TakeRepository;
use crate::scene::CommittedArtifact;

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Written,
    /// A Committed row with the same checksum and path already existed
    Unchanged,
}

pub struct MetadataRecorder {
    repository: Arc<dyn TakeRepository>,
}

impl MetadataRecorder {
    pub fn new(repository: Arc<dyn TakeRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<dyn TakeRepository> {
        &self.repository
    }

    /// Insert or update the Committed row for a take
    pub async fn upsert(
        &self,
        descriptor: &TakeDescriptor,
        artifact: &CommittedArtifact,
    ) -> IngestResult<RecordOutcome> {
        let file_path = artifact.path.to_string_lossy().into_owned();

        let existing = self
            .repository
            .get(&descriptor.take_id)
            .await
            .map_err(|e| IngestError::WriteFailure(format!("reading take row: {}", e)))?;

        if let Some(row) = &existing {
            if row.status == TakeStatus::Committed
                && row.checksum == artifact.checksum
                && row.file_path == file_path
            {
                tracing::debug!(take_id = %descriptor.take_id, "Take row already up to date");
                return Ok(RecordOutcome::Unchanged);
            }
        }

        let ts = now();
        let row = TakeRow {
            take_id: descriptor.take_id.clone(),
            production: descriptor.production.clone(),
            shot: descriptor.shot.clone(),
            camera_id: descriptor.camera_id.clone(),
            frame_start: artifact.frame_start as i64,
            frame_end: artifact.frame_end as i64,
            fps: descriptor.fps.to_string(),
            start_timecode: descriptor.start_timecode.to_string(),
            end_timecode: descriptor.timecode_at(artifact.frame_end).to_string(),
            description: descriptor.description.clone(),
            map: descriptor.map.clone(),
            valid: descriptor.valid,
            sample_count: artifact.sample_count as i64,
            entity_count: artifact.entity_count as i64,
            file_path,
            checksum: artifact.checksum.clone(),
            status: TakeStatus::Committed,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(ts),
            updated_at: ts,
        };

        self.repository
            .upsert(&row)
            .await
            .map_err(|e| IngestError::WriteFailure(format!("writing take row: {}", e)))?;

        tracing::info!(
            take_id = %row.take_id,
            checksum = %row.checksum,
            replaced = existing.is_some(),
            "Recorded take metadata"
        );
        Ok(RecordOutcome::Written)
    }
}
