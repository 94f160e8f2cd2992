//! Consistency reconciler
//!
//! Compares the metadata store with the archive and resolves divergence:
//!
//! - Committed row whose document is missing or has a different checksum:
//!   the row is marked ORPHANED and reported. Nothing is deleted.
//! - Take document with no row: adopted (row re-derived from the document)
//!   or moved under `<archive>/.quarantine/`, per `orphan_policy`.
//!
//! Each take id is leased for the time it is being resolved, and its row is
//! read again under that lease, so a finalize that commits concurrently is
//! never undone. Take ids with a live lease are skipped. A Failed session
//! whose document gets adopted becomes Committed; one whose document gets
//! quarantined becomes Orphaned. Resolved divergence does not reappear, so a
//! second run right after the first reports nothing.

use blackhole_common::config::{IngestSettings, OrphanPolicy};
use blackhole_common::db::{TakeRow, TakeStatus};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{IngestError, IngestResult};
use crate::lock_table::{Lease, LockTable};
use crate::models::TakeDescriptor;
use crate::recorder::MetadataRecorder;
use crate::repository::TakeRepository;
use crate::scene::writer::{staging_take_id, DOCUMENT_EXTENSION, QUARANTINE_DIR, STAGING_DIR};
use crate::scene::{checksum_file, read_summary, CommittedArtifact, SceneSummary};
use crate::session::TakeSessionManager;
use crate::timecode::Timecode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingKind {
    /// Committed row, document absent or unreadable
    MissingFile,
    /// Committed row, document bytes differ
    ChecksumMismatch,
    /// Document without row, row re-derived
    Adopted,
    /// Document without row, moved aside
    Quarantined,
}

/// One resolved divergence
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub kind: FindingKind,
    pub take_id: Option<String>,
    pub path: PathBuf,
    pub moved_to: Option<PathBuf>,
    pub detail: String,
}

impl Finding {
    /// Row-side findings are consistency violations for the operator
    pub fn violation(&self) -> Option<IngestError> {
        match self.kind {
            FindingKind::MissingFile | FindingKind::ChecksumMismatch => {
                Some(IngestError::ConsistencyViolation(format!(
                    "take '{}': {}",
                    self.take_id.as_deref().unwrap_or("?"),
                    self.detail
                )))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub rows_checked: usize,
    pub files_scanned: usize,
    pub findings: Vec<Finding>,
    /// Take ids left alone because a session holds them
    pub skipped_leased: Vec<String>,
    /// Staging directories with no live lease; informational, never removed
    pub stale_staging: Vec<PathBuf>,
}

impl ReconcileReport {
    /// No divergence was found
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn count(&self, kind: FindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }

    pub fn violations(&self) -> Vec<IngestError> {
        self.findings.iter().filter_map(Finding::violation).collect()
    }
}

pub struct Reconciler {
    archive_dir: PathBuf,
    policy: OrphanPolicy,
    repository: Arc<dyn TakeRepository>,
    recorder: MetadataRecorder,
    locks: Arc<LockTable>,
    lease_ttl: Duration,
    /// Live sessions whose Failed takes are settled along with their documents
    sessions: Option<Arc<TakeSessionManager>>,
}

impl Reconciler {
    pub fn new(
        archive_dir: impl Into<PathBuf>,
        policy: OrphanPolicy,
        repository: Arc<dyn TakeRepository>,
        locks: Arc<LockTable>,
    ) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            policy,
            recorder: MetadataRecorder::new(Arc::clone(&repository)),
            repository,
            locks,
            lease_ttl: IngestSettings::default().lease_ttl(),
            sessions: None,
        }
    }

    /// Reconcile against a session manager: share its lock table and lease
    /// TTL, and move its Failed sessions once their documents are resolved
    pub fn for_sessions(sessions: Arc<TakeSessionManager>, policy: OrphanPolicy) -> Self {
        let mut reconciler = Self::new(
            sessions.archive_dir(),
            policy,
            Arc::clone(sessions.repository()),
            Arc::clone(sessions.lock_table()),
        );
        reconciler.lease_ttl = sessions.settings().lease_ttl();
        reconciler.sessions = Some(sessions);
        reconciler
    }

    pub async fn reconcile(&self) -> IngestResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        tracing::info!(archive = %self.archive_dir.display(), policy = ?self.policy, "Reconciling archive");

        let rows = self.repository.scan(None).await?;
        // Documents that rows account for; the file side leaves them alone
        let mut referenced: HashSet<PathBuf> = HashSet::new();

        for row in &rows {
            match row.status {
                TakeStatus::Committed => {
                    report.rows_checked += 1;
                    referenced.insert(PathBuf::from(&row.file_path));
                    let Some(lease) = self.try_lease(&row.take_id, &mut report.skipped_leased)? else {
                        continue;
                    };
                    let verified = self.verify_row(&row.take_id).await;
                    self.locks.release(&lease);
                    if let Some(finding) = verified? {
                        report.findings.push(finding);
                    }
                }
                TakeStatus::Orphaned => {
                    referenced.insert(PathBuf::from(&row.file_path));
                }
                _ => {}
            }
        }

        let archive = self.archive_dir.clone();
        let documents = tokio::task::spawn_blocking(move || find_documents(&archive))
            .await
            .map_err(|e| IngestError::Common(blackhole_common::Error::Internal(e.to_string())))??;
        report.files_scanned = documents.len();

        for path in documents {
            if referenced.contains(&path) {
                continue;
            }
            if let Some(finding) = self.resolve_document(&path, &mut report.skipped_leased).await? {
                report.findings.push(finding);
            }
        }

        report.stale_staging = self.stale_staging()?;
        for dir in &report.stale_staging {
            tracing::warn!(dir = %dir.display(), "Stale staging directory");
        }

        report.skipped_leased.sort();
        report.skipped_leased.dedup();
        tracing::info!(
            rows_checked = report.rows_checked,
            files_scanned = report.files_scanned,
            findings = report.findings.len(),
            skipped = report.skipped_leased.len(),
            stale_staging = report.stale_staging.len(),
            "Reconcile finished"
        );
        Ok(report)
    }

    /// Lease the take id for the time it is being resolved
    ///
    /// `None` if a session holds it; the id is added to `skipped`.
    fn try_lease(&self, take_id: &str, skipped: &mut Vec<String>) -> IngestResult<Option<Lease>> {
        match self.locks.acquire(take_id, self.lease_ttl) {
            Ok(lease) => Ok(Some(lease)),
            Err(IngestError::LockConflict(_)) => {
                tracing::debug!(take_id, "Take is leased, skipping");
                skipped.push(take_id.to_string());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Check one Committed row against its document
    ///
    /// The row is read again under the lease; the scan may be stale.
    async fn verify_row(&self, take_id: &str) -> IngestResult<Option<Finding>> {
        let row: TakeRow = match self.repository.get(take_id).await? {
            Some(row) if row.status == TakeStatus::Committed => row,
            _ => return Ok(None),
        };
        let path = PathBuf::from(&row.file_path);
        let hash_path = path.clone();
        let current = tokio::task::spawn_blocking(move || checksum_file(&hash_path))
            .await
            .map_err(|e| IngestError::Common(blackhole_common::Error::Internal(e.to_string())))?;

        let (kind, detail) = match current {
            Ok(checksum) if checksum == row.checksum => return Ok(None),
            Ok(checksum) => (
                FindingKind::ChecksumMismatch,
                format!("checksum {} does not match recorded {}", checksum, row.checksum),
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                (FindingKind::MissingFile, format!("{} does not exist", path.display()))
            }
            Err(e) => (FindingKind::MissingFile, format!("{} unreadable: {}", path.display(), e)),
        };

        self.repository.set_status(&row.take_id, TakeStatus::Orphaned).await?;
        let finding = Finding {
            kind,
            take_id: Some(row.take_id.clone()),
            path,
            moved_to: None,
            detail,
        };
        if let Some(violation) = finding.violation() {
            tracing::error!(take_id = %row.take_id, error = %violation, "Take row marked ORPHANED");
        }
        Ok(Some(finding))
    }

    /// Adopt or quarantine a document no row accounted for at scan time
    async fn resolve_document(
        &self,
        path: &Path,
        skipped: &mut Vec<String>,
    ) -> IngestResult<Option<Finding>> {
        let summary_path = path.to_path_buf();
        let summary = tokio::task::spawn_blocking(move || read_summary(&summary_path))
            .await
            .map_err(|e| IngestError::Common(blackhole_common::Error::Internal(e.to_string())))?;

        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                return self
                    .quarantine(path, None, format!("not a readable take document: {}", e))
                    .map(Some)
            }
        };

        let Some(lease) = self.try_lease(&summary.header.take_id, skipped)? else {
            return Ok(None);
        };
        let resolved = self.resolve_leased(path, &summary).await;
        self.locks.release(&lease);
        resolved
    }

    /// Resolve a document while holding its take id
    async fn resolve_leased(&self, path: &Path, summary: &SceneSummary) -> IngestResult<Option<Finding>> {
        let take_id = summary.header.take_id.clone();

        // A finalize may have recorded the document since the scan
        let committed_elsewhere = match self.repository.get(&take_id).await? {
            Some(row)
                if matches!(row.status, TakeStatus::Committed | TakeStatus::Orphaned)
                    && Path::new(&row.file_path) == path =>
            {
                tracing::debug!(take_id = %take_id, path = %path.display(), "Document recorded since scan");
                return Ok(None);
            }
            Some(row) if row.status == TakeStatus::Committed => Some(PathBuf::from(row.file_path)),
            _ => None,
        };

        let (finding, adopted) = match (self.policy, committed_elsewhere) {
            (OrphanPolicy::Quarantine, _) => {
                (self.quarantine(path, Some(take_id.clone()), "no committed row".to_string())?, None)
            }
            (OrphanPolicy::Adopt, Some(other)) => {
                let detail = format!("take id already committed at {}", other.display());
                (self.quarantine(path, Some(take_id.clone()), detail)?, None)
            }
            (OrphanPolicy::Adopt, None) => match self.adopt(path, summary).await {
                Ok((finding, artifact)) => (finding, Some(artifact)),
                Err(e) => {
                    let detail = format!("cannot adopt: {}", e);
                    (self.quarantine(path, Some(take_id.clone()), detail)?, None)
                }
            },
        };

        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.settle_failed(&take_id, adopted).await {
                tracing::warn!(take_id = %take_id, error = %e, "Failed to settle session after reconcile");
            }
        }
        Ok(Some(finding))
    }

    async fn adopt(
        &self,
        path: &Path,
        summary: &SceneSummary,
    ) -> IngestResult<(Finding, CommittedArtifact)> {
        let header = &summary.header;
        let start_timecode = Timecode::parse(&header.start_timecode, &header.frame_rate)?;
        let descriptor = TakeDescriptor {
            take_id: header.take_id.clone(),
            production: header.production.clone(),
            shot: header.shot.clone(),
            camera_id: header.camera_id.clone(),
            fps: header.frame_rate,
            start_timecode,
            description: header.description.clone(),
            map: header.map.clone(),
            valid: header.valid,
        };

        let hash_path = path.to_path_buf();
        let checksum = tokio::task::spawn_blocking(move || checksum_file(&hash_path))
            .await
            .map_err(|e| IngestError::Common(blackhole_common::Error::Internal(e.to_string())))??;

        let artifact = CommittedArtifact {
            path: path.to_path_buf(),
            checksum,
            frame_start: header.start_frame,
            frame_end: header.end_frame,
            sample_count: summary.sample_count,
            entity_count: summary.entity_count,
        };
        self.recorder.upsert(&descriptor, &artifact).await?;

        tracing::warn!(take_id = %descriptor.take_id, path = %path.display(), "Adopted orphan take document");
        let finding = Finding {
            kind: FindingKind::Adopted,
            take_id: Some(descriptor.take_id),
            path: path.to_path_buf(),
            moved_to: None,
            detail: format!("row re-derived ({} samples)", summary.sample_count),
        };
        Ok((finding, artifact))
    }

    fn quarantine(&self, path: &Path, take_id: Option<String>, detail: String) -> IngestResult<Finding> {
        let relative = path.strip_prefix(&self.archive_dir).unwrap_or(path);
        let mut target = self.archive_dir.join(QUARANTINE_DIR).join(relative);
        if target.exists() {
            let name = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            target.set_file_name(format!("{}.{}", name, Uuid::new_v4()));
        }

        let moved = target
            .parent()
            .map(fs::create_dir_all)
            .transpose()
            .and_then(|_| fs::rename(path, &target));
        if let Err(e) = moved {
            return Err(IngestError::WriteFailure(format!(
                "quarantining {}: {}",
                path.display(),
                e
            )));
        }

        tracing::warn!(
            take_id = take_id.as_deref().unwrap_or(""),
            from = %path.display(),
            to = %target.display(),
            reason = %detail,
            "Quarantined orphan take document"
        );
        Ok(Finding {
            kind: FindingKind::Quarantined,
            take_id,
            path: path.to_path_buf(),
            moved_to: Some(target),
            detail,
        })
    }

    fn stale_staging(&self) -> IngestResult<Vec<PathBuf>> {
        let root = self.archive_dir.join(STAGING_DIR);
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let held = staging_take_id(&name)
                .map(|take_id| self.locks.is_held(take_id))
                .unwrap_or(false);
            if !held {
                stale.push(entry.path());
            }
        }
        stale.sort();
        Ok(stale)
    }
}

/// Take documents under the archive, excluding staging and quarantine
fn find_documents(archive: &Path) -> IngestResult<Vec<PathBuf>> {
    if !archive.exists() {
        return Ok(Vec::new());
    }

    let mut documents = Vec::new();
    let walker = WalkDir::new(archive).into_iter().filter_entry(|entry| {
        !(entry.depth() == 1
            && entry.file_type().is_dir()
            && matches!(entry.file_name().to_str(), Some(STAGING_DIR) | Some(QUARANTINE_DIR)))
    });
    for entry in walker {
        let entry = entry.map_err(|e| IngestError::Common(blackhole_common::Error::Io(e.into())))?;
        let is_document = entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(DOCUMENT_EXTENSION);
        if is_document {
            documents.push(entry.into_path());
        }
    }
    documents.sort();
    Ok(documents)
}
