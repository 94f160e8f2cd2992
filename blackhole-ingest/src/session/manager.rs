//! Take session manager
//!
//! Owns the live sessions and drives each through the take state machine.
//! Every session sits behind its own `tokio::sync::Mutex`, so calls for one
//! take are serialized while different takes run in parallel. File I/O runs
//! on the blocking pool.
//!
//! Finalize runs as a spawned task: commit the document, then upsert the row,
//! each step retried with backoff. The task renews the take's lease while it
//! works, so the reconciler never sees a half-recorded take as unowned. A caller whose deadline elapses gets
//! `Timeout` while the task keeps going, so a half-written artifact is never
//! left behind.

use blackhole_common::config::IngestSettings;
use blackhole_common::db::TakeStatus;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::state::{lock_writer, state_error, TakeSession};
use crate::error::{IngestError, IngestResult};
use crate::lock_table::{Lease, LockTable};
use crate::models::{CommittedTake, OpenTakeRequest, SampleBatch, TakeDescriptor, TakeHandle};
use crate::normalizer::{normalize, GapWarning, NormalizedBatch, NormalizerConfig};
use crate::recorder::MetadataRecorder;
use crate::repository::TakeRepository;
use crate::scene::{checksum_file, CommittedArtifact, SceneWriter};
use crate::utils::Backoff;

type SessionRef = Arc<tokio::sync::Mutex<TakeSession>>;

/// Result of an accepted batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendOutcome {
    pub take_id: String,
    pub accepted: usize,
    pub overwritten: usize,
    /// Samples dropped or replaced because resampling put two on one frame
    pub collapsed: usize,
    pub resampled: bool,
    /// Distinct (entity, frame) samples held for the take so far
    pub total_samples: u64,
    pub gap_warnings: Vec<GapWarning>,
}

/// Status as seen by a caller polling a take
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeStatusReport {
    pub take_id: String,
    pub status: TakeStatus,
    /// A session exists in this process and has not reached a terminal state
    pub live: bool,
    pub samples: u64,
    pub file_path: Option<PathBuf>,
    pub checksum: Option<String>,
    pub last_error: Option<String>,
}

fn join_error(err: tokio::task::JoinError) -> IngestError {
    IngestError::Common(blackhole_common::Error::Internal(format!(
        "Ingest task failed: {}",
        err
    )))
}

async fn discard_writer(writer: Arc<Mutex<SceneWriter>>) -> IngestResult<()> {
    tokio::task::spawn_blocking(move || lock_writer(&writer).discard())
        .await
        .map_err(join_error)?
}

async fn orphan(s: &mut TakeSession) -> IngestResult<()> {
    s.transition_to(TakeStatus::Orphaned)?;
    let take_id = s.descriptor.take_id.clone();
    if let Err(e) = discard_writer(s.writer.clone()).await {
        tracing::warn!(take_id = %take_id, error = %e, "Failed to remove staging of orphaned take");
    }
    tracing::warn!(
        take_id = %take_id,
        committed = s.committed.is_some(),
        last_error = s.last_error.as_deref().unwrap_or(""),
        "Take marked ORPHANED"
    );
    Ok(())
}

fn committed_take(take_id: &str, artifact: &CommittedArtifact) -> CommittedTake {
    CommittedTake {
        take_id: take_id.to_string(),
        status: TakeStatus::Committed,
        file_path: artifact.path.clone(),
        checksum: artifact.checksum.clone(),
        frame_start: artifact.frame_start,
        frame_end: artifact.frame_end,
        sample_count: artifact.sample_count,
    }
}

fn check_handle(session: &TakeSession, handle: &TakeHandle) -> IngestResult<()> {
    if session.session_id != handle.session_id {
        return Err(IngestError::NotFound(format!(
            "stale handle for take '{}'",
            handle.take_id
        )));
    }
    Ok(())
}

/// Live take sessions plus the shared lock table
pub struct TakeSessionManager {
    archive_dir: PathBuf,
    settings: IngestSettings,
    locks: Arc<LockTable>,
    recorder: Arc<MetadataRecorder>,
    sessions: Mutex<HashMap<String, SessionRef>>,
}

impl TakeSessionManager {
    pub fn new(
        archive_dir: impl Into<PathBuf>,
        settings: IngestSettings,
        repository: Arc<dyn TakeRepository>,
    ) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            settings,
            locks: Arc::new(LockTable::new()),
            recorder: Arc::new(MetadataRecorder::new(repository)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Share an existing lock table (e.g. with a reconciler)
    pub fn with_lock_table(mut self, locks: Arc<LockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn repository(&self) -> &Arc<dyn TakeRepository> {
        self.recorder.repository()
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionRef>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, take_id: &str) -> IngestResult<SessionRef> {
        self.sessions()
            .get(take_id)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(format!("no session for take '{}'", take_id)))
    }

    /// Start a new take; `LockConflict` if another session holds the id
    pub async fn open_take(&self, request: OpenTakeRequest) -> IngestResult<TakeHandle> {
        let descriptor = TakeDescriptor::from_request(&request)?;
        let take_id = descriptor.take_id.clone();
        let lease = self.locks.acquire(&take_id, self.settings.lease_ttl())?;

        if let Ok(previous) = self.lookup(&take_id) {
            let mut prev = previous.lock().await;
            match prev.status {
                TakeStatus::Open => {
                    // Only reachable once the previous holder's lease expired
                    tracing::warn!(
                        take_id = %take_id,
                        session_id = %prev.session_id,
                        "Superseding session with expired lease"
                    );
                    prev.transition_to(TakeStatus::Aborted)?;
                    prev.lease = None;
                    if let Err(e) = discard_writer(prev.writer.clone()).await {
                        tracing::warn!(take_id = %take_id, error = %e, "Failed to discard superseded staging");
                    }
                }
                TakeStatus::Finalizing | TakeStatus::Failed => {
                    self.locks.release(&lease);
                    return Err(state_error(&take_id, prev.status, "open"));
                }
                _ => {}
            }
        }

        let session_id = Uuid::new_v4();
        let writer = SceneWriter::new(
            &self.archive_dir,
            descriptor.clone(),
            session_id,
            self.settings.staging_chunk_samples,
        )
        .with_max_fan_in(self.settings.staging_merge_fan_in);
        let session = TakeSession::new(descriptor, lease, writer, session_id);
        let handle = session.handle();

        tracing::info!(
            take_id = %take_id,
            session_id = %session_id,
            production = %session.descriptor.production,
            shot = %session.descriptor.shot,
            fps = %session.descriptor.fps,
            start_timecode = %session.descriptor.start_timecode,
            "Opened take"
        );
        self.sessions()
            .insert(take_id, Arc::new(tokio::sync::Mutex::new(session)));
        Ok(handle)
    }

    /// Normalize and stage a batch; on any error nothing is merged
    pub async fn append_samples(
        &self,
        handle: &TakeHandle,
        batch: SampleBatch,
    ) -> IngestResult<AppendOutcome> {
        if batch.take_id != handle.take_id {
            return Err(IngestError::Validation(format!(
                "batch for take '{}' submitted on handle for '{}'",
                batch.take_id, handle.take_id
            )));
        }

        let session = self.lookup(&handle.take_id)?;
        let mut s = session.lock().await;
        check_handle(&s, handle)?;
        if s.status != TakeStatus::Open {
            return Err(state_error(&handle.take_id, s.status, "append"));
        }
        let lease = s
            .lease
            .as_ref()
            .ok_or_else(|| IngestError::LockConflict(handle.take_id.clone()))?;
        let renewed = self.locks.renew(lease)?;
        s.lease = Some(renewed);

        let writer = s.writer.clone();
        let rate = s.descriptor.fps;
        let start = s.descriptor.start_timecode;
        let config = NormalizerConfig::from(&self.settings);

        let outcome = tokio::task::spawn_blocking(move || -> IngestResult<AppendOutcome> {
            let mut writer = lock_writer(&writer);
            let NormalizedBatch {
                samples,
                overwritten,
                collapsed,
                warnings,
                resampled,
                sources,
            } = normalize(&batch, &rate, &start, writer.ledger(), &config)?;
            let accepted = samples.len();
            writer.append(samples);
            writer.record_sources(sources);

            Ok(AppendOutcome {
                take_id: batch.take_id,
                accepted,
                overwritten,
                collapsed,
                resampled,
                total_samples: writer.ledger().len() as u64,
                gap_warnings: warnings,
            })
        })
        .await
        .map_err(join_error)?;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::info!(take_id = %handle.take_id, error = %e, "Rejected sample batch");
                return Err(e);
            }
        };

        s.batches_accepted += 1;
        s.samples_accepted = outcome.total_samples;
        s.gap_warnings += outcome.gap_warnings.len() as u64;

        tracing::debug!(
            take_id = %handle.take_id,
            accepted = outcome.accepted,
            overwritten = outcome.overwritten,
            collapsed = outcome.collapsed,
            total = outcome.total_samples,
            "Appended sample batch"
        );
        Ok(outcome)
    }

    /// Commit the document and record the row
    ///
    /// `deadline` defaults to `finalize_timeout_ms`. On `Timeout` the commit
    /// is still running; poll `status`.
    pub async fn finalize_take(
        &self,
        handle: &TakeHandle,
        deadline: Option<Duration>,
    ) -> IngestResult<CommittedTake> {
        let session = self.lookup(&handle.take_id)?;
        {
            let mut s = session.lock().await;
            check_handle(&s, handle)?;
            match (s.status, &s.result) {
                (TakeStatus::Committed, Some(result)) => return Ok(result.clone()),
                (TakeStatus::Open, _) => {}
                (other, _) => return Err(state_error(&handle.take_id, other, "finalize")),
            }
            if lock_writer(&s.writer).ledger().is_empty() {
                return Err(IngestError::Validation(format!(
                    "take '{}' has no samples",
                    handle.take_id
                )));
            }

            let lease = s
                .lease
                .as_ref()
                .ok_or_else(|| IngestError::LockConflict(handle.take_id.clone()))?;
            let renewed = self.locks.renew(lease)?;
            s.lease = Some(renewed);
            s.transition_to(TakeStatus::Finalizing)?;
        }

        self.run_finalize(&handle.take_id, session, deadline).await
    }

    /// Re-enter Finalizing from Failed
    pub async fn retry_finalize(
        &self,
        take_id: &str,
        deadline: Option<Duration>,
    ) -> IngestResult<CommittedTake> {
        let session = self.lookup(take_id)?;
        {
            let mut s = session.lock().await;
            if s.status != TakeStatus::Failed {
                return Err(state_error(take_id, s.status, "retry finalize"));
            }
            let lease = self.locks.acquire(take_id, self.settings.lease_ttl())?;

            // The document may have been touched since the failed attempt
            if let Some(artifact) = s.committed.clone() {
                let path = artifact.path.clone();
                let current = tokio::task::spawn_blocking(move || checksum_file(&path))
                    .await
                    .map_err(join_error)?;
                if current.ok().as_deref() != Some(artifact.checksum.as_str()) {
                    tracing::warn!(take_id, path = %artifact.path.display(), "Committed document changed, recommitting");
                    s.committed = None;
                }
            }

            s.lease = Some(lease);
            s.transition_to(TakeStatus::Finalizing)?;
        }

        tracing::info!(take_id, "Retrying finalize");
        self.run_finalize(take_id, session, deadline).await
    }

    async fn run_finalize(
        &self,
        take_id: &str,
        session: SessionRef,
        deadline: Option<Duration>,
    ) -> IngestResult<CommittedTake> {
        let task = FinalizeTask {
            session,
            locks: Arc::clone(&self.locks),
            recorder: Arc::clone(&self.recorder),
            settings: self.settings.clone(),
        };
        let join = tokio::spawn(task.run());

        let deadline = deadline.unwrap_or_else(|| self.settings.finalize_timeout());
        match tokio::time::timeout(deadline, join).await {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => {
                tracing::warn!(
                    take_id,
                    deadline_ms = deadline.as_millis() as u64,
                    "Finalize deadline elapsed, commit continues in background"
                );
                Err(IngestError::Timeout(take_id.to_string()))
            }
        }
    }

    /// Abandon an open take; staged data is removed, committed files are not
    pub async fn abort_take(&self, handle: &TakeHandle) -> IngestResult<TakeHandle> {
        let session = self.lookup(&handle.take_id)?;
        let mut s = session.lock().await;
        check_handle(&s, handle)?;
        s.transition_to(TakeStatus::Aborted)?;

        if let Some(lease) = s.lease.take() {
            self.locks.release(&lease);
        }
        if let Err(e) = discard_writer(s.writer.clone()).await {
            tracing::warn!(take_id = %handle.take_id, error = %e, "Failed to remove staging after abort");
        }

        tracing::info!(take_id = %handle.take_id, samples = s.samples_accepted, "Aborted take");
        Ok(s.handle())
    }

    /// Operator resolution of a Failed take
    ///
    /// Staged data is dropped. A document that was already committed stays
    /// where it is for the reconciler to adopt or quarantine.
    pub async fn mark_orphaned(&self, take_id: &str) -> IngestResult<TakeHandle> {
        let session = self.lookup(take_id)?;
        let mut s = session.lock().await;
        orphan(&mut s).await?;
        Ok(s.handle())
    }

    /// Reconciler resolution of a Failed take's document
    ///
    /// `adopted` is the artifact now recorded for the take: the session
    /// completes as Committed. Without it the document was quarantined and
    /// the session becomes Orphaned. Sessions that are absent or not Failed
    /// are left alone and `None` is returned.
    pub async fn settle_failed(
        &self,
        take_id: &str,
        adopted: Option<CommittedArtifact>,
    ) -> IngestResult<Option<TakeHandle>> {
        let Ok(session) = self.lookup(take_id) else {
            return Ok(None);
        };
        let mut s = session.lock().await;
        if s.status != TakeStatus::Failed {
            return Ok(None);
        }

        match adopted {
            Some(artifact) => {
                // Failed -> Finalizing -> Committed under one guard
                s.transition_to(TakeStatus::Finalizing)?;
                s.transition_to(TakeStatus::Committed)?;
                s.result = Some(committed_take(take_id, &artifact));
                s.committed = Some(artifact);
                s.last_error = None;
                if let Err(e) = discard_writer(s.writer.clone()).await {
                    tracing::warn!(take_id, error = %e, "Failed to remove staging of adopted take");
                }
                tracing::info!(take_id, "Failed take completed by adoption");
            }
            None => orphan(&mut s).await?,
        }
        Ok(Some(s.handle()))
    }

    /// Current handle of the take's session
    pub async fn handle(&self, take_id: &str) -> IngestResult<TakeHandle> {
        let session = self.lookup(take_id)?;
        let s = session.lock().await;
        Ok(s.handle())
    }

    /// Live session state, falling back to the metadata row
    pub async fn status(&self, take_id: &str) -> IngestResult<TakeStatusReport> {
        let session_report = match self.lookup(take_id) {
            Ok(session) => {
                let s = session.lock().await;
                Some(TakeStatusReport {
                    take_id: take_id.to_string(),
                    status: s.status,
                    live: !s.status.is_terminal(),
                    samples: s.samples_accepted,
                    file_path: s.committed.as_ref().map(|a| a.path.clone()),
                    checksum: s.committed.as_ref().map(|a| a.checksum.clone()),
                    last_error: s.last_error.clone(),
                })
            }
            Err(_) => None,
        };

        if let Some(report) = &session_report {
            if report.live || report.status == TakeStatus::Committed {
                return Ok(report.clone());
            }
        }

        match self.repository().get(take_id).await? {
            Some(row) => Ok(TakeStatusReport {
                take_id: row.take_id,
                status: row.status,
                live: false,
                samples: row.sample_count.max(0) as u64,
                file_path: Some(PathBuf::from(row.file_path)),
                checksum: Some(row.checksum),
                last_error: None,
            }),
            None => session_report
                .ok_or_else(|| IngestError::NotFound(format!("unknown take '{}'", take_id))),
        }
    }
}

/// Commit + upsert with bounded retries, run detached from the caller
struct FinalizeTask {
    session: SessionRef,
    locks: Arc<LockTable>,
    recorder: Arc<MetadataRecorder>,
    settings: IngestSettings,
}

impl FinalizeTask {
    async fn run(self) -> IngestResult<CommittedTake> {
        let (descriptor, writer, mut committed, lease) = {
            let s = self.session.lock().await;
            (s.descriptor.clone(), s.writer.clone(), s.committed.clone(), s.lease.clone())
        };
        let take_id = descriptor.take_id.clone();

        let mut backoff = Backoff::from_millis(
            self.settings.finalize_backoff_ms,
            self.settings.finalize_backoff_max_ms,
        );
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            let pass = self.attempt(&descriptor, &writer, &mut committed);
            match self.keep_lease(lease.as_ref(), pass).await {
                Ok(artifact) => break Ok(artifact),
                Err(e) if !is_transient(&e) || attempt > self.settings.max_finalize_retries => {
                    break Err(e)
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        take_id = %take_id,
                        attempt,
                        committed = committed.is_some(),
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Finalize attempt failed, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    if let Some(lease) = &lease {
                        if let Err(e) = self.locks.renew(lease) {
                            break Err(e);
                        }
                    }
                }
            }
        };

        let mut s = self.session.lock().await;
        s.committed = committed;
        let held = s.lease.take();

        match outcome {
            Ok(artifact) => {
                s.transition_to(TakeStatus::Committed)?;
                let result = committed_take(&take_id, &artifact);
                s.result = Some(result.clone());
                s.last_error = None;
                if let Some(lease) = held {
                    self.locks.release(&lease);
                }
                if let Err(e) = discard_writer(writer).await {
                    tracing::warn!(take_id = %take_id, error = %e, "Failed to remove staging after commit");
                }

                tracing::info!(
                    take_id = %take_id,
                    attempts = attempt,
                    path = %artifact.path.display(),
                    samples = artifact.sample_count,
                    "Take committed"
                );
                Ok(result)
            }
            Err(e) => {
                s.transition_to(TakeStatus::Failed)?;
                s.last_error = Some(e.to_string());
                if let Some(lease) = held {
                    self.locks.release(&lease);
                }

                tracing::error!(
                    take_id = %take_id,
                    attempts = attempt,
                    file_committed = s.committed.is_some(),
                    error = %e,
                    "Finalize failed, take marked FAILED"
                );
                Err(match e {
                    IngestError::WriteFailure(_) => e,
                    other => IngestError::WriteFailure(other.to_string()),
                })
            }
        }
    }

    /// Drive `work` to completion, renewing the lease every third of its TTL
    async fn keep_lease<T>(&self, lease: Option<&Lease>, work: impl Future<Output = T>) -> T {
        let Some(lease) = lease else {
            return work.await;
        };
        let mut ticker = tokio::time::interval((lease.ttl / 3).max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        tokio::pin!(work);
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticker.tick() => {
                    if let Err(e) = self.locks.renew(lease) {
                        tracing::warn!(take_id = %lease.take_id, error = %e, "Failed to renew lease during finalize");
                    }
                }
            }
        }
    }

    /// One pass: commit unless already durable, then record the row
    async fn attempt(
        &self,
        descriptor: &TakeDescriptor,
        writer: &Arc<Mutex<SceneWriter>>,
        committed: &mut Option<CommittedArtifact>,
    ) -> IngestResult<CommittedArtifact> {
        let artifact = match committed {
            Some(artifact) => artifact.clone(),
            None => {
                let writer = Arc::clone(writer);
                let artifact = tokio::task::spawn_blocking(move || lock_writer(&writer).commit())
                    .await
                    .map_err(join_error)??;
                *committed = Some(artifact.clone());
                artifact
            }
        };

        self.recorder.upsert(descriptor, &artifact).await?;
        Ok(artifact)
    }
}

fn is_transient(err: &IngestError) -> bool {
    matches!(err, IngestError::WriteFailure(_) | IngestError::Common(_))
}
