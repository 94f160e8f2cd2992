//! Take session state machine
//!
//! ```text
//! Open ──finalize──> Finalizing ──ok──> Committed
//!  │                    │  ^
//!  abort             exhausted  retry
//!  v                    v  │
//! Aborted             Failed ──operator/reconciler──> Orphaned
//! ```

use blackhole_common::db::TakeStatus;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::lock_table::Lease;
use crate::models::{CommittedTake, TakeDescriptor, TakeHandle};
use crate::scene::{CommittedArtifact, SceneWriter};

/// Whether the state machine allows `from → to`
pub fn can_transition(from: TakeStatus, to: TakeStatus) -> bool {
    use TakeStatus::*;
    matches!(
        (from, to),
        (Open, Finalizing)
            | (Open, Aborted)
            | (Finalizing, Committed)
            | (Finalizing, Failed)
            | (Failed, Finalizing)
            | (Failed, Orphaned)
    )
}

/// Error for an operation the current state does not allow
pub fn state_error(take_id: &str, status: TakeStatus, operation: &str) -> IngestError {
    match status {
        TakeStatus::Finalizing => IngestError::Busy(format!(
            "take '{}' is finalizing; {} not allowed, re-query status",
            take_id, operation
        )),
        other => IngestError::Validation(format!(
            "take '{}' is {}; {} not allowed",
            take_id, other, operation
        )),
    }
}

/// State transition event
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub take_id: String,
    pub old_state: TakeStatus,
    pub new_state: TakeStatus,
    pub transitioned_at: DateTime<Utc>,
}

/// One take's live session (in-memory state)
#[derive(Debug)]
pub struct TakeSession {
    pub session_id: Uuid,
    pub descriptor: TakeDescriptor,
    pub status: TakeStatus,
    /// Held from open until the session leaves Open/Finalizing
    pub lease: Option<Lease>,
    /// Shared with blocking tasks doing file I/O
    pub writer: Arc<Mutex<SceneWriter>>,
    /// Set once the document is durable; a retry skips straight to the row
    pub committed: Option<CommittedArtifact>,
    pub result: Option<CommittedTake>,
    pub last_error: Option<String>,
    pub batches_accepted: u64,
    pub samples_accepted: u64,
    pub gap_warnings: u64,
    pub opened_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TakeSession {
    pub fn new(descriptor: TakeDescriptor, lease: Lease, writer: SceneWriter, session_id: Uuid) -> Self {
        Self {
            session_id,
            descriptor,
            status: TakeStatus::Open,
            lease: Some(lease),
            writer: Arc::new(Mutex::new(writer)),
            committed: None,
            result: None,
            last_error: None,
            batches_accepted: 0,
            samples_accepted: 0,
            gap_warnings: 0,
            opened_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn take_id(&self) -> &str {
        &self.descriptor.take_id
    }

    pub fn handle(&self) -> TakeHandle {
        TakeHandle {
            take_id: self.descriptor.take_id.clone(),
            status: self.status,
            session_id: self.session_id,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: TakeStatus) -> IngestResult<StateTransition> {
        if !can_transition(self.status, new_state) {
            return Err(state_error(
                &self.descriptor.take_id,
                self.status,
                &format!("transition to {}", new_state),
            ));
        }

        let transition = StateTransition {
            session_id: self.session_id,
            take_id: self.descriptor.take_id.clone(),
            old_state: self.status,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.status = new_state;
        self.ended_at = new_state.is_terminal().then_some(transition.transitioned_at);

        tracing::debug!(
            take_id = %transition.take_id,
            from = %transition.old_state,
            to = %transition.new_state,
            "Take state transition"
        );
        Ok(transition)
    }
}

/// Lock a writer, recovering the guard if a blocking task panicked
pub fn lock_writer(writer: &Mutex<SceneWriter>) -> MutexGuard<'_, SceneWriter> {
    writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
