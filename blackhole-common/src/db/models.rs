//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a take
///
/// Open → Finalizing → Committed is the happy path. Aborted, Committed and
/// Orphaned are terminal for a session; Failed can re-enter Finalizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TakeStatus {
    Open,
    Finalizing,
    Committed,
    Aborted,
    Failed,
    Orphaned,
}

impl TakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TakeStatus::Open => "OPEN",
            TakeStatus::Finalizing => "FINALIZING",
            TakeStatus::Committed => "COMMITTED",
            TakeStatus::Aborted => "ABORTED",
            TakeStatus::Failed => "FAILED",
            TakeStatus::Orphaned => "ORPHANED",
        }
    }

    /// Terminal for the session (the row / file may still be queried)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TakeStatus::Committed | TakeStatus::Aborted | TakeStatus::Orphaned
        )
    }
}

impl fmt::Display for TakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TakeStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TakeStatus::Open),
            "FINALIZING" => Ok(TakeStatus::Finalizing),
            "COMMITTED" => Ok(TakeStatus::Committed),
            "ABORTED" => Ok(TakeStatus::Aborted),
            "FAILED" => Ok(TakeStatus::Failed),
            "ORPHANED" => Ok(TakeStatus::Orphaned),
            other => Err(crate::Error::InvalidInput(format!("Unknown take status: {}", other))),
        }
    }
}

/// One row of the `takes` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeRow {
    pub take_id: String,
    pub production: String,
    pub shot: String,
    pub camera_id: String,
    pub frame_start: i64,
    pub frame_end: i64,
    /// Frame rate label, e.g. "24" or "29.97df"
    pub fps: String,
    /// SMPTE start timecode of the take
    pub start_timecode: String,
    /// SMPTE timecode of the last frame
    pub end_timecode: String,
    pub description: String,
    /// Level the take was recorded against
    pub map: String,
    /// Marked usable by the operator
    pub valid: bool,
    pub sample_count: i64,
    pub entity_count: i64,
    pub file_path: String,
    /// SHA-256 hex of the scene document
    pub checksum: String,
    pub status: TakeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TakeStatus::Open,
            TakeStatus::Finalizing,
            TakeStatus::Committed,
            TakeStatus::Aborted,
            TakeStatus::Failed,
            TakeStatus::Orphaned,
        ] {
            assert_eq!(status.as_str().parse::<TakeStatus>().unwrap(), status);
        }
        assert!("committed".parse::<TakeStatus>().is_err());
    }

    #[test]
    fn test_status_serde_matches_db_form() {
        let json = serde_json::to_string(&TakeStatus::Committed).unwrap();
        assert_eq!(json, "\"COMMITTED\"");
    }

    #[test]
    fn test_failed_is_not_terminal() {
        assert!(!TakeStatus::Failed.is_terminal());
        assert!(!TakeStatus::Finalizing.is_terminal());
        assert!(TakeStatus::Orphaned.is_terminal());
    }
}
