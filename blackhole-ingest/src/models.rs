//! Request, sample and handle types
//!
//! Inbound request structs are what the (external) API layer hands over after
//! parsing; outbound types are what it gets back.

use blackhole_common::db::TakeStatus;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::timecode::{FrameRate, Timecode};

/// Optional lens data carried with a sample
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LensMetadata {
    /// Millimetres
    #[serde(default)]
    pub focal_length: Option<f64>,
    /// Centimetres
    #[serde(default)]
    pub focus_distance: Option<f64>,
    /// Raw encoder units
    #[serde(default)]
    pub zoom: Option<f64>,
    /// Degrees
    #[serde(default)]
    pub fov: Option<f64>,
}

/// Timecode as the tracking hardware reported it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTimecode {
    /// `HH:MM:SS:FF` / `HH:MM:SS;FF`
    Smpte(String),
    /// Absolute frame count since midnight at the batch rate
    Frames(i64),
    /// Seconds since midnight
    Seconds(f64),
}

impl std::fmt::Display for SourceTimecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTimecode::Smpte(tc) => write!(f, "{}", tc),
            SourceTimecode::Frames(frames) => write!(f, "#{}", frames),
            SourceTimecode::Seconds(secs) => write!(f, "{}s", secs),
        }
    }
}

/// One submitted, not yet normalized sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Tracked entity (device) name
    pub entity: String,
    pub timecode: SourceTimecode,
    pub translation: [f64; 3],
    /// Pitch, yaw, roll in degrees
    pub rotation: [f64; 3],
    #[serde(default)]
    pub lens: Option<LensMetadata>,
}

/// Normalized sample with a take-relative frame index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub entity: String,
    pub frame: u64,
    pub translation: [f64; 3],
    pub rotation: [f64; 3],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens: Option<LensMetadata>,
    pub source_timecode: String,
}

/// A batch of samples for one take, possibly unordered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleBatch {
    pub take_id: String,
    /// Rate the hardware sampled at; `None` means the take's declared rate
    #[serde(default)]
    pub rate: Option<FrameRate>,
    pub samples: Vec<RawSample>,
}

/// `OpenTakeRequest{takeId, production, shot, cameraId, fps, startTimecode}`
/// plus the optional slate fields `description`, `map` and `valid`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenTakeRequest {
    pub take_id: String,
    pub production: String,
    pub shot: String,
    pub camera_id: String,
    pub fps: FrameRate,
    #[serde(default = "default_start_timecode")]
    pub start_timecode: String,
    #[serde(default)]
    pub description: String,
    /// Level (map) the take was recorded against
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub valid: bool,
}

fn default_start_timecode() -> String {
    "00:00:00:00".to_string()
}

/// `AppendSamplesRequest{takeId, samples[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendSamplesRequest {
    pub take_id: String,
    #[serde(default)]
    pub rate: Option<FrameRate>,
    pub samples: Vec<RawSample>,
}

impl From<AppendSamplesRequest> for SampleBatch {
    fn from(req: AppendSamplesRequest) -> Self {
        SampleBatch {
            take_id: req.take_id,
            rate: req.rate,
            samples: req.samples,
        }
    }
}

/// `FinalizeRequest{takeId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub take_id: String,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// `AbortRequest{takeId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub take_id: String,
}

/// Validated descriptive fields of a take
#[derive(Debug, Clone, PartialEq)]
pub struct TakeDescriptor {
    pub take_id: String,
    pub production: String,
    pub shot: String,
    pub camera_id: String,
    pub fps: FrameRate,
    pub start_timecode: Timecode,
    pub description: String,
    pub map: String,
    pub valid: bool,
}

impl TakeDescriptor {
    /// Validate an open request; identifiers become path components
    pub fn from_request(req: &OpenTakeRequest) -> IngestResult<Self> {
        validate_identifier("takeId", &req.take_id)?;
        validate_identifier("production", &req.production)?;
        validate_identifier("shot", &req.shot)?;
        if req.camera_id.trim().is_empty() {
            return Err(IngestError::Validation("cameraId must not be empty".to_string()));
        }
        validate_label("cameraId", &req.camera_id)?;
        validate_label("map", &req.map)?;
        validate_text("description", &req.description)?;
        let start_timecode = Timecode::parse(&req.start_timecode, &req.fps)
            .map_err(|e| IngestError::Validation(e.to_string()))?;

        Ok(Self {
            take_id: req.take_id.clone(),
            production: req.production.clone(),
            shot: req.shot.clone(),
            camera_id: req.camera_id.clone(),
            fps: req.fps,
            start_timecode,
            description: req.description.clone(),
            map: req.map.clone(),
            valid: req.valid,
        })
    }

    /// Timecode of a take-relative frame
    pub fn timecode_at(&self, frame: u64) -> Timecode {
        let absolute = self.start_timecode.to_frames(&self.fps) + frame as i64;
        Timecode::from_frames(absolute, &self.fps)
    }
}

/// Free text stored on one line of the document header
fn validate_text(field: &str, value: &str) -> IngestResult<()> {
    if value.chars().any(char::is_control) {
        return Err(IngestError::Validation(format!(
            "{} must not contain control characters",
            field
        )));
    }
    Ok(())
}

/// Single-line label without quotes
fn validate_label(field: &str, value: &str) -> IngestResult<()> {
    validate_text(field, value)?;
    if value.contains('"') {
        return Err(IngestError::Validation(format!("{} '{}' must not contain '\"'", field, value)));
    }
    Ok(())
}

/// Identifiers must be usable as a single path component
pub fn validate_identifier(field: &str, value: &str) -> IngestResult<()> {
    let valid = !value.is_empty()
        && value != "."
        && value != ".."
        && !value.starts_with('.')
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(IngestError::Validation(format!(
            "{} '{}' must be non-empty and use only [A-Za-z0-9._-]",
            field, value
        )))
    }
}

/// Caller's reference to an open session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeHandle {
    pub take_id: String,
    pub status: TakeStatus,
    #[serde(skip)]
    pub session_id: Uuid,
}

/// Result of a successful finalize
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTake {
    pub take_id: String,
    pub status: TakeStatus,
    pub file_path: PathBuf,
    pub checksum: String,
    pub frame_start: u64,
    pub frame_end: u64,
    pub sample_count: u64,
}
