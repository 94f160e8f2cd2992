//! Timecode normalizer
//!
//! Turns a submitted batch into take-relative, per-entity ordered samples.
//! `normalize` is pure: it reads the frames already accepted for the take but
//! never mutates anything, so a rejected batch leaves the take untouched.
//!
//! Resampling to a lower rate maps several source samples onto one frame.
//! Such collisions are not duplicates: the sample whose source instant is
//! nearest the frame's instant is kept (ties keep the earlier one). Two
//! samples with the same source instant are duplicates and follow the
//! duplicate policy.

use blackhole_common::config::{DuplicateFramePolicy, FpsMismatchPolicy, IngestSettings};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{IngestError, IngestResult};
use crate::models::{RawSample, Sample, SampleBatch, SourceTimecode};
use crate::timecode::{FrameRate, Timecode};

/// Normalizer policies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerConfig {
    pub fps_mismatch_policy: FpsMismatchPolicy,
    pub duplicate_frame_policy: DuplicateFramePolicy,
    pub gap_warning_threshold_frames: u64,
}

impl From<&IngestSettings> for NormalizerConfig {
    fn from(settings: &IngestSettings) -> Self {
        Self {
            fps_mismatch_policy: settings.fps_mismatch_policy,
            duplicate_frame_policy: settings.duplicate_frame_policy,
            gap_warning_threshold_frames: settings.gap_warning_threshold_frames,
        }
    }
}

/// Exact source time of a sample, in seconds as `numer / denom`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInstant {
    numer: i128,
    denom: i128,
}

impl SourceInstant {
    /// Instant of `frames` counted at `rate`
    pub fn new(frames: i64, rate: &FrameRate) -> Self {
        Self {
            numer: frames as i128 * rate.den as i128,
            denom: rate.num as i128,
        }
    }

    pub fn same_instant(&self, other: &SourceInstant) -> bool {
        self.numer * other.denom == other.numer * self.denom
    }

    /// Distance to frame `frame` at `rate`, as an unreduced ratio
    fn distance_to(&self, frame: i64, rate: &FrameRate) -> (i128, i128) {
        let target = frame as i128 * rate.den as i128 * self.denom;
        let numer = (self.numer * rate.num as i128 - target).abs();
        (numer, self.denom * rate.num as i128)
    }

    /// Strictly closer than `other` to `frame` at `rate`
    pub fn nearer_than(&self, other: &SourceInstant, frame: i64, rate: &FrameRate) -> bool {
        let (a, b) = self.distance_to(frame, rate);
        let (c, d) = other.distance_to(frame, rate);
        a * d < c * b
    }
}

/// Where a resampled frame's sample came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResampledSource {
    pub entity: String,
    pub frame: u64,
    pub instant: SourceInstant,
}

/// Frame indices accepted so far, per entity
///
/// Frames produced by resampling also remember their source instant, which
/// tells a folded-together neighbour apart from a resubmitted sample.
#[derive(Debug, Clone, Default)]
pub struct FrameLedger {
    frames: HashMap<String, BTreeSet<u64>>,
    sources: HashMap<String, HashMap<u64, SourceInstant>>,
}

impl FrameLedger {
    pub fn contains(&self, entity: &str, frame: u64) -> bool {
        self.frames
            .get(entity)
            .map(|set| set.contains(&frame))
            .unwrap_or(false)
    }

    /// Returns false if the frame was already present
    pub fn insert(&mut self, entity: &str, frame: u64) -> bool {
        self.frames.entry(entity.to_string()).or_default().insert(frame)
    }

    pub fn set_source(&mut self, source: ResampledSource) {
        self.sources
            .entry(source.entity)
            .or_default()
            .insert(source.frame, source.instant);
    }

    /// Source instant of a resampled frame
    pub fn source(&self, entity: &str, frame: u64) -> Option<SourceInstant> {
        self.sources.get(entity)?.get(&frame).copied()
    }

    fn predecessor(&self, entity: &str, frame: u64) -> Option<u64> {
        self.frames.get(entity)?.range(..frame).next_back().copied()
    }

    fn successor(&self, entity: &str, frame: u64) -> Option<u64> {
        self.frames.get(entity)?.range(frame + 1..).next().copied()
    }

    /// Distinct (entity, frame) pairs
    pub fn len(&self) -> usize {
        self.frames.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entity_count(&self) -> usize {
        self.frames.len()
    }

    /// Lowest and highest frame over all entities
    pub fn frame_range(&self) -> Option<(u64, u64)> {
        let start = self.frames.values().filter_map(|s| s.first()).min()?;
        let end = self.frames.values().filter_map(|s| s.last()).max()?;
        Some((*start, *end))
    }
}

/// Missing frames between two accepted samples of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GapWarning {
    pub entity: String,
    pub after_frame: u64,
    pub before_frame: u64,
    pub missing: u64,
}

/// Batch ready to merge
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    /// Sorted by (entity, frame), one sample per pair
    pub samples: Vec<Sample>,
    /// Samples that replaced an earlier one (overwrite policy)
    pub overwritten: usize,
    /// Samples that resampling folded onto an already-taken frame; only the
    /// one nearest the frame's instant is kept
    pub collapsed: usize,
    pub warnings: Vec<GapWarning>,
    pub resampled: bool,
    /// Source instants of the resampled samples in `samples`
    pub sources: Vec<ResampledSource>,
}

/// Normalize a batch against the take's rate, start timecode and accepted frames
pub fn normalize(
    batch: &SampleBatch,
    take_rate: &FrameRate,
    start: &Timecode,
    ledger: &FrameLedger,
    config: &NormalizerConfig,
) -> IngestResult<NormalizedBatch> {
    let batch_rate = batch.rate.unwrap_or(*take_rate);
    let resample = !batch_rate.same_rate(take_rate);
    if resample && config.fps_mismatch_policy == FpsMismatchPolicy::Reject {
        return Err(IngestError::RateMismatch {
            declared: take_rate.to_string(),
            batch: batch_rate.to_string(),
        });
    }

    let start_frames = start.to_frames(take_rate);
    let overwrite = config.duplicate_frame_policy == DuplicateFramePolicy::Overwrite;

    let mut accepted: BTreeMap<(String, u64), Sample> = BTreeMap::new();
    let mut instants: HashMap<(String, u64), SourceInstant> = HashMap::new();
    let mut overwritten = 0usize;
    let mut collapsed = 0usize;

    for (index, raw) in batch.samples.iter().enumerate() {
        validate_sample(index, raw)?;

        let source = source_frames(index, raw, &batch_rate)?;
        let (absolute, instant) = if resample {
            (
                take_rate.resample_from(source, &batch_rate),
                Some(SourceInstant::new(source, &batch_rate)),
            )
        } else {
            (source, None)
        };

        let relative = absolute - start_frames;
        if relative < 0 {
            return Err(IngestError::SchemaInvalid(format!(
                "sample {} ({}) precedes the take start {}",
                index, raw.timecode, start
            )));
        }
        let frame = relative as u64;

        let already_accepted = ledger.contains(&raw.entity, frame);
        let key = (raw.entity.clone(), frame);
        let in_batch = accepted.contains_key(&key);
        let sample = Sample {
            entity: raw.entity.clone(),
            frame,
            translation: raw.translation,
            rotation: raw.rotation,
            lens: raw.lens,
            source_timecode: raw.timecode.to_string(),
        };

        if let Some(instant) = instant {
            // The sample already holding this frame, and when it was taken
            let holder = if in_batch {
                instants.get(&key).copied()
            } else if already_accepted {
                Some(
                    ledger
                        .source(&raw.entity, frame)
                        .unwrap_or_else(|| SourceInstant::new(absolute, take_rate)),
                )
            } else {
                None
            };
            if let Some(holder) = holder.filter(|h| !h.same_instant(&instant)) {
                collapsed += 1;
                if instant.nearer_than(&holder, absolute, take_rate) {
                    instants.insert(key.clone(), instant);
                    accepted.insert(key, sample);
                }
                continue;
            }
        }

        if (already_accepted || in_batch) && !overwrite {
            return Err(IngestError::SchemaInvalid(format!(
                "duplicate frame {} for entity '{}' (sample {})",
                frame, raw.entity, index
            )));
        }
        if already_accepted || in_batch {
            overwritten += 1;
        }

        if let Some(instant) = instant {
            instants.insert(key.clone(), instant);
        }
        accepted.insert(key, sample);
    }

    let samples: Vec<Sample> = accepted.into_values().collect();
    let warnings = detect_gaps(&samples, ledger, config.gap_warning_threshold_frames);
    for warning in &warnings {
        tracing::warn!(
            take_id = %batch.take_id,
            entity = %warning.entity,
            after_frame = warning.after_frame,
            before_frame = warning.before_frame,
            missing = warning.missing,
            "Gap in tracking samples"
        );
    }

    if collapsed > 0 {
        tracing::debug!(
            take_id = %batch.take_id,
            collapsed,
            batch_rate = %batch_rate,
            take_rate = %take_rate,
            "Resampling folded samples onto shared frames"
        );
    }

    let mut sources: Vec<ResampledSource> = instants
        .into_iter()
        .map(|((entity, frame), instant)| ResampledSource {
            entity,
            frame,
            instant,
        })
        .collect();
    sources.sort_by(|a, b| (&a.entity, a.frame).cmp(&(&b.entity, b.frame)));

    Ok(NormalizedBatch {
        samples,
        overwritten,
        collapsed,
        warnings,
        resampled: resample,
        sources,
    })
}

fn validate_sample(index: usize, raw: &RawSample) -> IngestResult<()> {
    let invalid = |why: String| IngestError::SchemaInvalid(format!("sample {}: {}", index, why));

    if raw.entity.trim().is_empty() {
        return Err(invalid("entity must not be empty".to_string()));
    }
    if raw.entity.bytes().any(|b| b.is_ascii_control() || b == b'"') {
        return Err(invalid(format!("entity '{}' contains invalid characters", raw.entity)));
    }
    if !raw.translation.iter().chain(raw.rotation.iter()).all(|v| v.is_finite()) {
        return Err(invalid("translation/rotation must be finite".to_string()));
    }
    if let Some(lens) = &raw.lens {
        for (name, value) in [
            ("focal_length", lens.focal_length),
            ("focus_distance", lens.focus_distance),
            ("zoom", lens.zoom),
            ("fov", lens.fov),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(invalid(format!("lens {} must be finite", name)));
                }
            }
        }
        if matches!(lens.focal_length, Some(f) if f <= 0.0) {
            return Err(invalid("lens focal_length must be > 0".to_string()));
        }
    }
    Ok(())
}

/// Absolute frame count at the batch rate
fn source_frames(index: usize, raw: &RawSample, rate: &FrameRate) -> IngestResult<i64> {
    match &raw.timecode {
        SourceTimecode::Smpte(text) => Timecode::parse(text, rate)
            .map(|tc| tc.to_frames(rate))
            .map_err(|e| IngestError::SchemaInvalid(format!("sample {}: {}", index, e))),
        SourceTimecode::Frames(frames) if *frames >= 0 => Ok(*frames),
        SourceTimecode::Seconds(secs) if secs.is_finite() && *secs >= 0.0 => {
            Ok(rate.frames_from_seconds(*secs))
        }
        other => Err(IngestError::SchemaInvalid(format!(
            "sample {}: invalid timecode {}",
            index, other
        ))),
    }
}

/// Gaps wider than the threshold, including against already-accepted neighbours
fn detect_gaps(samples: &[Sample], ledger: &FrameLedger, threshold: u64) -> Vec<GapWarning> {
    let mut warnings = Vec::new();
    let mut push = |entity: &str, after: u64, before: u64| {
        let missing = before - after - 1;
        if missing > threshold {
            warnings.push(GapWarning {
                entity: entity.to_string(),
                after_frame: after,
                before_frame: before,
                missing,
            });
        }
    };

    for (i, sample) in samples.iter().enumerate() {
        let previous_in_batch = i
            .checked_sub(1)
            .map(|p| &samples[p])
            .filter(|p| p.entity == sample.entity)
            .map(|p| p.frame);
        let previous = match (previous_in_batch, ledger.predecessor(&sample.entity, sample.frame)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if let Some(prev) = previous {
            push(&sample.entity, prev, sample.frame);
        }

        let next_in_batch = samples
            .get(i + 1)
            .filter(|n| n.entity == sample.entity)
            .map(|n| n.frame);
        if let Some(next) = ledger.successor(&sample.entity, sample.frame) {
            if next_in_batch.map_or(true, |n| next < n) {
                push(&sample.entity, sample.frame, next);
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entity: &str, frame: i64, x: f64) -> RawSample {
        RawSample {
            entity: entity.to_string(),
            timecode: SourceTimecode::Frames(frame),
            translation: [x, 0.0, 0.0],
            rotation: [0.0, 0.0, 0.0],
            lens: None,
        }
    }

    fn batch(samples: Vec<RawSample>) -> SampleBatch {
        SampleBatch {
            take_id: "take".to_string(),
            rate: None,
            samples,
        }
    }

    fn config(dup: DuplicateFramePolicy) -> NormalizerConfig {
        NormalizerConfig {
            fps_mismatch_policy: FpsMismatchPolicy::Reject,
            duplicate_frame_policy: dup,
            gap_warning_threshold_frames: 2,
        }
    }

    fn fps24() -> FrameRate {
        FrameRate::integer(24).unwrap()
    }

    #[test]
    fn test_unordered_batch_is_sorted_per_entity() {
        let b = batch(vec![raw("b", 2, 0.0), raw("a", 1, 0.0), raw("a", 0, 0.0), raw("b", 1, 0.0)]);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap();
        let order: Vec<(&str, u64)> = out.samples.iter().map(|s| (s.entity.as_str(), s.frame)).collect();
        assert_eq!(order, vec![("a", 0), ("a", 1), ("b", 1), ("b", 2)]);
    }

    #[test]
    fn test_frames_are_relative_to_start_timecode() {
        let start = Timecode::parse("00:00:10:00", &fps24()).unwrap();
        let b = batch(vec![RawSample {
            timecode: SourceTimecode::Smpte("00:00:10:05".to_string()),
            ..raw("a", 0, 0.0)
        }]);
        let out = normalize(&b, &fps24(), &start, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap();
        assert_eq!(out.samples[0].frame, 5);
        assert_eq!(out.samples[0].source_timecode, "00:00:10:05");
    }

    #[test]
    fn test_sample_before_start_is_invalid() {
        let start = Timecode::parse("00:00:10:00", &fps24()).unwrap();
        let b = batch(vec![raw("a", 0, 0.0)]);
        let err = normalize(&b, &fps24(), &start, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap_err();
        assert!(matches!(err, IngestError::SchemaInvalid(_)));
    }

    #[test]
    fn test_duplicate_in_batch_rejected_wholesale() {
        let b = batch(vec![raw("a", 0, 1.0), raw("a", 1, 1.0), raw("a", 1, 2.0)]);
        let err = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap_err();
        assert!(matches!(err, IngestError::SchemaInvalid(msg) if msg.contains("duplicate")));
    }

    #[test]
    fn test_duplicate_in_batch_overwrite_keeps_later() {
        let b = batch(vec![raw("a", 1, 1.0), raw("a", 1, 2.0)]);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Overwrite)).unwrap();
        assert_eq!(out.samples.len(), 1);
        assert_eq!(out.samples[0].translation[0], 2.0);
        assert_eq!(out.overwritten, 1);
    }

    #[test]
    fn test_duplicate_against_ledger() {
        let mut ledger = FrameLedger::default();
        ledger.insert("a", 4);
        let b = batch(vec![raw("a", 4, 9.0)]);

        assert!(normalize(&b, &fps24(), &Timecode::ZERO, &ledger, &config(DuplicateFramePolicy::Reject)).is_err());
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &ledger, &config(DuplicateFramePolicy::Overwrite)).unwrap();
        assert_eq!(out.overwritten, 1);
    }

    #[test]
    fn test_same_frame_different_entities_is_not_duplicate() {
        let b = batch(vec![raw("a", 3, 0.0), raw("b", 3, 0.0)]);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap();
        assert_eq!(out.samples.len(), 2);
    }

    #[test]
    fn test_rate_mismatch_rejected_by_default() {
        let mut b = batch(vec![raw("a", 0, 0.0)]);
        b.rate = Some(FrameRate::integer(25).unwrap());
        let err = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap_err();
        assert!(matches!(err, IngestError::RateMismatch { declared, batch } if declared == "24" && batch == "25"));
    }

    #[test]
    fn test_rate_mismatch_resampled_when_configured() {
        let mut b = batch(vec![raw("a", 0, 0.0), raw("a", 96, 0.0)]);
        b.rate = Some(FrameRate::integer(48).unwrap());
        let cfg = NormalizerConfig {
            fps_mismatch_policy: FpsMismatchPolicy::Resample,
            ..config(DuplicateFramePolicy::Reject)
        };
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &cfg).unwrap();
        assert!(out.resampled);
        assert_eq!(out.samples.iter().map(|s| s.frame).collect::<Vec<_>>(), vec![0, 48]);
    }

    fn resample_config() -> NormalizerConfig {
        NormalizerConfig {
            fps_mismatch_policy: FpsMismatchPolicy::Resample,
            ..config(DuplicateFramePolicy::Reject)
        }
    }

    #[test]
    fn test_downsample_keeps_sample_nearest_each_frame() {
        // Odd source frames first, so the exact ones arrive second
        let mut samples: Vec<RawSample> = (1..48).step_by(2).map(|f| raw("a", f, 1.0)).collect();
        samples.extend((0..48).step_by(2).map(|f| raw("a", f, 0.0)));
        let mut b = batch(samples);
        b.rate = Some(FrameRate::integer(48).unwrap());

        let out = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &resample_config()).unwrap();
        assert_eq!(out.samples.len(), 25);
        assert_eq!(out.collapsed, 23);
        assert_eq!(out.overwritten, 0);
        for sample in &out.samples {
            let expected = if sample.frame == 24 { 1.0 } else { 0.0 };
            assert_eq!(sample.translation[0], expected, "frame {}", sample.frame);
        }
        assert_eq!(out.sources.len(), 25);
        assert!(out.sources[1].instant.same_instant(&SourceInstant::new(2, &FrameRate::integer(48).unwrap())));
    }

    #[test]
    fn test_downsample_tie_keeps_first() {
        // At 3 fps, source frames 1 and 2 are both 1/6 s from frame 1 at 2 fps
        let two = FrameRate::integer(2).unwrap();
        let mut b = batch(vec![raw("a", 1, 1.0), raw("a", 2, 2.0)]);
        b.rate = Some(FrameRate::integer(3).unwrap());

        let out = normalize(&b, &two, &Timecode::ZERO, &FrameLedger::default(), &resample_config()).unwrap();
        assert_eq!(out.samples.len(), 1);
        assert_eq!(out.samples[0].frame, 1);
        assert_eq!(out.samples[0].translation[0], 1.0);
        assert_eq!(out.collapsed, 1);
    }

    #[test]
    fn test_downsample_against_ledger_replaces_farther_sample() {
        let fps48 = FrameRate::integer(48).unwrap();
        let mut ledger = FrameLedger::default();
        ledger.insert("a", 24);
        ledger.set_source(ResampledSource {
            entity: "a".to_string(),
            frame: 24,
            instant: SourceInstant::new(47, &fps48),
        });

        let mut b = batch(vec![raw("a", 48, 5.0)]);
        b.rate = Some(fps48);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &ledger, &resample_config()).unwrap();
        assert_eq!(out.samples.len(), 1);
        assert_eq!(out.collapsed, 1);

        // An accepted sample taken exactly on the frame is never displaced
        let mut exact = FrameLedger::default();
        exact.insert("a", 24);
        let mut b = batch(vec![raw("a", 47, 5.0)]);
        b.rate = Some(fps48);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &exact, &resample_config()).unwrap();
        assert!(out.samples.is_empty());
        assert_eq!(out.collapsed, 1);
    }

    #[test]
    fn test_resampled_resubmission_is_duplicate() {
        let fps48 = FrameRate::integer(48).unwrap();
        let mut b = batch(vec![raw("a", 10, 0.0), raw("a", 10, 1.0)]);
        b.rate = Some(fps48);
        let err = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &resample_config()).unwrap_err();
        assert!(matches!(err, IngestError::SchemaInvalid(msg) if msg.contains("duplicate")));

        let mut ledger = FrameLedger::default();
        ledger.insert("a", 5);
        ledger.set_source(ResampledSource {
            entity: "a".to_string(),
            frame: 5,
            instant: SourceInstant::new(10, &fps48),
        });
        let mut b = batch(vec![raw("a", 10, 0.0)]);
        b.rate = Some(fps48);
        assert!(normalize(&b, &fps24(), &Timecode::ZERO, &ledger, &resample_config()).is_err());
    }

    #[test]
    fn test_drop_label_alone_is_not_a_mismatch() {
        let take: FrameRate = "29.97df".parse().unwrap();
        let mut b = batch(vec![raw("a", 0, 0.0)]);
        b.rate = Some("29.97".parse().unwrap());
        assert!(normalize(&b, &take, &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).is_ok());
    }

    #[test]
    fn test_malformed_fields_are_schema_invalid() {
        let cases = vec![
            raw("", 0, 0.0),
            raw("a", 0, f64::NAN),
            raw("a", -1, 0.0),
            RawSample {
                timecode: SourceTimecode::Smpte("nope".to_string()),
                ..raw("a", 0, 0.0)
            },
            RawSample {
                lens: Some(crate::models::LensMetadata {
                    focal_length: Some(0.0),
                    ..Default::default()
                }),
                ..raw("a", 0, 0.0)
            },
        ];
        for sample in cases {
            let b = batch(vec![raw("ok", 0, 0.0), sample.clone()]);
            let err = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject));
            assert!(matches!(err, Err(IngestError::SchemaInvalid(_))), "{:?} accepted", sample);
        }
    }

    #[test]
    fn test_gap_warnings_not_failures() {
        let mut ledger = FrameLedger::default();
        ledger.insert("a", 0);
        ledger.insert("a", 20);
        let b = batch(vec![raw("a", 10, 0.0), raw("a", 11, 0.0), raw("a", 12, 0.0)]);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &ledger, &config(DuplicateFramePolicy::Reject)).unwrap();

        let gaps: Vec<(u64, u64, u64)> = out
            .warnings
            .iter()
            .map(|w| (w.after_frame, w.before_frame, w.missing))
            .collect();
        assert_eq!(gaps, vec![(0, 10, 9), (12, 20, 7)]);
    }

    #[test]
    fn test_gap_within_threshold_is_silent() {
        let b = batch(vec![raw("a", 0, 0.0), raw("a", 3, 0.0)]);
        let out = normalize(&b, &fps24(), &Timecode::ZERO, &FrameLedger::default(), &config(DuplicateFramePolicy::Reject)).unwrap();
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_ledger_frame_range() {
        let mut ledger = FrameLedger::default();
        assert_eq!(ledger.frame_range(), None);
        ledger.insert("a", 5);
        ledger.insert("b", 2);
        ledger.insert("b", 9);
        assert_eq!(ledger.frame_range(), Some((2, 9)));
        assert_eq!(ledger.entity_count(), 2);
        assert_eq!(ledger.len(), 3);
    }
}
