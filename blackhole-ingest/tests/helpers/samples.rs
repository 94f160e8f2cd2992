//! Request and sample builders

use blackhole_ingest::models::{OpenTakeRequest, RawSample, SampleBatch, SourceTimecode};
use blackhole_ingest::timecode::FrameRate;
use std::collections::BTreeMap;
use std::path::Path;

pub fn open_request(take_id: &str, fps: &str) -> OpenTakeRequest {
    OpenTakeRequest {
        take_id: take_id.to_string(),
        production: "demo".to_string(),
        shot: "shot01".to_string(),
        camera_id: "cam-a".to_string(),
        fps: fps.parse::<FrameRate>().unwrap(),
        start_timecode: "00:00:00:00".to_string(),
        description: String::new(),
        map: String::new(),
        valid: false,
    }
}

/// One sample per absolute frame; translation.x carries `tag`
pub fn frame_samples(entity: &str, frames: impl IntoIterator<Item = i64>, tag: f64) -> Vec<RawSample> {
    frames
        .into_iter()
        .map(|frame| RawSample {
            entity: entity.to_string(),
            timecode: SourceTimecode::Frames(frame),
            translation: [tag, frame as f64, 0.0],
            rotation: [0.0, 90.0, 0.0],
            lens: None,
        })
        .collect()
}

pub fn batch(take_id: &str, samples: Vec<RawSample>) -> SampleBatch {
    SampleBatch {
        take_id: take_id.to_string(),
        rate: None,
        samples,
    }
}

/// Translate time-sample (frame, x) pairs per tracked entity, in file order
pub fn translate_frames_by_entity(path: &Path) -> BTreeMap<String, Vec<(u64, f64)>> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut result: BTreeMap<String, Vec<(u64, f64)>> = BTreeMap::new();
    let mut entity = String::new();
    let mut inside = false;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("string trackedEntity = ") {
            entity = rest.trim_matches('"').to_string();
            result.entry(entity.clone()).or_default();
        } else if line.starts_with("double3 xformOp:translate.timeSamples") {
            inside = true;
        } else if inside && line == "}" {
            inside = false;
        } else if inside {
            let (frame, value) = line.split_once(':').unwrap();
            let x = value
                .trim()
                .trim_start_matches('(')
                .split(',')
                .next()
                .unwrap()
                .trim()
                .parse::<f64>()
                .unwrap();
            result
                .get_mut(&entity)
                .unwrap()
                .push((frame.trim().parse().unwrap(), x));
        }
    }
    result
}
