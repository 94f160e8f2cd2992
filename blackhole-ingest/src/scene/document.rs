//! USD ASCII layer rendering and header parsing
//!
//! Layout of a take document:
//!
//! ```text
//! #usda 1.0
//! ( customLayerData = { production, shot, takeId, ... } startTimeCode ... )
//! def Xform "World" { def Xform "anim" { def Camera "<entity>" { ... } } }
//! ```
//!
//! Rendering is streamed: the header first, then one prim per entity whose
//! attribute blocks are copied from per-attribute spool files. Reading only
//! ever scans line by line.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::error::{IngestError, IngestResult};
use crate::models::Sample;
use crate::timecode::FrameRate;

/// Document-level metadata; also what the reconciler reads back
#[derive(Debug, Clone, PartialEq)]
pub struct SceneHeader {
    pub production: String,
    pub shot: String,
    pub take_id: String,
    pub camera_id: String,
    pub frame_rate: FrameRate,
    pub start_timecode: String,
    /// Timecode of `end_frame`
    pub end_timecode: String,
    pub start_frame: u64,
    pub end_frame: u64,
    pub description: String,
    /// Written on `/World` as well; empty means none
    pub map: String,
    pub valid: bool,
}

/// Header plus sample statistics of an existing document
#[derive(Debug, Clone, PartialEq)]
pub struct SceneSummary {
    pub header: SceneHeader,
    pub sample_count: u64,
    pub entity_count: u64,
}

/// Time-sampled attributes written per entity, in output order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleAttribute {
    FocalLength,
    FocusDistance,
    Zoom,
    Fov,
    Rotate,
    Translate,
}

impl SampleAttribute {
    pub const ALL: [SampleAttribute; 6] = [
        SampleAttribute::FocalLength,
        SampleAttribute::FocusDistance,
        SampleAttribute::Zoom,
        SampleAttribute::Fov,
        SampleAttribute::Rotate,
        SampleAttribute::Translate,
    ];

    pub fn declaration(&self) -> &'static str {
        match self {
            SampleAttribute::FocalLength => "float focalLength.timeSamples",
            SampleAttribute::FocusDistance => "float focusDistance.timeSamples",
            SampleAttribute::Zoom => "float lens:zoom.timeSamples",
            SampleAttribute::Fov => "float lens:fov.timeSamples",
            SampleAttribute::Rotate => "double3 xformOp:rotateXYZ.timeSamples",
            SampleAttribute::Translate => "double3 xformOp:translate.timeSamples",
        }
    }

    /// Time-sample line for this attribute, if the sample carries a value
    pub fn entry(&self, sample: &Sample) -> Option<String> {
        let lens = sample.lens.unwrap_or_default();
        let scalar = |value: Option<f64>| value.map(|v| format!("{}: {}", sample.frame, v));
        match self {
            SampleAttribute::FocalLength => scalar(lens.focal_length),
            SampleAttribute::FocusDistance => scalar(lens.focus_distance),
            SampleAttribute::Zoom => scalar(lens.zoom),
            SampleAttribute::Fov => scalar(lens.fov),
            SampleAttribute::Rotate => Some(vector_entry(sample.frame, &sample.rotation)),
            SampleAttribute::Translate => Some(vector_entry(sample.frame, &sample.translation)),
        }
    }
}

fn vector_entry(frame: u64, v: &[f64; 3]) -> String {
    format!("{}: ({}, {}, {})", frame, v[0], v[1], v[2])
}

const PRIM_INDENT: &str = "        ";
const ATTR_INDENT: &str = "            ";
const ENTRY_INDENT: &str = "                ";

/// Quote a string for a USD string literal
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn unquote(literal: &str) -> Option<String> {
    let inner = literal.trim().strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Unique USD prim name for an entity
///
/// Prim names are identifiers, so other characters become `_`; a numeric
/// suffix keeps two entities that map to the same name apart.
pub fn prim_name(entity: &str, used: &mut HashSet<String>) -> String {
    let mut base: String = entity
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert(0, '_');
    }

    let mut name = base.clone();
    let mut suffix = 1;
    while !used.insert(name.clone()) {
        name = format!("{}_{}", base, suffix);
        suffix += 1;
    }
    name
}

pub fn write_header<W: Write>(out: &mut W, header: &SceneHeader) -> std::io::Result<()> {
    let fps = header.frame_rate.as_f64();
    writeln!(out, "#usda 1.0")?;
    writeln!(out, "(")?;
    writeln!(out, "    customLayerData = {{")?;
    writeln!(out, "        string cameraId = {}", quote(&header.camera_id))?;
    writeln!(out, "        string description = {}", quote(&header.description))?;
    writeln!(out, "        string endTimecode = {}", quote(&header.end_timecode))?;
    writeln!(out, "        string frameRate = {}", quote(&header.frame_rate.to_string()))?;
    writeln!(out, "        string map = {}", quote(&header.map))?;
    writeln!(out, "        string production = {}", quote(&header.production))?;
    writeln!(out, "        string shot = {}", quote(&header.shot))?;
    writeln!(out, "        string startTimecode = {}", quote(&header.start_timecode))?;
    writeln!(out, "        string takeId = {}", quote(&header.take_id))?;
    writeln!(out, "        bool valid = {}", header.valid)?;
    writeln!(out, "    }}")?;
    writeln!(out, "    defaultPrim = \"World\"")?;
    writeln!(out, "    endTimeCode = {}", header.end_frame)?;
    writeln!(out, "    framesPerSecond = {}", fps)?;
    writeln!(out, "    metersPerUnit = 0.01")?;
    writeln!(out, "    startTimeCode = {}", header.start_frame)?;
    writeln!(out, "    timeCodesPerSecond = {}", fps)?;
    writeln!(out, "    upAxis = \"Y\"")?;
    writeln!(out, ")")?;
    writeln!(out)?;
    writeln!(out, "def Xform \"World\" (")?;
    writeln!(out, "    kind = \"group\"")?;
    writeln!(out, ")")?;
    writeln!(out, "{{")?;
    if !header.map.is_empty() {
        writeln!(out, "    string Map = {}", quote(&header.map))?;
        writeln!(out)?;
    }
    writeln!(out, "    def Xform \"anim\" (")?;
    writeln!(out, "        kind = \"group\"")?;
    writeln!(out, "    )")?;
    writeln!(out, "    {{")?;
    writeln!(out, "        string Slate = {}", quote(&header.shot))?;
    writeln!(out, "        string TakeId = {}", quote(&header.take_id))?;
    Ok(())
}

pub fn write_entity_open<W: Write>(out: &mut W, prim: &str, entity: &str) -> std::io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{}def Camera \"{}\" (", PRIM_INDENT, prim)?;
    writeln!(out, "{}    kind = \"group\"", PRIM_INDENT)?;
    writeln!(out, "{})", PRIM_INDENT)?;
    writeln!(out, "{}{{", PRIM_INDENT)?;
    writeln!(out, "{}string trackedEntity = {}", ATTR_INDENT, quote(entity))?;
    Ok(())
}

pub fn write_attribute_open<W: Write>(out: &mut W, attribute: SampleAttribute) -> std::io::Result<()> {
    writeln!(out, "{}{} = {{", ATTR_INDENT, attribute.declaration())
}

pub fn write_attribute_entry<W: Write>(out: &mut W, entry: &str) -> std::io::Result<()> {
    writeln!(out, "{}{},", ENTRY_INDENT, entry)
}

pub fn write_attribute_close<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(out, "{}}}", ATTR_INDENT)
}

pub fn write_entity_close<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(
        out,
        "{}uniform token[] xformOpOrder = [\"xformOp:translate\", \"xformOp:rotateXYZ\"]",
        ATTR_INDENT
    )?;
    writeln!(out, "{}}}", PRIM_INDENT)
}

pub fn write_footer<W: Write>(out: &mut W) -> std::io::Result<()> {
    writeln!(out, "    }}")?;
    writeln!(out, "}}")?;
    writeln!(out)
}

fn malformed(path: &Path, why: &str) -> IngestError {
    IngestError::ConsistencyViolation(format!("{}: not a take document ({})", path.display(), why))
}

/// Read the layer metadata of a take document
pub fn read_header(path: &Path) -> IngestResult<SceneHeader> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    match lines.next() {
        Some(Ok(first)) if first.trim() == "#usda 1.0" => {}
        _ => return Err(malformed(path, "missing #usda header")),
    }

    let mut fields: Vec<(String, String)> = Vec::new();
    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        if trimmed == ")" {
            break;
        }
        let Some((lhs, rhs)) = trimmed.split_once(" = ") else {
            continue;
        };
        // `string cameraId`, `bool valid`, `endTimeCode`
        let key = lhs.trim().rsplit(' ').next().unwrap_or_default().to_string();
        fields.push((key, rhs.trim().to_string()));
    }

    let raw = |key: &str| {
        fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| malformed(path, &format!("missing {}", key)))
    };
    let string = |key: &str| raw(key).and_then(|v| unquote(v).ok_or_else(|| malformed(path, key)));
    let number = |key: &str| {
        raw(key).and_then(|v| {
            v.parse::<f64>()
                .ok()
                .filter(|n| n.is_finite() && *n >= 0.0)
                .map(|n| n as u64)
                .ok_or_else(|| malformed(path, key))
        })
    };

    // Slate fields are optional so older documents can still be adopted
    let optional = |key: &str| if raw(key).is_ok() { string(key) } else { Ok(String::new()) };
    let valid = match raw("valid") {
        Ok("true") => true,
        Ok("false") | Err(_) => false,
        Ok(_) => return Err(malformed(path, "valid")),
    };

    let frame_rate: FrameRate = string("frameRate")?
        .parse()
        .map_err(|_| malformed(path, "frameRate"))?;

    Ok(SceneHeader {
        production: string("production")?,
        shot: string("shot")?,
        take_id: string("takeId")?,
        camera_id: string("cameraId")?,
        frame_rate,
        start_timecode: string("startTimecode")?,
        end_timecode: optional("endTimecode")?,
        start_frame: number("startTimeCode")?,
        end_frame: number("endTimeCode")?,
        description: optional("description")?,
        map: optional("map")?,
        valid,
    })
}

/// Header plus sample and entity counts, from the translate blocks
pub fn read_summary(path: &Path) -> IngestResult<SceneSummary> {
    let header = read_header(path)?;
    let reader = BufReader::new(File::open(path)?);

    let translate = SampleAttribute::Translate.declaration();
    let mut in_translate = false;
    let mut sample_count = 0u64;
    let mut entity_count = 0u64;
    let mut range: Option<(u64, u64)> = None;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.starts_with("def Camera ") {
            entity_count += 1;
        } else if trimmed.starts_with(translate) {
            in_translate = true;
        } else if in_translate && trimmed == "}" {
            in_translate = false;
        } else if in_translate {
            let frame = trimmed
                .split_once(':')
                .and_then(|(frame, _)| frame.trim().parse::<u64>().ok())
                .ok_or_else(|| malformed(path, "bad time sample"))?;
            sample_count += 1;
            range = Some(match range {
                Some((lo, hi)) => (lo.min(frame), hi.max(frame)),
                None => (frame, frame),
            });
        }
    }

    if let Some((lo, hi)) = range {
        if lo < header.start_frame || hi > header.end_frame {
            return Err(malformed(path, "time samples outside start/end time code"));
        }
    }

    Ok(SceneSummary {
        header,
        sample_count,
        entity_count,
    })
}
