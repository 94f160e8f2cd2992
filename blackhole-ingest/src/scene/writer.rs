//! Scene writer: staging, merge and atomic commit of one take document
//!
//! Accepted samples are buffered in memory and spilled as sorted JSON-lines
//! run files once `chunk_samples` is reached. Once `max_fan_in` runs exist
//! they are merged into one, so no merge ever holds more than `max_fan_in`
//! run files open. Commit k-way merges the runs into the final document through a temporary file in the destination
//! directory, then renames it into place. Readers only ever see the previous
//! document or the complete new one.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Lines, Read, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::document::{self, SampleAttribute, SceneHeader};
use crate::error::{IngestError, IngestResult};
use crate::models::{Sample, TakeDescriptor};
use crate::normalizer::{FrameLedger, ResampledSource};

/// Archive subdirectory holding per-session staging directories
pub const STAGING_DIR: &str = ".staging";
/// Archive subdirectory receiving quarantined documents
pub const QUARANTINE_DIR: &str = ".quarantine";
pub const DOCUMENT_EXTENSION: &str = "usda";
/// Run files merged at once
pub const DEFAULT_MAX_MERGE_FAN_IN: usize = 64;

/// `<archive>/<production>/<shot>/<take_id>/<take_id>.usda`
pub fn final_path(archive_dir: &Path, production: &str, shot: &str, take_id: &str) -> PathBuf {
    archive_dir
        .join(production)
        .join(shot)
        .join(take_id)
        .join(format!("{}.{}", take_id, DOCUMENT_EXTENSION))
}

/// Take id encoded in a staging directory name (`<take_id>-<session uuid>`)
pub fn staging_take_id(dir_name: &str) -> Option<&str> {
    let split = dir_name.len().checked_sub(37)?;
    if !dir_name.is_char_boundary(split) || dir_name.as_bytes()[split] != b'-' {
        return None;
    }
    Uuid::parse_str(&dir_name[split + 1..]).ok()?;
    Some(&dir_name[..split]).filter(|id| !id.is_empty())
}

/// Hex SHA-256 of a file, read in 1MB chunks
pub fn checksum_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Durable result of a successful commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedArtifact {
    pub path: PathBuf,
    pub checksum: String,
    pub frame_start: u64,
    pub frame_end: u64,
    pub sample_count: u64,
    pub entity_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StagedSample {
    seq: u64,
    sample: Sample,
}

impl StagedSample {
    fn cmp_key(&self, other: &Self) -> Ordering {
        (&self.sample.entity, self.sample.frame, self.seq).cmp(&(
            &other.sample.entity,
            other.sample.frame,
            other.seq,
        ))
    }
}

/// In-progress document for one open take
#[derive(Debug)]
pub struct SceneWriter {
    descriptor: TakeDescriptor,
    final_path: PathBuf,
    staging_dir: PathBuf,
    ledger: FrameLedger,
    buffer: Vec<StagedSample>,
    runs: Vec<PathBuf>,
    /// Names run files; never reused within a session
    next_run: usize,
    next_seq: u64,
    chunk_samples: usize,
    max_fan_in: usize,
}

impl SceneWriter {
    pub fn new(
        archive_dir: &Path,
        descriptor: TakeDescriptor,
        session_id: Uuid,
        chunk_samples: usize,
    ) -> Self {
        let final_path = final_path(
            archive_dir,
            &descriptor.production,
            &descriptor.shot,
            &descriptor.take_id,
        );
        let staging_dir = archive_dir
            .join(STAGING_DIR)
            .join(format!("{}-{}", descriptor.take_id, session_id));

        Self {
            descriptor,
            final_path,
            staging_dir,
            ledger: FrameLedger::default(),
            buffer: Vec::new(),
            runs: Vec::new(),
            next_run: 0,
            next_seq: 0,
            chunk_samples: chunk_samples.max(1),
            max_fan_in: DEFAULT_MAX_MERGE_FAN_IN,
        }
    }

    pub fn with_max_fan_in(mut self, max_fan_in: usize) -> Self {
        self.max_fan_in = max_fan_in.max(2);
        self
    }

    pub fn descriptor(&self) -> &TakeDescriptor {
        &self.descriptor
    }

    pub fn ledger(&self) -> &FrameLedger {
        &self.ledger
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Number of spilled run files
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    /// Accept normalized samples
    ///
    /// A failed spill keeps the chunk in memory; the next append or the
    /// commit retries it.
    pub fn append(&mut self, samples: Vec<Sample>) {
        for sample in samples {
            self.ledger.insert(&sample.entity, sample.frame);
            self.buffer.push(StagedSample {
                seq: self.next_seq,
                sample,
            });
            self.next_seq += 1;
        }

        if self.buffer.len() >= self.chunk_samples {
            if let Err(e) = self.spill() {
                tracing::warn!(
                    take_id = %self.descriptor.take_id,
                    buffered = self.buffer.len(),
                    error = %e,
                    "Failed to spill staged samples, keeping them in memory"
                );
            } else if let Err(e) = self.compact_runs() {
                tracing::warn!(
                    take_id = %self.descriptor.take_id,
                    runs = self.runs.len(),
                    error = %e,
                    "Failed to compact staging runs"
                );
            }
        }
    }

    /// Remember the source instants of resampled frames
    pub fn record_sources(&mut self, sources: Vec<ResampledSource>) {
        for source in sources {
            self.ledger.set_source(source);
        }
    }

    /// Samples of one entity
    pub fn append_entity(&mut self, entity: &str, samples: Vec<Sample>) {
        self.append(
            samples
                .into_iter()
                .map(|s| Sample {
                    entity: entity.to_string(),
                    ..s
                })
                .collect(),
        );
    }

    fn spill(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.staging_dir)?;
        self.buffer.sort_by(StagedSample::cmp_key);

        let path = self.next_run_path();
        write_run(&path, self.buffer.iter().cloned().map(Ok))?;

        tracing::debug!(
            take_id = %self.descriptor.take_id,
            run = %path.display(),
            samples = self.buffer.len(),
            "Spilled staging run"
        );
        self.runs.push(path);
        self.buffer.clear();
        Ok(())
    }

    fn next_run_path(&mut self) -> PathBuf {
        let path = self.staging_dir.join(format!("run-{:05}.jsonl", self.next_run));
        self.next_run += 1;
        path
    }

    /// Merge the oldest `max_fan_in` runs into one once that many exist
    ///
    /// The merge keeps the winning sample of each (entity, frame) with its
    /// sequence number, so later runs still override it.
    fn compact_runs(&mut self) -> io::Result<()> {
        if self.runs.len() < self.max_fan_in {
            return Ok(());
        }
        let path = self.next_run_path();
        write_run(&path, MergedRuns::open(&self.runs[..self.max_fan_in])?)?;

        let merged: Vec<PathBuf> = self.runs.drain(..self.max_fan_in).collect();
        self.runs.insert(0, path);
        for old in &merged {
            if let Err(e) = fs::remove_file(old) {
                tracing::warn!(run = %old.display(), error = %e, "Failed to remove merged staging run");
            }
        }

        tracing::debug!(
            take_id = %self.descriptor.take_id,
            merged = merged.len(),
            runs = self.runs.len(),
            "Compacted staging runs"
        );
        Ok(())
    }

    /// Write the document durably to its final path
    ///
    /// Repeatable: staged runs are kept until `discard`, so a retry after a
    /// failure merges the same input again.
    pub fn commit(&mut self) -> IngestResult<CommittedArtifact> {
        let (frame_start, frame_end) = self
            .ledger
            .frame_range()
            .ok_or_else(|| IngestError::Validation(format!("take '{}' has no samples", self.descriptor.take_id)))?;

        self.spill()
            .map_err(|e| write_failure("flushing staging chunk", &self.staging_dir, e))?;

        let parent = self
            .final_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| IngestError::WriteFailure(format!("{} has no parent", self.final_path.display())))?;
        fs::create_dir_all(&parent).map_err(|e| write_failure("creating take directory", &parent, e))?;

        let file_name = format!("{}.{}", self.descriptor.take_id, DOCUMENT_EXTENSION);
        let tmp_path = parent.join(format!("{}.tmp-{}", file_name, Uuid::new_v4()));

        let header = SceneHeader {
            production: self.descriptor.production.clone(),
            shot: self.descriptor.shot.clone(),
            take_id: self.descriptor.take_id.clone(),
            camera_id: self.descriptor.camera_id.clone(),
            frame_rate: self.descriptor.fps,
            start_timecode: self.descriptor.start_timecode.to_string(),
            end_timecode: self.descriptor.timecode_at(frame_end).to_string(),
            start_frame: frame_start,
            end_frame: frame_end,
            description: self.descriptor.description.clone(),
            map: self.descriptor.map.clone(),
            valid: self.descriptor.valid,
        };

        let rendered = self
            .render(&tmp_path, &header)
            .map_err(|e| write_failure("writing document", &tmp_path, e))
            .and_then(|stats| {
                let checksum = checksum_file(&tmp_path)
                    .map_err(|e| write_failure("checksumming document", &tmp_path, e))?;
                Ok((stats, checksum))
            });
        let ((sample_count, entity_count), checksum) = match rendered {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&tmp_path, &self.final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(write_failure("replacing document", &self.final_path, e));
        }
        sync_dir(&parent);

        tracing::info!(
            take_id = %self.descriptor.take_id,
            path = %self.final_path.display(),
            checksum = %checksum,
            samples = sample_count,
            entities = entity_count,
            "Committed scene document"
        );

        Ok(CommittedArtifact {
            path: self.final_path.clone(),
            checksum,
            frame_start,
            frame_end,
            sample_count,
            entity_count,
        })
    }

    /// Render the merged runs into `path`; returns (samples, entities)
    fn render(&self, path: &Path, header: &SceneHeader) -> io::Result<(u64, u64)> {
        let mut out = BufWriter::new(File::create(path)?);
        document::write_header(&mut out, header)?;

        let mut spools = SectionSpools::new(&self.staging_dir)?;
        let mut prims = HashSet::new();
        let mut current: Option<String> = None;
        let mut sample_count = 0u64;
        let mut entity_count = 0u64;

        for staged in MergedRuns::open(&self.runs)? {
            let sample = staged?.sample;
            if current.as_deref() != Some(sample.entity.as_str()) {
                if let Some(entity) = current.take() {
                    spools.drain_into(&mut out, &entity, &mut prims)?;
                }
                current = Some(sample.entity.clone());
                entity_count += 1;
            }
            spools.push(&sample)?;
            sample_count += 1;
        }
        if let Some(entity) = current.take() {
            spools.drain_into(&mut out, &entity, &mut prims)?;
        }
        spools.remove();

        document::write_footer(&mut out)?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((sample_count, entity_count))
    }

    /// Drop all staged data; never touches the final document
    pub fn discard(&mut self) -> IngestResult<()> {
        self.buffer.clear();
        self.runs.clear();
        match fs::remove_dir_all(&self.staging_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_failure("removing staging directory", &self.staging_dir, e)),
        }
    }
}

/// Write staged samples, already in merge order, as one run file
fn write_run(path: &Path, samples: impl IntoIterator<Item = io::Result<StagedSample>>) -> io::Result<()> {
    let result = (|| {
        let mut out = BufWriter::new(File::create(path)?);
        for staged in samples {
            serde_json::to_writer(&mut out, &staged?)?;
            out.write_all(b"\n")?;
        }
        out.flush()
    })();
    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    result
}

fn write_failure(action: &str, path: &Path, err: io::Error) -> IngestError {
    IngestError::WriteFailure(format!("{} {}: {}", action, path.display(), err))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::warn!(dir = %dir.display(), error = %e, "Failed to sync directory");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Per-attribute spool files for the entity currently being merged
struct SectionSpools {
    sections: Vec<(SampleAttribute, PathBuf, BufWriter<File>, u64)>,
}

impl SectionSpools {
    fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let mut sections = Vec::new();
        for (i, attribute) in SampleAttribute::ALL.into_iter().enumerate() {
            let path = dir.join(format!("section-{}.spool", i));
            let writer = BufWriter::new(File::create(&path)?);
            sections.push((attribute, path, writer, 0));
        }
        Ok(Self { sections })
    }

    fn push(&mut self, sample: &Sample) -> io::Result<()> {
        for (attribute, _, writer, count) in &mut self.sections {
            if let Some(entry) = attribute.entry(sample) {
                document::write_attribute_entry(writer, &entry)?;
                *count += 1;
            }
        }
        Ok(())
    }

    /// Emit one prim from the spooled sections and reset them
    fn drain_into<W: Write>(
        &mut self,
        out: &mut W,
        entity: &str,
        prims: &mut HashSet<String>,
    ) -> io::Result<()> {
        let prim = document::prim_name(entity, prims);
        document::write_entity_open(out, &prim, entity)?;
        for (attribute, path, writer, count) in &mut self.sections {
            writer.flush()?;
            if *count > 0 {
                document::write_attribute_open(out, *attribute)?;
                io::copy(&mut File::open(&*path)?, out)?;
                document::write_attribute_close(out)?;
            }
            *writer = BufWriter::new(File::create(&*path)?);
            *count = 0;
        }
        document::write_entity_close(out)
    }

    fn remove(self) {
        for (_, path, writer, _) in self.sections {
            drop(writer);
            let _ = fs::remove_file(path);
        }
    }
}

struct HeapEntry {
    staged: StagedSample,
    run: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // Reversed: BinaryHeap is a max-heap
    fn cmp(&self, other: &Self) -> Ordering {
        other.staged.cmp_key(&self.staged)
    }
}

/// K-way merge of sorted runs yielding one sample per (entity, frame)
struct MergedRuns {
    readers: Vec<Lines<BufReader<File>>>,
    heap: BinaryHeap<HeapEntry>,
}

impl MergedRuns {
    fn open(runs: &[PathBuf]) -> io::Result<Self> {
        let mut merged = Self {
            readers: Vec::with_capacity(runs.len()),
            heap: BinaryHeap::with_capacity(runs.len()),
        };
        for (run, path) in runs.iter().enumerate() {
            merged.readers.push(BufReader::new(File::open(path)?).lines());
            merged.refill(run)?;
        }
        Ok(merged)
    }

    fn refill(&mut self, run: usize) -> io::Result<()> {
        if let Some(line) = self.readers[run].next() {
            let staged: StagedSample = serde_json::from_str(&line?)?;
            self.heap.push(HeapEntry { staged, run });
        }
        Ok(())
    }

    fn next_staged(&mut self) -> io::Result<Option<StagedSample>> {
        let Some(first) = self.heap.pop() else {
            return Ok(None);
        };
        self.refill(first.run)?;
        let mut winner = first.staged;

        // Same (entity, frame): highest seq was submitted last and wins
        while let Some(top) = self.heap.peek() {
            let same = top.staged.sample.entity == winner.sample.entity
                && top.staged.sample.frame == winner.sample.frame;
            if !same {
                break;
            }
            if let Some(entry) = self.heap.pop() {
                self.refill(entry.run)?;
                winner = entry.staged;
            }
        }
        Ok(Some(winner))
    }
}

impl Iterator for MergedRuns {
    type Item = io::Result<StagedSample>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_staged().transpose()
    }
}
