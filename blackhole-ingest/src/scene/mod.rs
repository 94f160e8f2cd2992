//! Scene document persistence

pub mod document;
pub mod writer;

pub use document::{read_header, read_summary, SceneHeader, SceneSummary};
pub use writer::{checksum_file, final_path, CommittedArtifact, SceneWriter};
