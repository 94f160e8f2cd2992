//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration lives in a small TOML file. Every key is optional;
//! missing keys fall back to the built-in defaults below and a missing file is
//! a warning, not an error.
//!
//! Root folder priority:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`BLACKHOLE_ROOT`)
//! 3. `root_folder` key of the TOML config file
//! 4. OS-dependent compiled default (fallback)

use crate::time::millis_to_duration;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable that overrides the root folder
pub const ROOT_ENV_VAR: &str = "BLACKHOLE_ROOT";

/// File name of the bootstrap config
pub const CONFIG_FILE_NAME: &str = "blackhole.toml";

/// What to do when a batch's implied frame rate differs from the take's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FpsMismatchPolicy {
    /// Reject the whole batch with RateMismatch
    #[default]
    Reject,
    /// Convert each sample to the take's rate (nearest frame)
    Resample,
}

/// What to do with two samples for the same (entity, frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateFramePolicy {
    /// Reject the whole batch
    #[default]
    Reject,
    /// Keep the later-submitted sample
    Overwrite,
}

/// What the reconciler does with a committed-looking file that has no row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrphanPolicy {
    /// Re-derive the row from the file and record it
    Adopt,
    /// Move the file under `.quarantine/` for an operator
    #[default]
    Quarantine,
}

/// Ingest engine settings (`[ingest]` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub fps_mismatch_policy: FpsMismatchPolicy,
    pub duplicate_frame_policy: DuplicateFramePolicy,
    pub lock_lease_ttl_ms: u64,
    pub max_finalize_retries: u32,
    pub finalize_backoff_ms: u64,
    pub finalize_backoff_max_ms: u64,
    pub finalize_timeout_ms: u64,
    pub gap_warning_threshold_frames: u64,
    pub staging_chunk_samples: usize,
    /// Run files merged at once while staging
    pub staging_merge_fan_in: usize,
    pub orphan_policy: OrphanPolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            fps_mismatch_policy: FpsMismatchPolicy::Reject,
            duplicate_frame_policy: DuplicateFramePolicy::Reject,
            lock_lease_ttl_ms: 30_000,
            max_finalize_retries: 3,
            finalize_backoff_ms: 50,
            finalize_backoff_max_ms: 1_000,
            finalize_timeout_ms: 30_000,
            gap_warning_threshold_frames: 2,
            staging_chunk_samples: 4_096,
            staging_merge_fan_in: 64,
            orphan_policy: OrphanPolicy::Quarantine,
        }
    }
}

impl IngestSettings {
    pub fn lease_ttl(&self) -> Duration {
        millis_to_duration(self.lock_lease_ttl_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        millis_to_duration(self.finalize_timeout_ms)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.lock_lease_ttl_ms == 0 {
            return Err(Error::Config("lock_lease_ttl_ms must be > 0".to_string()));
        }
        if self.staging_chunk_samples == 0 {
            return Err(Error::Config("staging_chunk_samples must be > 0".to_string()));
        }
        if self.staging_merge_fan_in < 2 {
            return Err(Error::Config("staging_merge_fan_in must be >= 2".to_string()));
        }
        if self.finalize_backoff_max_ms < self.finalize_backoff_ms {
            return Err(Error::Config(
                "finalize_backoff_max_ms must be >= finalize_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder for the archive and database
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Scene document archive (default `<root>/archive`)
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    /// SQLite database file (default `<root>/blackhole.db`)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ingest: IngestSettings,
}

impl TomlConfig {
    /// Archive directory, relative paths resolved against `root`
    pub fn archive_dir(&self, root: &Path) -> PathBuf {
        match &self.archive_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.join("archive"),
        }
    }

    /// Database path, relative paths resolved against `root`
    pub fn database_path(&self, root: &Path) -> PathBuf {
        match &self.database_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root.join(path),
            None => root.join("blackhole.db"),
        }
    }
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.ingest.validate()?;
    Ok(config)
}

/// Load the config at `explicit` (must exist), else the default location,
/// else built-in defaults
pub fn load_or_default(explicit: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = explicit {
        return load_toml_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            info!("Loading config: {}", path.display());
            load_toml_config(&path)
        }
        _ => {
            warn!("No {} found, using built-in defaults", CONFIG_FILE_NAME);
            Ok(TomlConfig::default())
        }
    }
}

/// Write config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize config failed: {}", e)))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Resolve the root folder using CLI → ENV → TOML → OS default
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// Per-user config file location (`~/.config/blackhole/blackhole.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("blackhole").join(CONFIG_FILE_NAME))
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("blackhole"))
        .unwrap_or_else(|| PathBuf::from("./blackhole_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert_eq!(config, TomlConfig::default());
        assert_eq!(config.ingest.duplicate_frame_policy, DuplicateFramePolicy::Reject);
        assert_eq!(config.ingest.fps_mismatch_policy, FpsMismatchPolicy::Reject);
        assert_eq!(config.ingest.orphan_policy, OrphanPolicy::Quarantine);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_ingest_table_keeps_other_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [ingest]
            duplicate_frame_policy = "overwrite"
            max_finalize_retries = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.ingest.duplicate_frame_policy, DuplicateFramePolicy::Overwrite);
        assert_eq!(config.ingest.max_finalize_retries, 7);
        assert_eq!(config.ingest.lock_lease_ttl_ms, 30_000);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let result: std::result::Result<TomlConfig, _> =
            toml::from_str("[ingest]\norphan_policy = \"delete\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let config = TomlConfig {
            archive_dir: Some(PathBuf::from("takes")),
            ..Default::default()
        };
        let root = Path::new("/srv/blackhole");
        assert_eq!(config.archive_dir(root), PathBuf::from("/srv/blackhole/takes"));
        assert_eq!(config.database_path(root), PathBuf::from("/srv/blackhole/blackhole.db"));
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let settings = IngestSettings {
            lock_lease_ttl_ms: 0,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
