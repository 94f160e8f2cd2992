//! Tests for configuration loading and root folder resolution
//!
//! Tests that touch BLACKHOLE_ROOT are #[serial] so they do not race on the
//! process environment.

use blackhole_common::config::{
    load_or_default, load_toml_config, resolve_root_folder, write_toml_config,
    DuplicateFramePolicy, FpsMismatchPolicy, OrphanPolicy, TomlConfig, ROOT_ENV_VAR,
};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn test_load_full_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("blackhole.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/srv/blackhole"
archive_dir = "usd"

[logging]
level = "debug"

[ingest]
fps_mismatch_policy = "resample"
duplicate_frame_policy = "overwrite"
lock_lease_ttl_ms = 5000
max_finalize_retries = 5
gap_warning_threshold_frames = 10
orphan_policy = "adopt"
"#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();

    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/blackhole")));
    assert_eq!(config.archive_dir(Path::new("/srv/blackhole")), PathBuf::from("/srv/blackhole/usd"));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.ingest.fps_mismatch_policy, FpsMismatchPolicy::Resample);
    assert_eq!(config.ingest.duplicate_frame_policy, DuplicateFramePolicy::Overwrite);
    assert_eq!(config.ingest.lock_lease_ttl_ms, 5000);
    assert_eq!(config.ingest.max_finalize_retries, 5);
    assert_eq!(config.ingest.gap_warning_threshold_frames, 10);
    assert_eq!(config.ingest.orphan_policy, OrphanPolicy::Adopt);
}

#[test]
fn test_invalid_values_are_config_errors() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("blackhole.toml");
    std::fs::write(&path, "[ingest]\nstaging_chunk_samples = 0\n").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("staging_chunk_samples"));

    std::fs::write(&path, "[ingest]\nstaging_merge_fan_in = 1\n").unwrap();
    let err = load_toml_config(&path).unwrap_err();
    assert!(err.to_string().contains("staging_merge_fan_in"));
}

#[test]
fn test_explicit_missing_file_is_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = load_or_default(Some(&temp_dir.path().join("missing.toml")));
    assert!(result.is_err());
}

#[test]
fn test_write_then_load_preserves_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("conf").join("blackhole.toml");

    let mut config = TomlConfig::default();
    config.ingest.orphan_policy = OrphanPolicy::Adopt;
    config.database_path = Some(PathBuf::from("db/takes.db"));

    write_toml_config(&config, &path).unwrap();
    let loaded = load_toml_config(&path).unwrap();

    assert_eq!(loaded, config);
}

#[test]
#[serial]
fn test_cli_argument_wins_over_env() {
    env::set_var(ROOT_ENV_VAR, "/tmp/blackhole-env-root");
    let root = resolve_root_folder(Some(Path::new("/tmp/blackhole-cli-root")), &TomlConfig::default());
    env::remove_var(ROOT_ENV_VAR);

    assert_eq!(root, PathBuf::from("/tmp/blackhole-cli-root"));
}

#[test]
#[serial]
fn test_env_wins_over_toml() {
    env::set_var(ROOT_ENV_VAR, "/tmp/blackhole-env-root");
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/blackhole-toml-root")),
        ..Default::default()
    };
    let root = resolve_root_folder(None, &config);
    env::remove_var(ROOT_ENV_VAR);

    assert_eq!(root, PathBuf::from("/tmp/blackhole-env-root"));
}

#[test]
#[serial]
fn test_toml_root_used_without_env() {
    env::remove_var(ROOT_ENV_VAR);
    let config = TomlConfig {
        root_folder: Some(PathBuf::from("/tmp/blackhole-toml-root")),
        ..Default::default()
    };

    assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/tmp/blackhole-toml-root"));
}
