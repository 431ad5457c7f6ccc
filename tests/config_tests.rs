//! Config loading, TOML parsing, and env var override tests.

use groundlog::Config;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

#[test]
fn test_config_defaults() {
    let config = Config::default();
    assert_eq!(config.analysis.max_refinement_passes, 3);
    assert!(config.analysis.relationalize);
    assert!(config.analysis.match_coverage);
    assert!(!config.analysis.hybrid_backend);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_config_missing_file_uses_defaults() {
    let config = Config::load_from(Path::new("/definitely/not/here.toml")).expect("defaults");
    assert_eq!(config.analysis.max_refinement_passes, 3);
}

#[test]
fn test_config_toml_overrides() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("groundlog.toml");
    fs::write(
        &path,
        "[analysis]\n\
         max_refinement_passes = 7\n\
         relationalize = false\n\
         \n\
         [logging]\n\
         level = \"debug\"\n",
    )
    .expect("write config");

    let config = Config::load_from(&path).expect("parses");
    assert_eq!(config.analysis.max_refinement_passes, 7);
    assert!(!config.analysis.relationalize);
    // untouched fields keep their defaults
    assert!(config.analysis.match_coverage);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_config_partial_section() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("groundlog.toml");
    fs::write(&path, "[analysis]\nhybrid_backend = true\n").expect("write config");

    let config = Config::load_from(&path).expect("parses");
    assert!(config.analysis.hybrid_backend);
    assert_eq!(config.analysis.max_refinement_passes, 3);
}

#[test]
fn test_config_env_override() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("groundlog.toml");
    fs::write(&path, "[analysis]\nhybrid_backend = false\n").expect("write config");

    // no other test reads hybrid_backend through the env, so this does not
    // race with parallel config loads
    std::env::set_var("GROUNDLOG_ANALYSIS__HYBRID_BACKEND", "true");
    let config = Config::load_from(&path).expect("parses");
    std::env::remove_var("GROUNDLOG_ANALYSIS__HYBRID_BACKEND");

    assert!(config.analysis.hybrid_backend);
}

#[test]
fn test_config_zero_passes_disables_improvement() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("groundlog.toml");
    fs::write(&path, "[analysis]\nmax_refinement_passes = 0\n").expect("write config");

    let config = Config::load_from(&path).expect("parses");
    assert_eq!(config.analysis.max_refinement_passes, 0);
}
