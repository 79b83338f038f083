//! Files merge in order over compiled defaults.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use remasterconf::{ConfigError, RemasterConfig, SynthBackend};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn later_files_win_key_by_key() {
    let dir = TempDir::new().unwrap();
    let system = write(
        &dir,
        "system.toml",
        r#"
[paths]
soundfont_dir = "/usr/share/remaster/sf2"

[limits]
max_upload_bytes = 1048576
synth_timeout = "2m"

[styles.snes]
lead = 80
bass = 33
"#,
    );
    let local = write(
        &dir,
        "local.toml",
        r#"
[limits]
synth_timeout = "45s"

[tools]
synth_backend = "rustysynth"

[styles.snes]
lead = 81
"#,
    );

    let (config, sources) = RemasterConfig::from_files(&[system.clone(), local.clone()]).unwrap();

    assert_eq!(sources.files, vec![system, local]);
    assert_eq!(config.paths.soundfont_dir, PathBuf::from("/usr/share/remaster/sf2"));
    assert_eq!(config.limits.max_upload_bytes, 1_048_576);
    assert_eq!(config.limits.synth_timeout().unwrap(), Duration::from_secs(45));
    assert_eq!(config.limits.parse_timeout().unwrap(), Duration::from_secs(30));
    assert_eq!(config.tools.synth_backend, SynthBackend::RustySynth);
    assert_eq!(config.styles["snes"].lead, Some(81));
    assert_eq!(config.styles["snes"].bass, Some(33));
    assert!(sources.env_overrides.is_empty());
}

#[test]
fn no_files_means_defaults() {
    let (config, sources) = RemasterConfig::from_files(&[]).unwrap();
    assert!(sources.files.is_empty());
    assert_eq!(config.limits, RemasterConfig::default().limits);
    assert_eq!(config.retention, RemasterConfig::default().retention);
}

#[test]
fn missing_file_is_a_read_error() {
    let dir = TempDir::new().unwrap();
    let err = RemasterConfig::from_files(&[dir.path().join("absent.toml")]).unwrap_err();
    assert!(matches!(err, ConfigError::FileRead { .. }));
}

#[test]
fn malformed_file_names_its_path() {
    let dir = TempDir::new().unwrap();
    let good = write(&dir, "good.toml", "[tools]\nlame = \"lame\"\n");
    let bad = write(&dir, "bad.toml", "[tools\nlame = ");

    let err = RemasterConfig::from_files(&[good, bad.clone()]).unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, bad),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn unknown_backend_rejected() {
    let dir = TempDir::new().unwrap();
    let bad = write(&dir, "bad.toml", "[tools]\nsynth_backend = \"timidity\"\n");
    assert!(matches!(
        RemasterConfig::from_files(&[bad]),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn cli_path_replaces_local_file() {
    let dir = TempDir::new().unwrap();
    let cli = write(&dir, "cli.toml", "[retention]\nhigh_water_mb = 900\n");
    let files = remasterconf::discover_config_files_with_override(Some(&cli));
    assert_eq!(files.last(), Some(&cli));
    assert!(!files.iter().any(|p| p == &PathBuf::from("remaster.toml")));
}
