//! Layered configuration for the console remaster pipeline.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins), merged table by table:
//! 1. `/etc/remaster/config.toml` (system)
//! 2. `~/.config/remaster/config.toml` (user)
//! 3. `./remaster.toml`, or the path given with `--config`
//! 4. Environment variables (`REMASTER_*`, `MUSICGEN_CHECKPOINT_PATH`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! workspace_root = "~/.cache/remaster/workspaces"
//! soundfont_dir = "/srv/remaster/soundfonts"
//!
//! [limits]
//! max_upload_bytes = 52428800
//! parse_timeout = "30s"
//!
//! [retention]
//! max_age = "1h"
//! high_water_mb = 500
//!
//! [tools]
//! synth_backend = "fluidsynth"
//!
//! [generative]
//! endpoint = "http://127.0.0.1:2000/generate"
//! checkpoint_pattern = "/models/best_model_{style}.pt"
//!
//! [styles.gba]
//! keys = 4
//!
//! [classifier]
//! tie_epsilon = 0.08
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use sections::{
    parse_duration, GenerativeConfig, LimitsConfig, PathsConfig, RetentionConfig, StyleOverride,
    SynthBackend, TelemetryConfig, ToolsConfig,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Complete remaster configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemasterConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub generative: GenerativeConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Program table overrides keyed by style id.
    #[serde(default)]
    pub styles: BTreeMap<String, StyleOverride>,

    /// Classifier weight overrides. Kept as raw TOML; the classifier owns
    /// the field names and defaults.
    #[serde(default)]
    pub classifier: toml::Table,
}

impl RemasterConfig {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./remaster.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        let (mut config, mut sources) = Self::from_files(&files)?;

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Merge the given files in order over the compiled defaults.
    ///
    /// No discovery and no environment overlay.
    pub fn from_files(files: &[PathBuf]) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in files {
            let table = loader::load_from_file(path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path.clone());
        }

        let config = loader::config_from_table(merged)?;
        Ok((config, sources))
    }

    /// Check values that parse as TOML but make no sense together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.parse_timeout()?;
        self.limits.synth_timeout()?;
        self.limits.encode_timeout()?;
        self.limits.generate_timeout()?;
        self.retention.max_age()?;
        let interval = self.retention.sweep_interval()?;
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "retention.sweep_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.retention.low_water_mb > self.retention.high_water_mb {
            return Err(ConfigError::Invalid {
                key: "retention.low_water_mb".to_string(),
                message: format!(
                    "{} is above high_water_mb {}",
                    self.retention.low_water_mb, self.retention.high_water_mb
                ),
            });
        }
        if self.tools.sample_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "tools.sample_rate".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand to keep section order and comments stable.
        let mut output = String::new();

        output.push_str("# Console Remaster Configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "workspace_root = {}\n",
            quoted(&self.paths.workspace_root.to_string_lossy())
        ));
        output.push_str(&format!(
            "soundfont_dir = {}\n",
            quoted(&self.paths.soundfont_dir.to_string_lossy())
        ));
        output.push_str(&format!(
            "checkpoint_dir = {}\n",
            quoted(&self.paths.checkpoint_dir.to_string_lossy())
        ));

        output.push_str("\n[limits]\n");
        output.push_str(&format!("max_upload_bytes = {}\n", self.limits.max_upload_bytes));
        output.push_str(&format!("parse_timeout = {}\n", quoted(&self.limits.parse_timeout)));
        output.push_str(&format!("synth_timeout = {}\n", quoted(&self.limits.synth_timeout)));
        output.push_str(&format!("encode_timeout = {}\n", quoted(&self.limits.encode_timeout)));
        output.push_str(&format!(
            "generate_timeout = {}\n",
            quoted(&self.limits.generate_timeout)
        ));

        output.push_str("\n[retention]\n");
        output.push_str(&format!("max_age = {}\n", quoted(&self.retention.max_age)));
        output.push_str(&format!(
            "sweep_interval = {}\n",
            quoted(&self.retention.sweep_interval)
        ));
        output.push_str(&format!("high_water_mb = {}\n", self.retention.high_water_mb));
        output.push_str(&format!("low_water_mb = {}\n", self.retention.low_water_mb));

        output.push_str("\n[tools]\n");
        output.push_str(&format!("fluidsynth = {}\n", quoted(&self.tools.fluidsynth)));
        output.push_str(&format!("lame = {}\n", quoted(&self.tools.lame)));
        output.push_str(&format!("sample_rate = {}\n", self.tools.sample_rate));
        output.push_str(&format!(
            "synth_backend = {}\n",
            quoted(self.tools.synth_backend.as_str())
        ));

        output.push_str("\n[generative]\n");
        match &self.generative.endpoint {
            Some(endpoint) => output.push_str(&format!("endpoint = {}\n", quoted(endpoint))),
            None => output.push_str("# endpoint = \"http://127.0.0.1:2000/generate\"\n"),
        }
        output.push_str(&format!("base_model = {}\n", quoted(&self.generative.base_model)));
        if let Some(pattern) = &self.generative.checkpoint_pattern {
            output.push_str(&format!("checkpoint_pattern = {}\n", quoted(pattern)));
        }
        output.push_str(&format!(
            "duration_secs = {:?}\n",
            self.generative.duration_secs
        ));
        output.push_str(&format!("temperature = {:?}\n", self.generative.temperature));
        output.push_str(&format!("top_k = {}\n", self.generative.top_k));
        output.push_str(&format!("top_p = {:?}\n", self.generative.top_p));

        output.push_str("\n[telemetry]\n");
        match &self.telemetry.otlp_endpoint {
            Some(endpoint) => output.push_str(&format!("otlp_endpoint = {}\n", quoted(endpoint))),
            None => output.push_str("# otlp_endpoint = \"127.0.0.1:4317\"\n"),
        }
        output.push_str(&format!("log_level = {}\n", quoted(&self.telemetry.log_level)));

        for (style, table) in &self.styles {
            output.push_str(&format!("\n[styles.{style}]\n"));
            for (key, program) in table.programs() {
                output.push_str(&format!("{key} = {program}\n"));
            }
            if let Some(category) = &table.default_category {
                output.push_str(&format!("default_category = {}\n", quoted(category)));
            }
        }

        if !self.classifier.is_empty() {
            output.push_str("\n[classifier]\n");
            for (key, value) in &self.classifier {
                output.push_str(&format!("{key} = {value}\n"));
            }
        }

        output
    }
}

/// A TOML basic string with escaping.
fn quoted(s: &str) -> String {
    toml::Value::String(s.to_string()).to_string()
}
