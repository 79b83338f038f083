//! Configuration sections.
//!
//! Every field has a compiled default, so a file only needs the keys it
//! changes. Durations are kept as strings (`"30s"`, `"10m"`) and parsed on
//! access with [`parse_duration`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ConfigError;

/// Filesystem locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root for per-request workspaces.
    /// Default: ~/.cache/remaster/workspaces
    #[serde(default = "PathsConfig::default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Directory holding `<style>.sf2` soundfonts.
    /// Default: ~/.local/share/remaster/soundfonts
    #[serde(default = "PathsConfig::default_soundfont_dir")]
    pub soundfont_dir: PathBuf,

    /// Directory holding generative model checkpoints.
    /// Default: ~/.local/share/remaster/checkpoints
    #[serde(default = "PathsConfig::default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
}

impl PathsConfig {
    fn default_workspace_root() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.cache_dir().join("remaster/workspaces"))
            .unwrap_or_else(|| PathBuf::from(".cache/remaster/workspaces"))
    }

    fn default_soundfont_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.data_dir().join("remaster/soundfonts"))
            .unwrap_or_else(|| PathBuf::from("data/soundfonts"))
    }

    fn default_checkpoint_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.data_dir().join("remaster/checkpoints"))
            .unwrap_or_else(|| PathBuf::from("checkpoints"))
    }

    /// Soundfont file for a style id.
    pub fn soundfont_for(&self, style: &str) -> PathBuf {
        self.soundfont_dir.join(format!("{style}.sf2"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::default_workspace_root(),
            soundfont_dir: Self::default_soundfont_dir(),
            checkpoint_dir: Self::default_checkpoint_dir(),
        }
    }
}

/// Upload size and per-stage deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Default: 50 MiB
    #[serde(default = "LimitsConfig::default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Default: 30s
    #[serde(default = "LimitsConfig::default_parse_timeout")]
    pub parse_timeout: String,

    /// Default: 180s
    #[serde(default = "LimitsConfig::default_synth_timeout")]
    pub synth_timeout: String,

    /// Default: 60s
    #[serde(default = "LimitsConfig::default_encode_timeout")]
    pub encode_timeout: String,

    /// Default: 10m
    #[serde(default = "LimitsConfig::default_generate_timeout")]
    pub generate_timeout: String,
}

impl LimitsConfig {
    fn default_max_upload_bytes() -> u64 {
        50 * 1024 * 1024
    }

    fn default_parse_timeout() -> String {
        "30s".to_string()
    }

    fn default_synth_timeout() -> String {
        "180s".to_string()
    }

    fn default_encode_timeout() -> String {
        "60s".to_string()
    }

    fn default_generate_timeout() -> String {
        "10m".to_string()
    }

    pub fn parse_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration_key("limits.parse_timeout", &self.parse_timeout)
    }

    pub fn synth_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration_key("limits.synth_timeout", &self.synth_timeout)
    }

    pub fn encode_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration_key("limits.encode_timeout", &self.encode_timeout)
    }

    pub fn generate_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration_key("limits.generate_timeout", &self.generate_timeout)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: Self::default_max_upload_bytes(),
            parse_timeout: Self::default_parse_timeout(),
            synth_timeout: Self::default_synth_timeout(),
            encode_timeout: Self::default_encode_timeout(),
            generate_timeout: Self::default_generate_timeout(),
        }
    }
}

/// Workspace retention and disk watermarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Idle time after which an unleased workspace is removed.
    /// Default: 1h
    #[serde(default = "RetentionConfig::default_max_age")]
    pub max_age: String,

    /// Default: 5m
    #[serde(default = "RetentionConfig::default_sweep_interval")]
    pub sweep_interval: String,

    /// Default: 500
    #[serde(default = "RetentionConfig::default_high_water_mb")]
    pub high_water_mb: u64,

    /// Default: 400
    #[serde(default = "RetentionConfig::default_low_water_mb")]
    pub low_water_mb: u64,
}

impl RetentionConfig {
    fn default_max_age() -> String {
        "1h".to_string()
    }

    fn default_sweep_interval() -> String {
        "5m".to_string()
    }

    fn default_high_water_mb() -> u64 {
        500
    }

    fn default_low_water_mb() -> u64 {
        400
    }

    pub fn max_age(&self) -> Result<Duration, ConfigError> {
        parse_duration_key("retention.max_age", &self.max_age)
    }

    pub fn sweep_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration_key("retention.sweep_interval", &self.sweep_interval)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age: Self::default_max_age(),
            sweep_interval: Self::default_sweep_interval(),
            high_water_mb: Self::default_high_water_mb(),
            low_water_mb: Self::default_low_water_mb(),
        }
    }
}

/// Which synthesizer renders the remapped MIDI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthBackend {
    /// External `fluidsynth` process.
    #[default]
    FluidSynth,
    /// In-process rendering.
    RustySynth,
}

impl SynthBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SynthBackend::FluidSynth => "fluidsynth",
            SynthBackend::RustySynth => "rustysynth",
        }
    }
}

impl fmt::Display for SynthBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SynthBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fluidsynth" => Ok(SynthBackend::FluidSynth),
            "rustysynth" => Ok(SynthBackend::RustySynth),
            other => Err(format!("unknown synth backend: {other}")),
        }
    }
}

/// External tools and render settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default: fluidsynth (looked up on PATH)
    #[serde(default = "ToolsConfig::default_fluidsynth")]
    pub fluidsynth: String,

    /// Default: lame (looked up on PATH)
    #[serde(default = "ToolsConfig::default_lame")]
    pub lame: String,

    /// Default: 44100
    #[serde(default = "ToolsConfig::default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default)]
    pub synth_backend: SynthBackend,
}

impl ToolsConfig {
    fn default_fluidsynth() -> String {
        "fluidsynth".to_string()
    }

    fn default_lame() -> String {
        "lame".to_string()
    }

    fn default_sample_rate() -> u32 {
        44_100
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            fluidsynth: Self::default_fluidsynth(),
            lame: Self::default_lame(),
            sample_rate: Self::default_sample_rate(),
            synth_backend: SynthBackend::default(),
        }
    }
}

/// Generative model service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerativeConfig {
    /// HTTP endpoint of the model service. Generation is unavailable when unset.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Default: facebook/musicgen-melody
    #[serde(default = "GenerativeConfig::default_base_model")]
    pub base_model: String,

    /// Checkpoint path template; `{style}` is replaced by the style id.
    #[serde(default)]
    pub checkpoint_pattern: Option<String>,

    /// Default: 30.0
    #[serde(default = "GenerativeConfig::default_duration_secs")]
    pub duration_secs: f32,

    /// Default: 1.0
    #[serde(default = "GenerativeConfig::default_temperature")]
    pub temperature: f32,

    /// Default: 250
    #[serde(default = "GenerativeConfig::default_top_k")]
    pub top_k: u32,

    /// Default: 0.0
    #[serde(default)]
    pub top_p: f32,
}

impl GenerativeConfig {
    fn default_base_model() -> String {
        "facebook/musicgen-melody".to_string()
    }

    fn default_duration_secs() -> f32 {
        30.0
    }

    fn default_temperature() -> f32 {
        1.0
    }

    fn default_top_k() -> u32 {
        250
    }
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            base_model: Self::default_base_model(),
            checkpoint_pattern: None,
            duration_secs: Self::default_duration_secs(),
            temperature: Self::default_temperature(),
            top_k: Self::default_top_k(),
            top_p: 0.0,
        }
    }
}

/// Logging and trace export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint. Export is off when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Filter directive used when RUST_LOG is absent.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            log_level: Self::default_log_level(),
        }
    }
}

/// Program table override for one style. Unset keys keep the built-in value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleOverride {
    #[serde(default)]
    pub lead: Option<u8>,
    #[serde(default)]
    pub bass: Option<u8>,
    #[serde(default)]
    pub pad: Option<u8>,
    #[serde(default)]
    pub keys: Option<u8>,
    #[serde(default)]
    pub other: Option<u8>,
    #[serde(default)]
    pub kit: Option<u8>,
    /// Category used when the table has no entry for a classified category.
    #[serde(default)]
    pub default_category: Option<String>,
}

impl StyleOverride {
    /// `(key, program)` pairs that are set, in table order.
    pub fn programs(&self) -> impl Iterator<Item = (&'static str, u8)> + '_ {
        [
            ("lead", self.lead),
            ("bass", self.bass),
            ("pad", self.pad),
            ("keys", self.keys),
            ("other", self.other),
            ("kit", self.kit),
        ]
        .into_iter()
        .filter_map(|(key, program)| program.map(|p| (key, p)))
    }
}

/// Parse a duration such as `"500ms"`, `"30s"`, `"10m"` or `"1h"`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(format!("expected a number, got {value:?}"));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|e| format!("bad number in {value:?}: {e}"))?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.saturating_mul(60)),
        "h" => Duration::from_secs(amount.saturating_mul(3600)),
        other => return Err(format!("unknown duration unit {other:?} in {value:?}")),
    };
    Ok(duration)
}

fn parse_duration_key(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|message| ConfigError::Invalid {
        key: key.to_string(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 45 ").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_limits_defaults_parse() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.parse_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(limits.generate_timeout().unwrap(), Duration::from_secs(600));
        assert_eq!(limits.max_upload_bytes, 52_428_800);
    }

    #[test]
    fn test_bad_duration_names_key() {
        let limits = LimitsConfig {
            synth_timeout: "soon".to_string(),
            ..Default::default()
        };
        let err = limits.synth_timeout().unwrap_err();
        assert!(err.to_string().contains("limits.synth_timeout"));
    }

    #[test]
    fn test_synth_backend_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            backend: SynthBackend,
        }
        let w: Wrapper = toml::from_str("backend = \"rustysynth\"").unwrap();
        assert_eq!(w.backend, SynthBackend::RustySynth);
        assert_eq!("FluidSynth".parse::<SynthBackend>().unwrap(), SynthBackend::FluidSynth);
    }

    #[test]
    fn test_style_override_programs() {
        let o = StyleOverride {
            lead: Some(81),
            kit: Some(8),
            ..Default::default()
        };
        let set: Vec<_> = o.programs().collect();
        assert_eq!(set, vec![("lead", 81), ("kit", 8)]);
    }
}
