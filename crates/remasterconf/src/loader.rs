//! Config file discovery, table merging, and environment variable overlay.

use crate::{ConfigError, RemasterConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/remaster/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("remaster/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("remaster.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
///
/// The table is also checked against [`RemasterConfig`] so type errors name
/// the file they came from rather than the merged result.
pub fn load_from_file(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    toml::Value::Table(table.clone())
        .try_into::<RemasterConfig>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(table)
}

/// Merge `overlay` into `base`, recursing into tables so a file that sets one
/// key of a section keeps the rest of that section from earlier files.
/// Arrays and scalars are replaced whole.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Deserialize a merged table; missing keys take their compiled defaults.
pub fn config_from_table(table: toml::Table) -> Result<RemasterConfig, ConfigError> {
    let mut config: RemasterConfig = toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: PathBuf::from("<merged>"),
            message: e.to_string(),
        })?;
    config.paths.workspace_root = expand_path(&config.paths.workspace_root.to_string_lossy());
    config.paths.soundfont_dir = expand_path(&config.paths.soundfont_dir.to_string_lossy());
    config.paths.checkpoint_dir = expand_path(&config.paths.checkpoint_dir.to_string_lossy());
    Ok(config)
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut RemasterConfig, sources: &mut ConfigSources) {
    apply_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides_from<F>(config: &mut RemasterConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = take(&lookup, sources, "REMASTER_WORKSPACE_ROOT") {
        config.paths.workspace_root = expand_path(&v);
    }
    if let Some(v) = take(&lookup, sources, "REMASTER_SOUNDFONT_DIR") {
        config.paths.soundfont_dir = expand_path(&v);
    }
    if let Some(v) = take(&lookup, sources, "REMASTER_CHECKPOINT_DIR") {
        config.paths.checkpoint_dir = expand_path(&v);
    }

    // Numeric and enum overrides only count when they parse.
    if let Some(v) = lookup("REMASTER_MAX_UPLOAD_BYTES") {
        if let Ok(bytes) = v.trim().parse() {
            config.limits.max_upload_bytes = bytes;
            sources.env_overrides.push("REMASTER_MAX_UPLOAD_BYTES".to_string());
        }
    }
    if let Some(v) = lookup("REMASTER_SYNTH_BACKEND") {
        if let Ok(backend) = v.parse() {
            config.tools.synth_backend = backend;
            sources.env_overrides.push("REMASTER_SYNTH_BACKEND".to_string());
        }
    }

    if let Some(v) = take(&lookup, sources, "REMASTER_GENERATIVE_ENDPOINT") {
        config.generative.endpoint = Some(v);
    }
    // `{soundfont}` is accepted as an alias for `{style}`.
    if let Some(v) = take(&lookup, sources, "MUSICGEN_CHECKPOINT_PATH") {
        config.generative.checkpoint_pattern = Some(v.replace("{soundfont}", "{style}"));
    }

    if let Some(v) = take(&lookup, sources, "REMASTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    // Also support standard OTEL env var
    if let Some(v) = take(&lookup, sources, "OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
    }
    if let Some(v) = take(&lookup, sources, "REMASTER_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }
    if let Some(v) = take(&lookup, sources, "RUST_LOG") {
        config.telemetry.log_level = v;
    }
}

fn take<F>(lookup: &F, sources: &mut ConfigSources, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key)?;
    sources.env_overrides.push(key.to_string());
    Some(value)
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        return directories::BaseDirs::new()
            .map(|d| d.home_dir().join(stripped))
            .unwrap_or_else(|| PathBuf::from(path));
    }

    if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        let (var_name, rest) = match stripped.find('/') {
            Some(pos) => (&stripped[..pos], Some(&stripped[pos + 1..])),
            None => (stripped, None),
        };
        return match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        };
    }

    PathBuf::from(path)
}
