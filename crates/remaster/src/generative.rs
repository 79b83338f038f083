//! Generative augmentation: condition a music model on the baseline render.
//!
//! Checkpoint lookup never blocks generation. When no fine-tuned checkpoint
//! resolves for a style the base model is used and the run records
//! `fallback_to_base`. Only an explicitly requested checkpoint that does not
//! exist is an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use remasterconf::GenerativeConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::error::{ErrorBody, ErrorCode, RemasterError};
use crate::styles::ConsoleStyle;

/// Which checkpoint a run generates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSelection {
    pub path: Option<PathBuf>,
    /// File name recorded in provenance.
    pub id: Option<String>,
    pub fallback_to_base: bool,
}

impl CheckpointSelection {
    fn found(path: PathBuf) -> Self {
        let id = path.file_name().map(|n| n.to_string_lossy().into_owned());
        Self {
            path: Some(path),
            id,
            fallback_to_base: false,
        }
    }

    fn base() -> Self {
        Self {
            path: None,
            id: None,
            fallback_to_base: true,
        }
    }
}

/// Resolve the checkpoint for `style`.
///
/// Order: explicit id (`<dir>/<id>` or `<dir>/<id>.pt`), `pattern` with
/// `{style}` substituted, `<dir>/best_model_<style>.pt`, and for snes only
/// `<dir>/best_model.pt`.
pub fn resolve_checkpoint(
    style: ConsoleStyle,
    requested: Option<&str>,
    checkpoint_dir: &Path,
    pattern: Option<&str>,
) -> Result<CheckpointSelection, RemasterError> {
    if let Some(id) = requested {
        let not_found = || RemasterError::CheckpointNotFound {
            style: style.to_string(),
            checkpoint: id.to_string(),
        };
        let name = scratch::validate_filename(id).map_err(|_| not_found())?;
        let mut candidates = vec![checkpoint_dir.join(name)];
        if !name.ends_with(".pt") {
            candidates.push(checkpoint_dir.join(format!("{name}.pt")));
        }
        return candidates
            .into_iter()
            .find(|p| p.is_file())
            .map(CheckpointSelection::found)
            .ok_or_else(not_found);
    }

    let mut candidates = Vec::new();
    if let Some(pattern) = pattern {
        let path = PathBuf::from(pattern.replace("{style}", style.as_str()));
        candidates.push(if path.is_absolute() {
            path
        } else {
            checkpoint_dir.join(path)
        });
    }
    candidates.push(checkpoint_dir.join(format!("best_model_{style}.pt")));
    if style == ConsoleStyle::Snes {
        candidates.push(checkpoint_dir.join("best_model.pt"));
    }

    Ok(candidates
        .into_iter()
        .find(|p| p.is_file())
        .map(CheckpointSelection::found)
        .unwrap_or_else(CheckpointSelection::base))
}

/// Styles that have a fine-tuned checkpoint on disk.
pub fn available_checkpoint_styles(checkpoint_dir: &Path, pattern: Option<&str>) -> Vec<ConsoleStyle> {
    ConsoleStyle::ALL
        .into_iter()
        .filter(|&style| {
            resolve_checkpoint(style, None, checkpoint_dir, pattern)
                .map(|s| !s.fallback_to_base)
                .unwrap_or(false)
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("no generative endpoint is configured")]
    Unavailable,

    #[error("generation did not finish within {0:?}")]
    Timeout(Duration),

    #[error("could not read prompt audio {}: {source}", path.display())]
    Prompt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("bad generation response: {0}")]
    Response(String),
}

impl GenerateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable => ErrorCode::MlUnavailable,
            Self::Timeout(_) => ErrorCode::GenerationTimeout,
            _ => ErrorCode::GenerationFailed,
        }
    }

    /// Boundary form for `generative_error`.
    pub fn to_body(&self) -> ErrorBody {
        let detail = match self {
            Self::Unavailable => "Generative mode is not available on this server".to_string(),
            Self::Timeout(after) => format!("Generation timed out after {}s", after.as_secs()),
            _ => "Generation failed; baseline audio is still available".to_string(),
        };
        ErrorBody::new(self.code(), detail).with_debug(self.to_string())
    }
}

/// Everything a model call needs.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt_wav: Vec<u8>,
    pub style: ConsoleStyle,
    pub description: String,
    pub checkpoint: Option<PathBuf>,
    pub model: String,
    pub duration_secs: f32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
}

#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// WAV bytes.
    pub wav: Vec<u8>,
    pub sample_rate: Option<u32>,
}

#[async_trait]
pub trait AudioGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedAudio, GenerateError>;
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    audio_base64: String,
    style: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    checkpoint: Option<String>,
    model: &'a str,
    duration: f32,
    temperature: f32,
    top_k: u32,
    top_p: f32,
}

#[derive(Deserialize)]
struct GenerateReply {
    audio_base64: String,
    #[serde(default)]
    sample_rate: Option<u32>,
}

/// HTTP client for a MusicGen-style melody-conditioned service.
///
/// Calls are serialized: the model behind the endpoint is not assumed to be
/// reentrant.
#[derive(Debug)]
pub struct MusicgenClient {
    http: reqwest::Client,
    endpoint: String,
    lock: Mutex<()>,
}

impl MusicgenClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GenerateError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GenerateError::Request(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl AudioGenerator for MusicgenClient {
    fn name(&self) -> &str {
        "musicgen"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedAudio, GenerateError> {
        let body = GenerateBody {
            audio_base64: BASE64.encode(&request.prompt_wav),
            style: request.style.as_str(),
            description: &request.description,
            checkpoint: request
                .checkpoint
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            model: &request.model,
            duration: request.duration_secs,
            temperature: request.temperature,
            top_k: request.top_k,
            top_p: request.top_p,
        };

        let _guard = self.lock.lock().await;
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| GenerateError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GenerateError::Request(format!("HTTP {status}: {text}")));
        }

        let reply: GenerateReply = response
            .json()
            .await
            .map_err(|e| GenerateError::Response(e.to_string()))?;
        let wav = BASE64
            .decode(reply.audio_base64.as_bytes())
            .map_err(|e| GenerateError::Response(format!("audio_base64: {e}")))?;
        if wav.is_empty() {
            return Err(GenerateError::Response("empty audio".to_string()));
        }
        Ok(GeneratedAudio {
            wav,
            sample_rate: reply.sample_rate,
        })
    }
}

/// Turns a baseline WAV into generated audio, within a deadline.
pub struct GenerativeAdapter {
    generator: Option<Arc<dyn AudioGenerator>>,
    settings: GenerativeConfig,
    timeout: Duration,
}

impl std::fmt::Debug for GenerativeAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerativeAdapter")
            .field("generator", &self.generator.as_ref().map(|g| g.name().to_string()))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl GenerativeAdapter {
    pub fn new(
        generator: Option<Arc<dyn AudioGenerator>>,
        settings: GenerativeConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            settings,
            timeout,
        }
    }

    /// Adapter over the configured HTTP endpoint, or an unavailable one.
    pub fn from_config(settings: &GenerativeConfig, timeout: Duration) -> Result<Self, GenerateError> {
        let generator = match &settings.endpoint {
            Some(endpoint) => {
                Some(Arc::new(MusicgenClient::new(endpoint.clone(), timeout)?) as Arc<dyn AudioGenerator>)
            }
            None => None,
        };
        Ok(Self::new(generator, settings.clone(), timeout))
    }

    pub fn with_generator(mut self, generator: Arc<dyn AudioGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn is_available(&self) -> bool {
        self.generator.is_some()
    }

    /// Generate from `prompt_wav`. The deadline covers the whole call.
    #[instrument(skip(self, prompt_wav, selection), fields(checkpoint = ?selection.id))]
    pub async fn generate(
        &self,
        prompt_wav: &Path,
        style: ConsoleStyle,
        description: Option<&str>,
        selection: &CheckpointSelection,
    ) -> Result<GeneratedAudio, GenerateError> {
        let generator = self.generator.as_ref().ok_or(GenerateError::Unavailable)?;
        let prompt = tokio::fs::read(prompt_wav)
            .await
            .map_err(|source| GenerateError::Prompt {
                path: prompt_wav.to_path_buf(),
                source,
            })?;

        let request = GenerationRequest {
            prompt_wav: prompt,
            style,
            description: description_or_default(description, style),
            checkpoint: selection.path.clone(),
            model: self.settings.base_model.clone(),
            duration_secs: self.settings.duration_secs,
            temperature: self.settings.temperature,
            top_k: self.settings.top_k,
            top_p: self.settings.top_p,
        };

        info!(generator = generator.name(), fallback = selection.fallback_to_base, "generating");
        match tokio::time::timeout(self.timeout, generator.generate(request)).await {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Timeout(self.timeout)),
        }
    }
}

/// `"<style> style video game music"` when no description was given.
pub fn description_or_default(description: Option<&str>, style: ConsoleStyle) -> String {
    match description.map(str::trim) {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => format!("{style} style video game music"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl AudioGenerator for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _: GenerationRequest) -> Result<GeneratedAudio, GenerateError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(GeneratedAudio {
                wav: vec![1],
                sample_rate: None,
            })
        }
    }

    #[test]
    fn test_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let d = dir.path();

        let sel = resolve_checkpoint(ConsoleStyle::Wii, None, d, None).unwrap();
        assert!(sel.fallback_to_base);
        assert_eq!(sel.id, None);

        std::fs::write(d.join("best_model.pt"), b"x").unwrap();
        let snes = resolve_checkpoint(ConsoleStyle::Snes, None, d, None).unwrap();
        assert_eq!(snes.id.as_deref(), Some("best_model.pt"));
        let gba = resolve_checkpoint(ConsoleStyle::Gba, None, d, None).unwrap();
        assert!(gba.fallback_to_base);

        std::fs::write(d.join("best_model_snes.pt"), b"x").unwrap();
        let snes = resolve_checkpoint(ConsoleStyle::Snes, None, d, None).unwrap();
        assert_eq!(snes.id.as_deref(), Some("best_model_snes.pt"));

        std::fs::write(d.join("custom-snes.pt"), b"x").unwrap();
        let snes = resolve_checkpoint(ConsoleStyle::Snes, None, d, Some("custom-{style}.pt")).unwrap();
        assert_eq!(snes.id.as_deref(), Some("custom-snes.pt"));
    }

    #[test]
    fn test_explicit_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mine.pt"), b"x").unwrap();

        let sel = resolve_checkpoint(ConsoleStyle::Nds, Some("mine"), dir.path(), None).unwrap();
        assert_eq!(sel.id.as_deref(), Some("mine.pt"));
        assert!(!sel.fallback_to_base);

        for bad in ["missing.pt", "../mine.pt"] {
            let err = resolve_checkpoint(ConsoleStyle::Nds, Some(bad), dir.path(), None).unwrap_err();
            assert_eq!(err.code(), ErrorCode::CheckpointNotFound, "{bad}");
        }
    }

    #[test]
    fn test_default_description() {
        assert_eq!(
            description_or_default(None, ConsoleStyle::Ps2),
            "ps2 style video game music"
        );
        assert_eq!(description_or_default(Some("  "), ConsoleStyle::Gba), "gba style video game music");
        assert_eq!(description_or_default(Some("boss fight"), ConsoleStyle::Gba), "boss fight");
    }

    #[tokio::test]
    async fn test_unavailable_without_generator() {
        let adapter = GenerativeAdapter::new(None, GenerativeConfig::default(), Duration::from_secs(1));
        let err = adapter
            .generate(Path::new("/nonexistent.wav"), ConsoleStyle::Snes, None, &CheckpointSelection::base())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MlUnavailable);
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("render.wav");
        std::fs::write(&wav, b"RIFF").unwrap();

        let adapter = GenerativeAdapter::new(
            Some(Arc::new(Slow)),
            GenerativeConfig::default(),
            Duration::from_millis(50),
        );
        let err = adapter
            .generate(&wav, ConsoleStyle::Snes, None, &CheckpointSelection::base())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::GenerationTimeout);
        assert_eq!(err.to_body().code, ErrorCode::GenerationTimeout);
    }
}
