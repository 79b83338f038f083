//! One remaster request, end to end.
//!
//! intake → workspace → parse → classify → remap → render (→ alternate)
//! (→ generate) → provenance → response
//!
//! Input problems fail before a workspace exists. Anything that fails after
//! that discards the workspace. Render and generation problems degrade the
//! response instead of failing it.

use std::sync::Arc;

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use midi_analysis::{classify_all, extract_channel_features, to_smf_bytes, ClassifierWeights};
use remasterconf::RemasterConfig;
use scratch::{LeasedArtifact, ScratchConfig, WorkspaceLease, WorkspaceManager};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::capabilities::Capabilities;
use crate::error::{ErrorBody, ErrorCode, RemasterError, Result};
use crate::events::{EventLog, PipelineEvent};
use crate::generative::{resolve_checkpoint, AudioGenerator, CheckpointSelection, GenerativeAdapter};
use crate::intake::{self, Mode, RemasterRequest, ValidatedRequest};
use crate::mapper::{self, ChannelRemap};
use crate::metadata::{RunMetadata, METADATA_FILE};
use crate::render::{Encoder, RenderJob, RenderOutcome, Renderer, Synthesizer};
use crate::styles::{self, ConsoleStyle, StyleBank};

pub const GENERATED_WAV: &str = "generated.wav";
pub const GENERATED_MP3: &str = "generated.mp3";

/// A downloadable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: String,
    pub request_id: String,
    pub filename: String,
    /// `/download/<kind>/<id>/<file>`
    pub url: String,
}

impl ArtifactRef {
    fn new(kind: &str, request_id: &str, filename: &str) -> Self {
        Self {
            kind: kind.to_string(),
            request_id: request_id.to_string(),
            filename: filename.to_string(),
            url: format!("/download/{kind}/{request_id}/{filename}"),
        }
    }
}

/// The encoded file when encoding finished, else the WAV if it survived.
fn served_audio(
    outcome: &RenderOutcome,
    kind: &str,
    id: &str,
    encoded_name: &str,
    wav_name: &str,
) -> Option<ArtifactRef> {
    match (&outcome.audio, &outcome.wav) {
        (Some(_), _) => Some(ArtifactRef::new(kind, id, encoded_name)),
        (None, Some(_)) => Some(ArtifactRef::new(kind, id, wav_name)),
        (None, None) => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemasterResponse {
    pub request_id: String,
    pub mode: Mode,
    pub style: ConsoleStyle,
    /// The remapped MIDI. Always present on success.
    pub midi: ArtifactRef,
    pub audio: Option<ArtifactRef>,
    pub audio_error: Option<ErrorBody>,
    pub audio_b: Option<ArtifactRef>,
    pub audio_b_error: Option<ErrorBody>,
    pub generated: Option<ArtifactRef>,
    pub generative_error: Option<ErrorBody>,
    pub classifications: Vec<ChannelRemap>,
    pub metadata: RunMetadata,
    pub metadata_ref: ArtifactRef,
    pub logs: Vec<PipelineEvent>,
}

/// Shared, immutable pipeline state. One instance serves concurrent requests.
pub struct Pipeline {
    config: RemasterConfig,
    workspaces: Arc<WorkspaceManager>,
    styles: &'static StyleBank,
    capabilities: Capabilities,
    renderer: Renderer,
    generative: GenerativeAdapter,
    weights: ClassifierWeights,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("workspace_root", &self.workspaces.root())
            .field("renderer", &self.renderer)
            .field("generative", &self.generative)
            .finish()
    }
}

impl Pipeline {
    /// Build from config and the capabilities detected at startup.
    ///
    /// Installs the style tables (with `[styles.*]` overrides) process-wide.
    pub fn new(config: RemasterConfig, capabilities: Capabilities) -> anyhow::Result<Self> {
        let scratch = ScratchConfig {
            root: config.paths.workspace_root.clone(),
            max_age: config.retention.max_age()?,
            sweep_interval: config.retention.sweep_interval()?,
            ..ScratchConfig::default()
        }
        .with_watermarks_mb(config.retention.high_water_mb, config.retention.low_water_mb);
        let workspaces = WorkspaceManager::new(scratch).context("Failed to open workspace root")?;

        let bank = StyleBank::with_overrides(&config.styles).context("Invalid [styles] override")?;
        let styles = match styles::install(bank) {
            Ok(installed) => installed,
            Err(rejected) => {
                let current = styles::global();
                if &rejected != current {
                    warn!("style tables already installed; ignoring differing overrides");
                }
                current
            }
        };

        let weights: ClassifierWeights = toml::Value::Table(config.classifier.clone())
            .try_into()
            .context("Invalid [classifier] weights")?;

        let renderer = Renderer::from_config(&config, &capabilities)?;
        let generative =
            GenerativeAdapter::from_config(&config.generative, config.limits.generate_timeout()?)
                .context("Failed to set up generative client")?;

        Ok(Self {
            config,
            workspaces,
            styles,
            capabilities,
            renderer,
            generative,
            weights,
        })
    }

    pub fn with_synthesizer(mut self, synth: Arc<dyn Synthesizer>) -> Self {
        self.renderer = self.renderer.with_synthesizer(synth);
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.renderer = self.renderer.with_encoder(encoder);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn AudioGenerator>) -> Self {
        self.generative = self.generative.with_generator(generator);
        self
    }

    pub fn with_styles(mut self, styles: &'static StyleBank) -> Self {
        self.styles = styles;
        self
    }

    pub fn styles(&self) -> &'static StyleBank {
        self.styles
    }

    pub fn weights(&self) -> &ClassifierWeights {
        &self.weights
    }

    pub fn config(&self) -> &RemasterConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    /// A stored artifact for download. The workspace stays leased until the
    /// returned handle is dropped.
    pub fn resolve_download(&self, request_id: &str, filename: &str) -> Result<LeasedArtifact> {
        Ok(self.workspaces.resolve_artifact(request_id, filename)?)
    }

    #[instrument(
        name = "remaster.run",
        skip(self, request),
        fields(
            style = %request.style,
            mode = %request.mode,
            request.id = tracing::field::Empty,
        )
    )]
    pub async fn run(&self, request: RemasterRequest) -> Result<RemasterResponse> {
        let validated = intake::validate(&request, self.config.limits.max_upload_bytes)?;

        let selection = match validated.mode {
            Mode::Baseline => None,
            Mode::Ml => {
                if !self.generative.is_available() {
                    return Err(RemasterError::MlUnavailable(
                        "no generative endpoint is configured".to_string(),
                    ));
                }
                Some(resolve_checkpoint(
                    validated.style,
                    validated.checkpoint.as_deref(),
                    &self.config.paths.checkpoint_dir,
                    self.config.generative.checkpoint_pattern.as_deref(),
                )?)
            }
        };

        let lease = self.workspaces.create()?;
        tracing::Span::current().record("request.id", lease.id().as_str());

        let result = self.run_in(&lease, &validated, &request.bytes, selection).await;
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(code = %e.code(), error = %e, "request failed; discarding workspace");
                lease.discard();
                Err(e)
            }
        }
    }

    async fn run_in(
        &self,
        lease: &WorkspaceLease,
        req: &ValidatedRequest,
        bytes: &[u8],
        selection: Option<CheckpointSelection>,
    ) -> Result<RemasterResponse> {
        let id = lease.id().as_str().to_string();
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut log = EventLog::new(&id);

        lease.write_artifact(&req.input_name, bytes).await?;
        log.info("upload", format!("received {} ({} bytes)", req.input_name, bytes.len()));

        let data = bytes.to_vec();
        let timeout = self
            .config
            .limits
            .parse_timeout()
            .map_err(|e| RemasterError::Processing(e.to_string()))?;
        let mut doc =
            tokio::task::spawn_blocking(move || midi_analysis::load_with_timeout(&data, timeout))
                .await
                .map_err(|e| RemasterError::Processing(format!("parse task failed: {e}")))??;
        log.info(
            "parse",
            format!(
                "format {}, {} tracks, {} ticks",
                doc.format.as_u16(),
                doc.tracks.len(),
                doc.total_ticks()
            ),
        );

        let features = extract_channel_features(&doc);
        let classifications = classify_all(features.values(), &self.weights);
        for c in &classifications {
            debug!(channel = c.channel, category = %c.category, confidence = c.confidence, "classified");
        }
        log.info("classify", format!("classified {} channels", classifications.len()));

        let report = mapper::remap(&mut doc, &classifications, req.style, self.styles);
        let midi_name = format!("remapped_{}.mid", req.stem);
        let midi_path = lease.write_artifact(&midi_name, &to_smf_bytes(&doc)).await?;
        log.info("remap", format!("mapped {} channels to {} programs", report.channels.len(), req.style));

        let audio_name = format!("{}.mp3", req.stem);
        let wav_name = format!("{}.wav", req.stem);
        let primary = self
            .renderer
            .render(
                &RenderJob {
                    midi: midi_path.clone(),
                    soundfont: self.config.paths.soundfont_for(req.style.as_str()),
                    wav: lease.artifact_path(&wav_name)?,
                    audio: lease.artifact_path(&audio_name)?,
                    keep_wav: selection.is_some(),
                },
                &mut log,
                "render",
            )
            .await;
        let audio = served_audio(&primary, "audio", &id, &audio_name, &wav_name);

        let (audio_b, audio_b_error) = match req.alternate {
            Some(alternate) => {
                let name = format!("{}_b.mp3", req.stem);
                let b_wav_name = format!("{}_b.wav", req.stem);
                let outcome = self
                    .renderer
                    .render(
                        &RenderJob {
                            midi: midi_path.clone(),
                            soundfont: self.config.paths.soundfont_for(alternate.as_str()),
                            wav: lease.artifact_path(&b_wav_name)?,
                            audio: lease.artifact_path(&name)?,
                            keep_wav: false,
                        },
                        &mut log,
                        "render_b",
                    )
                    .await;
                (
                    served_audio(&outcome, "audio_b", &id, &name, &b_wav_name),
                    outcome.error,
                )
            }
            None => (None, None),
        };

        let (generated, generative_error) = match (&selection, &primary.wav) {
            (Some(selection), Some(wav)) => {
                let result = self.augment(lease, &id, req, selection, wav, &mut log).await?;
                // The WAV stays when it is the only baseline audio.
                if primary.audio.is_some() {
                    if let Err(e) = lease.remove_artifact(&wav_name).await {
                        warn!(error = %e, "could not remove prompt WAV");
                    }
                }
                result
            }
            (Some(_), None) => {
                let body = ErrorBody::new(
                    ErrorCode::GenerationFailed,
                    "Baseline render failed; there is no audio to condition generation on",
                );
                log.error("generate", body.detail.clone(), None);
                (None, Some(body))
            }
            (None, _) => (None, None),
        };

        log.info("metadata", "provenance recorded");
        let metadata = RunMetadata {
            input_filename: req.input_name.clone(),
            mode: req.mode,
            style: req.style,
            timestamp: started,
            tool_versions: self.capabilities.tool_versions.clone(),
            checkpoint: selection.as_ref().and_then(|s| s.id.clone()),
            fallback_to_base: selection.as_ref().is_some_and(|s| s.fallback_to_base),
            classifications: report.channels.clone(),
            events: log.events().to_vec(),
        };
        metadata.write_to(lease.path()).await?;

        Ok(RemasterResponse {
            request_id: id.clone(),
            mode: req.mode,
            style: req.style,
            midi: ArtifactRef::new("midi", &id, &midi_name),
            audio,
            audio_error: primary.error,
            audio_b,
            audio_b_error,
            generated,
            generative_error,
            classifications: report.channels,
            metadata,
            metadata_ref: ArtifactRef::new("metadata", &id, METADATA_FILE),
            logs: log.into_events(),
        })
    }

    /// Generate from the baseline WAV and store the result, encoded when
    /// possible. Generation failures come back as an error body.
    async fn augment(
        &self,
        lease: &WorkspaceLease,
        id: &str,
        req: &ValidatedRequest,
        selection: &CheckpointSelection,
        prompt: &std::path::Path,
        log: &mut EventLog,
    ) -> Result<(Option<ArtifactRef>, Option<ErrorBody>)> {
        if selection.fallback_to_base {
            log.warn(
                "generate",
                format!("no fine-tuned checkpoint for {}; using the base model", req.style),
                None,
            );
        }

        let audio = match self
            .generative
            .generate(prompt, req.style, req.description.as_deref(), selection)
            .await
        {
            Ok(audio) => audio,
            Err(e) => {
                let body = e.to_body();
                log.error("generate", body.detail.clone(), Some(e.to_string()));
                return Ok((None, Some(body)));
            }
        };

        let wav_path = lease.write_artifact(GENERATED_WAV, &audio.wav).await?;
        log.info("generate", format!("generated {} bytes of audio", audio.wav.len()));

        let mp3_path = lease.artifact_path(GENERATED_MP3)?;
        match self.renderer.encode(&wav_path, &mp3_path).await {
            Ok(()) => {
                lease.remove_artifact(GENERATED_WAV).await?;
                log.info("encode", "generated audio encoded");
                Ok((Some(ArtifactRef::new("generated", id, GENERATED_MP3)), None))
            }
            Err(e) => {
                log.warn("encode", "generated audio kept as WAV", Some(e.to_string()));
                Ok((Some(ArtifactRef::new("generated", id, GENERATED_WAV)), None))
            }
        }
    }
}
