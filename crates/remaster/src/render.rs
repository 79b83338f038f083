//! Staged render: synthesize the remapped MIDI to WAV, then encode.
//!
//! ```text
//! Queued → Synthesizing → Encoding → Complete
//!    └──────────┴────────────┴──→ Failed { stage, reason }
//! ```
//!
//! A failed render never fails the request. The caller gets a MIDI-only
//! result with `audio_error` set.

use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hound::{SampleFormat, WavSpec, WavWriter};
use remasterconf::{RemasterConfig, SynthBackend};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::capabilities::Capabilities;
use crate::error::{ErrorBody, ErrorCode};
use crate::events::EventLog;
use crate::tools::{run_tool, ToolError};

/// Extra render time after the last event so notes can ring out.
const DECAY_SECS: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderStage {
    Synth,
    Encode,
}

impl fmt::Display for RenderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synth => f.write_str("synth"),
            Self::Encode => f.write_str("encode"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RenderState {
    Queued,
    Synthesizing,
    Encoding,
    Complete,
    Failed { stage: RenderStage, reason: String },
}

impl RenderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_become(&self, next: &RenderState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Synthesizing)
            | (Self::Synthesizing, Self::Encoding)
            | (Self::Encoding, Self::Complete) => true,
            (current, Self::Failed { .. }) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RenderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Synthesizing => f.write_str("synthesizing"),
            Self::Encoding => f.write_str("encoding"),
            Self::Complete => f.write_str("complete"),
            Self::Failed { stage, reason } => write!(f, "failed during {stage}: {reason}"),
        }
    }
}

/// MIDI + soundfont → WAV.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(
        &self,
        midi: &Path,
        soundfont: &Path,
        wav: &Path,
        timeout: Duration,
    ) -> Result<(), ToolError>;
}

/// WAV → compressed audio.
#[async_trait]
pub trait Encoder: Send + Sync {
    fn name(&self) -> &str;

    async fn encode(&self, wav: &Path, out: &Path, timeout: Duration) -> Result<(), ToolError>;
}

/// The `fluidsynth` executable in fast-render mode.
#[derive(Debug, Clone)]
pub struct FluidSynth {
    pub program: String,
    pub sample_rate: u32,
}

#[async_trait]
impl Synthesizer for FluidSynth {
    fn name(&self) -> &str {
        "fluidsynth"
    }

    async fn synthesize(
        &self,
        midi: &Path,
        soundfont: &Path,
        wav: &Path,
        timeout: Duration,
    ) -> Result<(), ToolError> {
        let args = vec![
            "-ni".to_string(),
            "-a".to_string(),
            "file".to_string(),
            "-r".to_string(),
            self.sample_rate.to_string(),
            "-q".to_string(),
            "-F".to_string(),
            wav.to_string_lossy().into_owned(),
            soundfont.to_string_lossy().into_owned(),
            midi.to_string_lossy().into_owned(),
        ];
        run_tool(&self.program, &args, timeout).await?;
        ensure_nonempty(wav, "fluidsynth produced no audio").await
    }
}

/// In-process synthesis with rustysynth, rendered block by block on the
/// blocking pool.
#[derive(Debug, Clone)]
pub struct RustySynth {
    pub sample_rate: u32,
}

#[async_trait]
impl Synthesizer for RustySynth {
    fn name(&self) -> &str {
        "rustysynth"
    }

    async fn synthesize(
        &self,
        midi: &Path,
        soundfont: &Path,
        wav: &Path,
        timeout: Duration,
    ) -> Result<(), ToolError> {
        let midi_bytes = read_input(midi).await?;
        let sf_bytes = read_input(soundfont).await?;
        let wav = wav.to_path_buf();
        let sample_rate = self.sample_rate;
        let deadline = Instant::now() + timeout;

        tokio::task::spawn_blocking(move || {
            render_blocks(&midi_bytes, &sf_bytes, sample_rate, &wav, deadline, timeout)
        })
        .await
        .map_err(|e| ToolError::Synth(format!("render task failed: {e}")))?
    }
}

fn render_blocks(
    midi_bytes: &[u8],
    sf_bytes: &[u8],
    sample_rate: u32,
    wav: &Path,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), ToolError> {
    use rustysynth::{MidiFile, MidiFileSequencer, SoundFont, SynthesizerSettings};

    let sound_font = Arc::new(
        SoundFont::new(&mut Cursor::new(sf_bytes))
            .map_err(|e| ToolError::Synth(format!("failed to load soundfont: {e:?}")))?,
    );
    let midi = Arc::new(
        MidiFile::new(&mut Cursor::new(midi_bytes))
            .map_err(|e| ToolError::Synth(format!("failed to read MIDI: {e:?}")))?,
    );
    let settings = SynthesizerSettings::new(sample_rate as i32);
    let synthesizer = rustysynth::Synthesizer::new(&sound_font, &settings)
        .map_err(|e| ToolError::Synth(format!("failed to create synthesizer: {e:?}")))?;

    let mut sequencer = MidiFileSequencer::new(synthesizer);
    sequencer.play(&midi, false);

    let total = (sample_rate as f64 * (midi.get_length() + DECAY_SECS)) as usize;
    let block = sample_rate as usize;
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let io = |e: hound::Error| ToolError::Synth(format!("failed to write WAV: {e}"));
    let mut writer = WavWriter::create(wav, spec).map_err(io)?;

    let mut left = vec![0f32; block];
    let mut right = vec![0f32; block];
    let mut written = 0;
    while written < total {
        if Instant::now() >= deadline {
            return Err(ToolError::Timeout {
                tool: "rustysynth".to_string(),
                after: timeout,
            });
        }
        let n = block.min(total - written);
        sequencer.render(&mut left[..n], &mut right[..n]);
        for (&l, &r) in left[..n].iter().zip(&right[..n]) {
            writer.write_sample(to_i16(l)).map_err(io)?;
            writer.write_sample(to_i16(r)).map_err(io)?;
        }
        written += n;
    }
    writer.finalize().map_err(io)?;
    debug!(samples = written, "rustysynth render finished");
    Ok(())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// `lame -V2`.
#[derive(Debug, Clone)]
pub struct Lame {
    pub program: String,
}

#[async_trait]
impl Encoder for Lame {
    fn name(&self) -> &str {
        "lame"
    }

    async fn encode(&self, wav: &Path, out: &Path, timeout: Duration) -> Result<(), ToolError> {
        let args = vec![
            "-V2".to_string(),
            wav.to_string_lossy().into_owned(),
            out.to_string_lossy().into_owned(),
        ];
        run_tool(&self.program, &args, timeout).await?;
        ensure_nonempty(out, "lame produced no output").await
    }
}

async fn read_input(path: &Path) -> Result<Vec<u8>, ToolError> {
    tokio::fs::read(path).await.map_err(|source| ToolError::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn ensure_nonempty(path: &Path, message: &str) -> Result<(), ToolError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(ToolError::Synth(message.to_string())),
    }
}

/// File locations for one render.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub midi: PathBuf,
    pub soundfont: PathBuf,
    pub wav: PathBuf,
    pub audio: PathBuf,
    /// Keep the WAV after encoding; the generative stage needs it.
    pub keep_wav: bool,
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub state: RenderState,
    /// Encoded audio, when the render completed.
    pub audio: Option<PathBuf>,
    /// The WAV, when it exists: kept on request, or because encoding
    /// failed and it is the only audio there is.
    pub wav: Option<PathBuf>,
    pub error: Option<ErrorBody>,
}

/// One render in flight. Every transition lands in the event log.
struct RenderRun<'a> {
    state: RenderState,
    log: &'a mut EventLog,
    stage: &'static str,
}

impl<'a> RenderRun<'a> {
    fn new(log: &'a mut EventLog, stage: &'static str) -> Self {
        log.info(stage, "render queued");
        Self {
            state: RenderState::Queued,
            log,
            stage,
        }
    }

    fn advance(&mut self, next: RenderState) {
        if !self.state.can_become(&next) {
            self.log.warn(
                self.stage,
                format!("ignored render transition {} -> {next}", self.state),
                None,
            );
            return;
        }
        match &next {
            RenderState::Failed { .. } => self.log.error(self.stage, format!("render {next}"), None),
            _ => self.log.info(self.stage, format!("render {next}")),
        }
        self.state = next;
    }

    fn fail(&mut self, stage: RenderStage, body: ErrorBody) -> ErrorBody {
        self.advance(RenderState::Failed {
            stage,
            reason: body.detail.clone(),
        });
        body
    }
}

/// Runs the synth and encode stages with the configured backends.
pub struct Renderer {
    synth: Arc<dyn Synthesizer>,
    encoder: Arc<dyn Encoder>,
    synth_available: bool,
    encode_available: bool,
    synth_timeout: Duration,
    encode_timeout: Duration,
}

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("synth", &self.synth.name())
            .field("encoder", &self.encoder.name())
            .field("synth_available", &self.synth_available)
            .field("encode_available", &self.encode_available)
            .finish()
    }
}

impl Renderer {
    pub fn new(
        synth: Arc<dyn Synthesizer>,
        encoder: Arc<dyn Encoder>,
        synth_timeout: Duration,
        encode_timeout: Duration,
    ) -> Self {
        Self {
            synth,
            encoder,
            synth_available: true,
            encode_available: true,
            synth_timeout,
            encode_timeout,
        }
    }

    /// Backends from config, marked available per startup detection.
    pub fn from_config(config: &RemasterConfig, caps: &Capabilities) -> Result<Self, remasterconf::ConfigError> {
        let synth: Arc<dyn Synthesizer> = match config.tools.synth_backend {
            SynthBackend::FluidSynth => Arc::new(FluidSynth {
                program: config.tools.fluidsynth.clone(),
                sample_rate: config.tools.sample_rate,
            }),
            SynthBackend::RustySynth => Arc::new(RustySynth {
                sample_rate: config.tools.sample_rate,
            }),
        };
        let encoder = Arc::new(Lame {
            program: config.tools.lame.clone(),
        });
        Ok(Self {
            synth,
            encoder,
            synth_available: caps.synth_available(),
            encode_available: caps.lame,
            synth_timeout: config.limits.synth_timeout()?,
            encode_timeout: config.limits.encode_timeout()?,
        })
    }

    pub fn with_synthesizer(mut self, synth: Arc<dyn Synthesizer>) -> Self {
        self.synth = synth;
        self.synth_available = true;
        self
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self.encode_available = true;
        self
    }

    pub fn with_availability(mut self, synth: bool, encode: bool) -> Self {
        self.synth_available = synth;
        self.encode_available = encode;
        self
    }

    pub fn encode_available(&self) -> bool {
        self.encode_available
    }

    /// Run both stages. Never returns an error; failures are in the outcome.
    #[instrument(skip(self, job, log), fields(midi = %job.midi.display(), synth = self.synth.name()))]
    pub async fn render(&self, job: &RenderJob, log: &mut EventLog, stage: &'static str) -> RenderOutcome {
        let mut run = RenderRun::new(log, stage);

        if !job.soundfont.is_file() {
            let body = run.fail(
                RenderStage::Synth,
                ErrorBody::new(
                    ErrorCode::SoundfontNotFound,
                    format!(
                        "Soundfont {} is not installed",
                        job.soundfont
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default()
                    ),
                )
                .with_debug(job.soundfont.display().to_string()),
            );
            return outcome(run.state, None, None, Some(body));
        }

        if !self.synth_available {
            let body = run.fail(
                RenderStage::Synth,
                ErrorBody::new(
                    ErrorCode::RenderFailed,
                    format!("Synthesizer {} is not available", self.synth.name()),
                ),
            );
            return outcome(run.state, None, None, Some(body));
        }

        run.advance(RenderState::Synthesizing);
        if let Err(e) = self
            .synth
            .synthesize(&job.midi, &job.soundfont, &job.wav, self.synth_timeout)
            .await
        {
            let body = run.fail(RenderStage::Synth, tool_error_body("Synthesis", &e));
            remove_quietly(&job.wav).await;
            return outcome(run.state, None, None, Some(body));
        }

        if !self.encode_available {
            let body = run.fail(
                RenderStage::Encode,
                ErrorBody::new(
                    ErrorCode::RenderFailed,
                    format!("Encoder {} is not available", self.encoder.name()),
                ),
            );
            let wav = job.wav.is_file().then(|| job.wav.clone());
            return outcome(run.state, None, wav, Some(body));
        }

        run.advance(RenderState::Encoding);
        if let Err(e) = self.encoder.encode(&job.wav, &job.audio, self.encode_timeout).await {
            let body = run.fail(RenderStage::Encode, tool_error_body("Encoding", &e));
            remove_quietly(&job.audio).await;
            let wav = job.wav.is_file().then(|| job.wav.clone());
            return outcome(run.state, None, wav, Some(body));
        }

        run.advance(RenderState::Complete);
        let wav = self.settle_wav(job).await;
        outcome(run.state, Some(job.audio.clone()), wav, None)
    }

    /// Encode a standalone WAV, as for generated audio.
    pub async fn encode(&self, wav: &Path, out: &Path) -> Result<(), ToolError> {
        if !self.encode_available {
            return Err(ToolError::NotFound {
                tool: self.encoder.name().to_string(),
            });
        }
        self.encoder.encode(wav, out, self.encode_timeout).await
    }

    async fn settle_wav(&self, job: &RenderJob) -> Option<PathBuf> {
        if job.keep_wav {
            job.wav.is_file().then(|| job.wav.clone())
        } else {
            remove_quietly(&job.wav).await;
            None
        }
    }
}

fn outcome(
    state: RenderState,
    audio: Option<PathBuf>,
    wav: Option<PathBuf>,
    error: Option<ErrorBody>,
) -> RenderOutcome {
    RenderOutcome {
        state,
        audio,
        wav,
        error,
    }
}

fn tool_error_body(what: &str, e: &ToolError) -> ErrorBody {
    let detail = match e {
        ToolError::Timeout { after, .. } => format!("{what} timed out after {}s", after.as_secs()),
        ToolError::NotFound { tool } => format!("{what} tool {tool} is not installed"),
        _ => format!("{what} failed"),
    };
    ErrorBody::new(e.code(), detail).with_debug(e.to_string())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "could not remove intermediate file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use RenderState::*;
        assert!(Queued.can_become(&Synthesizing));
        assert!(Synthesizing.can_become(&Encoding));
        assert!(Encoding.can_become(&Complete));
        assert!(!Queued.can_become(&Encoding));
        assert!(!Complete.can_become(&Synthesizing));

        let failed = Failed {
            stage: RenderStage::Synth,
            reason: "x".into(),
        };
        assert!(Queued.can_become(&failed));
        assert!(Encoding.can_become(&failed));
        assert!(!Complete.can_become(&failed));
        assert!(!failed.can_become(&failed.clone()));
    }

    #[test]
    fn test_state_display() {
        let failed = RenderState::Failed {
            stage: RenderStage::Encode,
            reason: "lame exited 1".into(),
        };
        assert_eq!(failed.to_string(), "failed during encode: lame exited 1");
    }

    #[test]
    fn test_tool_error_body_codes() {
        let timeout = ToolError::Timeout {
            tool: "fluidsynth".into(),
            after: Duration::from_secs(180),
        };
        let body = tool_error_body("Synthesis", &timeout);
        assert_eq!(body.code, ErrorCode::RenderTimeout);
        assert_eq!(body.detail, "Synthesis timed out after 180s");
    }

    #[test]
    fn test_to_i16_clamps() {
        assert_eq!(to_i16(2.0), i16::MAX);
        assert_eq!(to_i16(-2.0), -i16::MAX);
        assert_eq!(to_i16(0.0), 0);
    }
}
