//! Fixtures shared by the pipeline tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use midi_analysis::{to_smf_bytes, Event, EventKind, MidiDocument, SmfFormat, Timing, Track};
use remaster::{
    Capabilities, Encoder, GenerateError, GeneratedAudio, GenerationRequest, AudioGenerator,
    Pipeline, RemasterRequest, Synthesizer, ToolError,
};
use remasterconf::RemasterConfig;
use tempfile::TempDir;

pub const PPQ: u64 = 480;

/// Config rooted in `dir`, with every style's soundfont present and tool
/// paths that do not exist.
pub fn config(dir: &TempDir) -> RemasterConfig {
    let mut config = RemasterConfig::default();
    config.paths.workspace_root = dir.path().join("workspaces");
    config.paths.soundfont_dir = dir.path().join("soundfonts");
    config.paths.checkpoint_dir = dir.path().join("checkpoints");
    config.tools.fluidsynth = "remaster-test-missing-fluidsynth".to_string();
    config.tools.lame = "remaster-test-missing-lame".to_string();

    std::fs::create_dir_all(&config.paths.soundfont_dir).unwrap();
    std::fs::create_dir_all(&config.paths.checkpoint_dir).unwrap();
    for style in ["snes", "gba", "nds", "ps2", "wii"] {
        std::fs::write(config.paths.soundfont_for(style), b"sfbk").unwrap();
    }
    config
}

/// Pipeline whose synth and encoder are in-process fakes.
pub fn pipeline(config: RemasterConfig) -> Pipeline {
    let caps = Capabilities::assume_available(&config);
    Pipeline::new(config, caps)
        .unwrap()
        .with_synthesizer(Arc::new(FakeSynth::default()))
        .with_encoder(Arc::new(FakeEncoder))
}

pub fn request(filename: &str, bytes: Vec<u8>, style: &str) -> RemasterRequest {
    RemasterRequest {
        filename: filename.to_string(),
        content_type: Some("audio/midi".to_string()),
        bytes,
        style: style.to_string(),
        ..Default::default()
    }
}

fn note(events: &mut Vec<Event>, start: u64, len: u64, channel: u8, key: u8, velocity: u8) {
    events.push(Event::new(start, EventKind::NoteOn { channel, key, velocity }));
    events.push(Event::new(start + len, EventKind::NoteOff { channel, key, velocity: 0 }));
}

fn smf(mut events: Vec<Event>) -> Vec<u8> {
    events.sort_by_key(|e| e.tick);
    to_smf_bytes(&MidiDocument {
        format: SmfFormat::SingleTrack,
        timing: Timing::Metrical { ppq: PPQ as u16 },
        tracks: vec![Track { events }],
    })
}

/// Acoustic piano triads spanning C3 to C5, one beat each.
pub fn piano_chords() -> Vec<u8> {
    let mut events = vec![Event::new(0, EventKind::ProgramChange { channel: 0, program: 0 })];
    let chords: [[u8; 3]; 4] = [[48, 52, 55], [55, 60, 64], [60, 64, 67], [64, 67, 72]];
    for (i, chord) in chords.iter().enumerate() {
        for &key in chord {
            note(&mut events, i as u64 * PPQ, PPQ, 0, key, 80);
        }
    }
    smf(events)
}

/// Lead on channel 0, bass on channel 1, drums on channel 9.
pub fn band() -> Vec<u8> {
    let mut events = vec![
        Event::new(0, EventKind::ProgramChange { channel: 0, program: 80 }),
        Event::new(0, EventKind::ProgramChange { channel: 1, program: 33 }),
    ];
    let melody = [76u8, 79, 81, 84, 83, 79, 76, 74];
    for bar in 0..4u64 {
        for (i, &key) in melody.iter().enumerate() {
            note(&mut events, bar * 4 * PPQ + i as u64 * PPQ / 2, PPQ / 2, 0, key, 100);
        }
        for (i, key) in [36u8, 43, 38, 41].into_iter().enumerate() {
            note(&mut events, bar * 4 * PPQ + i as u64 * PPQ, PPQ, 1, key, 90);
        }
        for beat in 0..4u64 {
            note(&mut events, bar * 4 * PPQ + beat * PPQ, PPQ / 8, 9, 36, 120);
            note(&mut events, bar * 4 * PPQ + beat * PPQ + PPQ / 2, PPQ / 8, 9, 42, 70);
        }
    }
    smf(events)
}

/// A single-track file of `count` back-to-back note-ons in running status.
pub fn dense_notes(count: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(count * 3 + 8);
    body.extend_from_slice(&[0x00, 0x90, 60, 100]);
    for i in 1..count {
        body.extend_from_slice(&[0x00, 36 + (i % 48) as u8, 100]);
    }
    body.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);

    let mut bytes = Vec::with_capacity(body.len() + 22);
    bytes.extend_from_slice(b"MThd");
    bytes.extend_from_slice(&6u32.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&1u16.to_be_bytes());
    bytes.extend_from_slice(&(PPQ as u16).to_be_bytes());
    bytes.extend_from_slice(b"MTrk");
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    bytes
}

/// Writes a few bytes to the WAV path.
#[derive(Default)]
pub struct FakeSynth {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Synthesizer for FakeSynth {
    fn name(&self) -> &str {
        "fake-synth"
    }

    async fn synthesize(&self, _midi: &Path, _sf: &Path, wav: &Path, _t: Duration) -> Result<(), ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::write(wav, b"RIFFfakeWAVE").map_err(|source| ToolError::Io {
            path: wav.to_path_buf(),
            source,
        })
    }
}

/// Always fails like a crashed tool.
pub struct FailingSynth;

#[async_trait]
impl Synthesizer for FailingSynth {
    fn name(&self) -> &str {
        "failing-synth"
    }

    async fn synthesize(&self, _midi: &Path, _sf: &Path, _wav: &Path, _t: Duration) -> Result<(), ToolError> {
        Err(ToolError::Synth("segfault".to_string()))
    }
}

/// Copies the WAV to the output path.
pub struct FakeEncoder;

#[async_trait]
impl Encoder for FakeEncoder {
    fn name(&self) -> &str {
        "fake-encoder"
    }

    async fn encode(&self, wav: &Path, out: &Path, _t: Duration) -> Result<(), ToolError> {
        std::fs::copy(wav, out).map(|_| ()).map_err(|source| ToolError::Io {
            path: out.to_path_buf(),
            source,
        })
    }
}

/// Fails every encode, leaving the WAV in place.
pub struct FailingEncoder;

#[async_trait]
impl Encoder for FailingEncoder {
    fn name(&self) -> &str {
        "failing-encoder"
    }

    async fn encode(&self, _wav: &Path, out: &Path, _t: Duration) -> Result<(), ToolError> {
        Err(ToolError::Io {
            path: out.to_path_buf(),
            source: std::io::Error::other("no space left on device"),
        })
    }
}

/// Returns the prompt back as "generated" audio and remembers the request.
#[derive(Default)]
pub struct EchoGenerator {
    pub last: std::sync::Mutex<Option<GenerationRequest>>,
}

#[async_trait]
impl AudioGenerator for EchoGenerator {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GeneratedAudio, GenerateError> {
        let wav = request.prompt_wav.clone();
        *self.last.lock().unwrap() = Some(request);
        Ok(GeneratedAudio {
            wav,
            sample_rate: Some(32_000),
        })
    }
}

/// Always fails.
pub struct BrokenGenerator;

#[async_trait]
impl AudioGenerator for BrokenGenerator {
    fn name(&self) -> &str {
        "broken"
    }

    async fn generate(&self, _request: GenerationRequest) -> Result<GeneratedAudio, GenerateError> {
        Err(GenerateError::Request("HTTP 500: CUDA out of memory".to_string()))
    }
}
