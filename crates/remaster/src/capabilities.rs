//! What this deployment can do, detected once at startup.

use std::collections::BTreeMap;

use remasterconf::{RemasterConfig, SynthBackend};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::generative;
use crate::styles::ConsoleStyle;
use crate::tools::query_version;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `fluidsynth` answered `--version`.
    pub fluidsynth: bool,
    /// `lame` answered `--version`.
    pub lame: bool,
    pub synth_backend: SynthBackend,
    pub tool_versions: BTreeMap<String, String>,
    /// A generative endpoint is configured.
    pub ml_available: bool,
    pub available_styles: Vec<ConsoleStyle>,
    /// Styles with a fine-tuned checkpoint. Others generate on the base model.
    pub ml_available_styles: Vec<ConsoleStyle>,
    pub max_upload_bytes: u64,
}

impl Capabilities {
    /// Check tools and the checkpoint directory.
    pub async fn detect(config: &RemasterConfig) -> Self {
        let (fluidsynth, lame) = tokio::join!(
            query_version(&config.tools.fluidsynth, "--version"),
            query_version(&config.tools.lame, "--version"),
        );

        let mut tool_versions = BTreeMap::new();
        if let Some(v) = &fluidsynth {
            tool_versions.insert("fluidsynth".to_string(), v.clone());
        }
        if let Some(v) = &lame {
            tool_versions.insert("lame".to_string(), v.clone());
        }
        if config.tools.synth_backend == SynthBackend::RustySynth {
            tool_versions.insert("rustysynth".to_string(), "1.3".to_string());
        }

        let caps = Self {
            fluidsynth: fluidsynth.is_some(),
            lame: lame.is_some(),
            synth_backend: config.tools.synth_backend,
            tool_versions,
            ml_available: config.generative.endpoint.is_some(),
            available_styles: ConsoleStyle::ALL.to_vec(),
            ml_available_styles: generative::available_checkpoint_styles(
                &config.paths.checkpoint_dir,
                config.generative.checkpoint_pattern.as_deref(),
            ),
            max_upload_bytes: config.limits.max_upload_bytes,
        };
        info!(
            fluidsynth = caps.fluidsynth,
            lame = caps.lame,
            backend = %caps.synth_backend,
            ml = caps.ml_available,
            "capabilities detected"
        );
        caps
    }

    /// Capabilities with no probing: every tool present, no generative
    /// endpoint. Used when the caller supplies its own backends.
    pub fn assume_available(config: &RemasterConfig) -> Self {
        Self {
            fluidsynth: true,
            lame: true,
            synth_backend: config.tools.synth_backend,
            tool_versions: BTreeMap::new(),
            ml_available: config.generative.endpoint.is_some(),
            available_styles: ConsoleStyle::ALL.to_vec(),
            ml_available_styles: Vec::new(),
            max_upload_bytes: config.limits.max_upload_bytes,
        }
    }

    /// Whether the configured synthesizer can run.
    pub fn synth_available(&self) -> bool {
        match self.synth_backend {
            SynthBackend::FluidSynth => self.fluidsynth,
            SynthBackend::RustySynth => true,
        }
    }
}
