//! Remaster MIDI files into console-styled audio.
//!
//! Each channel of an uploaded MIDI file is classified into an instrument
//! category, remapped to the program a target console style uses for that
//! category, synthesized with the style's soundfont, and encoded. In `ml`
//! mode the baseline render then conditions a generative music model.
//!
//! ```rust,no_run
//! use remaster::{Capabilities, Pipeline, RemasterRequest};
//! use remasterconf::RemasterConfig;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = RemasterConfig::load()?;
//! let caps = Capabilities::detect(&config).await;
//! let pipeline = Pipeline::new(config, caps)?;
//!
//! let response = pipeline
//!     .run(RemasterRequest {
//!         filename: "theme.mid".into(),
//!         bytes: std::fs::read("theme.mid")?,
//!         style: "snes".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{}", response.midi.url);
//! # Ok(())
//! # }
//! ```

pub mod capabilities;
pub mod corpus;
pub mod error;
pub mod events;
pub mod generative;
pub mod intake;
pub mod mapper;
pub mod metadata;
pub mod pipeline;
pub mod render;
pub mod styles;
pub mod telemetry;
pub mod tools;

pub use capabilities::Capabilities;
pub use corpus::{evaluate_corpus, CorpusReport, CorpusRow, StyleSummary};
pub use error::{ErrorBody, ErrorCode, RemasterError, Result};
pub use events::{EventLog, Level, PipelineEvent};
pub use generative::{
    AudioGenerator, CheckpointSelection, GenerateError, GeneratedAudio, GenerationRequest,
    GenerativeAdapter, MusicgenClient,
};
pub use intake::{Mode, RemasterRequest, ValidatedRequest};
pub use mapper::{remap, ChannelRemap, RemapReport};
pub use metadata::RunMetadata;
pub use pipeline::{ArtifactRef, Pipeline, RemasterResponse};
pub use render::{Encoder, RenderState, Renderer, Synthesizer};
pub use styles::{ConsoleStyle, ProgramTable, StyleBank};
pub use tools::ToolError;
