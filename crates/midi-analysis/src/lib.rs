pub mod classify;
pub mod document;
pub mod evaluate;
pub mod features;
pub mod gm;
pub mod load;
pub mod midi_writer;
pub mod note;

pub use classify::{classify, classify_all, Classification, ClassifierWeights, InstrumentCategory};
pub use document::{Event, EventKind, MetaEvent, MidiDocument, SmfFormat, TempoMap, Timing, Track};
pub use evaluate::{evaluate, Evaluation, OnsetScore, DEFAULT_ONSET_TOLERANCE};
pub use features::{extract_channel_features, ChannelFeatureSummary};
pub use load::{load, load_with_timeout};
pub use midi_writer::to_smf_bytes;
pub use note::{extract_notes, TimedNote};

/// Errors from MIDI loading.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("MIDI parse error: {0}")]
    Parse(String),

    #[error("unsupported MIDI format {0}: sequential files have no shared timeline")]
    UnsupportedFormat(u16),

    #[error("MIDI parse exceeded its deadline")]
    ParseTimeout,
}

pub type Result<T> = std::result::Result<T, Error>;
