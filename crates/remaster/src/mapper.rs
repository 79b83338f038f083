//! Rewrite each classified channel to its style's program.

use midi_analysis::gm::{self, GmFamily};
use midi_analysis::{Classification, InstrumentCategory, MidiDocument};
use serde::{Deserialize, Serialize};

use crate::styles::{ConsoleStyle, ProgramChoice, ProgramTable, StyleBank};

/// What happened to one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRemap {
    pub channel: u8,
    /// Category the classifier chose.
    pub category: InstrumentCategory,
    /// Category whose table entry was used. Differs from `category` when the
    /// style has no entry for it.
    pub mapped_category: InstrumentCategory,
    pub program: u8,
    pub program_name: String,
    pub confidence: f64,
    pub original_program: u8,
    pub original_program_name: String,
    /// Program change events rewritten or inserted.
    pub events_touched: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemapReport {
    pub style: ConsoleStyle,
    pub channels: Vec<ChannelRemap>,
}

/// Apply `style`'s table to every classified channel of `doc`.
///
/// Deterministic: the same document, classifications and table always
/// produce the same bytes.
pub fn remap(
    doc: &mut MidiDocument,
    classifications: &[Classification],
    style: ConsoleStyle,
    bank: &StyleBank,
) -> RemapReport {
    let table = bank.table(style);
    let drum_channels = doc.drum_channels();
    let channels = classifications
        .iter()
        .map(|c| {
            let on_kit = drum_channels.contains(&c.channel);
            let choice = choose(table, c, on_kit);
            let events_touched = doc.set_channel_program(c.channel, choice.program);
            ChannelRemap {
                channel: c.channel,
                category: c.category,
                mapped_category: choice.category,
                program: choice.program,
                program_name: program_label(on_kit, choice.program),
                confidence: c.confidence,
                original_program: c.original_program,
                original_program_name: c.original_program_name.clone(),
                events_touched,
            }
        })
        .collect();

    RemapReport { style, channels }
}

/// Percussion only takes the kit program on a channel that plays a kit.
/// Elsewhere program 0 is a piano, so a pitched percussion part keeps its
/// Percussive-family program or takes the style's `other` entry.
fn choose(table: &ProgramTable, c: &Classification, on_kit: bool) -> ProgramChoice {
    match c.category {
        InstrumentCategory::Percussion if on_kit => table.program_for(InstrumentCategory::Percussion),
        InstrumentCategory::Percussion if GmFamily::of(c.original_program) == GmFamily::Percussive => {
            ProgramChoice {
                program: c.original_program,
                category: InstrumentCategory::Percussion,
            }
        }
        InstrumentCategory::Percussion => table.program_for(InstrumentCategory::Other),
        category => table.program_for(category),
    }
}

fn program_label(on_kit: bool, program: u8) -> String {
    if on_kit {
        "Drum Kit".to_string()
    } else {
        gm::program_name(program).to_string()
    }
}
