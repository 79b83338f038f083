use crate::document::{EventKind, MidiDocument};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single MIDI note with absolute tick timing and source metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedNote {
    pub onset_tick: u64,
    pub offset_tick: u64,
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
    pub track_index: usize,
}

impl TimedNote {
    pub fn duration_ticks(&self) -> u64 {
        self.offset_tick.saturating_sub(self.onset_tick)
    }
}

/// Pair note-ons with note-offs across every track.
///
/// Overlapping notes on the same key stack LIFO. Notes still sounding when a
/// track ends are closed at that track's last tick. Output is sorted by onset,
/// then channel, then pitch.
pub fn extract_notes(doc: &MidiDocument) -> Vec<TimedNote> {
    let mut all_notes = Vec::new();

    for (track_index, track) in doc.tracks.iter().enumerate() {
        // (channel, pitch) → stack of (onset_tick, velocity)
        let mut pending: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();

        for event in &track.events {
            match event.kind {
                EventKind::NoteOn { channel, key, velocity } if velocity > 0 => {
                    pending
                        .entry((channel, key))
                        .or_default()
                        .push((event.tick, velocity));
                }
                EventKind::NoteOn { channel, key, .. } | EventKind::NoteOff { channel, key, .. } => {
                    if let Some((onset, velocity)) =
                        pending.get_mut(&(channel, key)).and_then(|s| s.pop())
                    {
                        all_notes.push(TimedNote {
                            onset_tick: onset,
                            offset_tick: event.tick,
                            pitch: key,
                            velocity,
                            channel,
                            track_index,
                        });
                    }
                }
                _ => {}
            }
        }

        let end = track.last_tick();
        for ((channel, pitch), stack) in pending {
            for (onset, velocity) in stack {
                all_notes.push(TimedNote {
                    onset_tick: onset,
                    offset_tick: end,
                    pitch,
                    velocity,
                    channel,
                    track_index,
                });
            }
        }
    }

    all_notes.sort_by(|a, b| {
        a.onset_tick
            .cmp(&b.onset_tick)
            .then(a.channel.cmp(&b.channel))
            .then(a.pitch.cmp(&b.pitch))
            .then(a.offset_tick.cmp(&b.offset_tick))
    });
    all_notes
}
