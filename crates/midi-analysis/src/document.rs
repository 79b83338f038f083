//! In-memory MIDI event model.
//!
//! Events carry absolute ticks rather than deltas so that tracks can be edited
//! (program rewrites, insertions) without re-threading delta times. The SMF
//! writer converts back to deltas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default tempo when a file carries no Set Tempo meta event (120 BPM).
pub const DEFAULT_TEMPO_USEC: u32 = 500_000;

/// GM percussion channel (channel 10 in 1-indexed terms).
pub const DRUM_CHANNEL: u8 = 9;

/// Bank-select MSB values that select a drum kit (GS 120, XG 127).
const DRUM_BANKS: [u8; 2] = [120, 127];

/// Standard MIDI File format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmfFormat {
    /// Format 0: one track holding every channel.
    SingleTrack,
    /// Format 1: simultaneous tracks sharing one timeline.
    Parallel,
}

impl SmfFormat {
    pub fn as_u16(&self) -> u16 {
        match self {
            Self::SingleTrack => 0,
            Self::Parallel => 1,
        }
    }
}

/// Header timing division.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Timing {
    /// Ticks per quarter note.
    Metrical { ppq: u16 },
    /// SMPTE timecode: frames per second and ticks per frame.
    Timecode { fps: f32, subframes: u8 },
}

impl Timing {
    /// Ticks per quarter note used for beat-relative measures.
    ///
    /// Timecode files have no quarter note; 480 keeps beat measures on a
    /// familiar scale for them.
    pub fn ppq(&self) -> u16 {
        match self {
            Self::Metrical { ppq } => *ppq,
            Self::Timecode { .. } => 480,
        }
    }
}

/// Meta event payloads the pipeline cares about; everything else is kept raw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaEvent {
    Tempo { usec_per_quarter: u32 },
    TimeSignature { numerator: u8, denominator_pow: u8, clocks: u8, notated_32nds: u8 },
    TrackName { bytes: Vec<u8> },
    EndOfTrack,
    Raw { meta_type: u8, data: Vec<u8> },
}

impl MetaEvent {
    /// Meta type byte and payload as written after `0xFF`.
    pub fn to_raw(&self) -> (u8, Vec<u8>) {
        match self {
            Self::Tempo { usec_per_quarter } => {
                let u = *usec_per_quarter;
                (0x51, vec![(u >> 16) as u8, (u >> 8) as u8, u as u8])
            }
            Self::TimeSignature {
                numerator,
                denominator_pow,
                clocks,
                notated_32nds,
            } => (0x58, vec![*numerator, *denominator_pow, *clocks, *notated_32nds]),
            Self::TrackName { bytes } => (0x03, bytes.clone()),
            Self::EndOfTrack => (0x2F, Vec::new()),
            Self::Raw { meta_type, data } => (*meta_type, data.clone()),
        }
    }
}

/// Event payload. Channel messages carry their 0-indexed channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NoteOn { channel: u8, key: u8, velocity: u8 },
    NoteOff { channel: u8, key: u8, velocity: u8 },
    Aftertouch { channel: u8, key: u8, pressure: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    ChannelPressure { channel: u8, pressure: u8 },
    PitchBend { channel: u8, value: u16 },
    SysEx { data: Vec<u8> },
    Escape { data: Vec<u8> },
    Meta(MetaEvent),
}

impl EventKind {
    pub fn channel(&self) -> Option<u8> {
        match self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::Aftertouch { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::ProgramChange { channel, .. }
            | Self::ChannelPressure { channel, .. }
            | Self::PitchBend { channel, .. } => Some(*channel),
            _ => None,
        }
    }

    /// Note-on with non-zero velocity (velocity 0 is a note-off by convention).
    pub fn is_sounding_note_on(&self) -> bool {
        matches!(self, Self::NoteOn { velocity, .. } if *velocity > 0)
    }
}

/// A timed event at an absolute tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub tick: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(tick: u64, kind: EventKind) -> Self {
        Self { tick, kind }
    }
}

/// One MTrk chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub events: Vec<Event>,
}

impl Track {
    pub fn last_tick(&self) -> u64 {
        self.events.last().map(|e| e.tick).unwrap_or(0)
    }

    pub fn name(&self) -> Option<String> {
        self.events.iter().find_map(|e| match &e.kind {
            EventKind::Meta(MetaEvent::TrackName { bytes }) => {
                String::from_utf8(bytes.clone()).ok()
            }
            _ => None,
        })
    }

    /// Whether this track carries note-ons for `channel`.
    pub fn has_notes_on(&self, channel: u8) -> bool {
        self.events
            .iter()
            .any(|e| e.kind.is_sounding_note_on() && e.kind.channel() == Some(channel))
    }

    fn first_note_tick(&self, channel: u8) -> Option<u64> {
        self.events
            .iter()
            .find(|e| e.kind.is_sounding_note_on() && e.kind.channel() == Some(channel))
            .map(|e| e.tick)
    }
}

/// A parsed Standard MIDI File.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidiDocument {
    pub format: SmfFormat,
    pub timing: Timing,
    pub tracks: Vec<Track>,
}

impl MidiDocument {
    /// Highest tick across all tracks.
    pub fn total_ticks(&self) -> u64 {
        self.tracks.iter().map(Track::last_tick).max().unwrap_or(0)
    }

    /// Channels with at least one sounding note, ascending.
    pub fn channels_with_notes(&self) -> Vec<u8> {
        let mut seen = [false; 16];
        for track in &self.tracks {
            for event in &track.events {
                if event.kind.is_sounding_note_on() {
                    if let Some(ch) = event.kind.channel() {
                        seen[ch as usize & 0x0F] = true;
                    }
                }
            }
        }
        (0u8..16).filter(|ch| seen[*ch as usize]).collect()
    }

    /// Channels that play a drum kit: the GM drum channel plus any channel
    /// that selects a GS/XG drum bank via CC0 anywhere in the file.
    pub fn drum_channels(&self) -> BTreeSet<u8> {
        let mut channels: BTreeSet<u8> = self
            .tracks
            .iter()
            .flat_map(|t| t.events.iter())
            .filter_map(|e| match e.kind {
                EventKind::ControlChange { channel, controller: 0, value }
                    if DRUM_BANKS.contains(&value) =>
                {
                    Some(channel)
                }
                _ => None,
            })
            .collect();
        channels.insert(DRUM_CHANNEL);
        channels
    }

    /// First program change on `channel` by tick, across tracks.
    pub fn first_program(&self, channel: u8) -> Option<u8> {
        self.tracks
            .iter()
            .flat_map(|t| t.events.iter())
            .filter_map(|e| match e.kind {
                EventKind::ProgramChange { channel: ch, program } if ch == channel => {
                    Some((e.tick, program))
                }
                _ => None,
            })
            .min_by_key(|(tick, _)| *tick)
            .map(|(_, program)| program)
    }

    /// Make every sounding note on `channel` play `program`.
    ///
    /// Existing program changes on the channel are rewritten. Any track that
    /// plays the channel without a program change at or before its first note
    /// gets one inserted at tick 0. Returns the number of events touched.
    pub fn set_channel_program(&mut self, channel: u8, program: u8) -> usize {
        let mut touched = 0;
        for track in &mut self.tracks {
            let first_note = track.first_note_tick(channel);
            let mut covered = false;

            for event in &mut track.events {
                if let EventKind::ProgramChange { channel: ch, program: p } = &mut event.kind {
                    if *ch == channel {
                        *p = program;
                        touched += 1;
                        if first_note.is_some_and(|t| event.tick <= t) {
                            covered = true;
                        }
                    }
                }
            }

            if first_note.is_some() && !covered {
                track
                    .events
                    .insert(0, Event::new(0, EventKind::ProgramChange { channel, program }));
                touched += 1;
            }
        }
        touched
    }

    /// Tempo changes merged from all tracks, sorted and deduplicated.
    pub fn tempo_map(&self) -> TempoMap {
        let mut changes: Vec<(u64, u32)> = self
            .tracks
            .iter()
            .flat_map(|t| t.events.iter())
            .filter_map(|e| match e.kind {
                EventKind::Meta(MetaEvent::Tempo { usec_per_quarter }) => {
                    Some((e.tick, usec_per_quarter))
                }
                _ => None,
            })
            .collect();
        changes.sort_by_key(|(tick, _)| *tick);
        changes.dedup_by(|a, b| a.0 == b.0);
        TempoMap {
            timing: self.timing,
            changes,
        }
    }
}

/// Converts ticks to seconds.
#[derive(Debug, Clone)]
pub struct TempoMap {
    timing: Timing,
    changes: Vec<(u64, u32)>,
}

impl TempoMap {
    /// Absolute time of `tick` in seconds.
    pub fn seconds_at(&self, tick: u64) -> f64 {
        match self.timing {
            Timing::Timecode { fps, subframes } => {
                let ticks_per_sec = fps as f64 * subframes.max(1) as f64;
                tick as f64 / ticks_per_sec
            }
            Timing::Metrical { ppq } => {
                let ppq = ppq.max(1) as f64;
                let mut seconds = 0.0;
                let mut last_tick = 0u64;
                let mut usec = DEFAULT_TEMPO_USEC;
                for &(change_tick, change_usec) in &self.changes {
                    if change_tick >= tick {
                        break;
                    }
                    seconds += (change_tick - last_tick) as f64 / ppq * usec as f64 / 1e6;
                    last_tick = change_tick;
                    usec = change_usec;
                }
                seconds + (tick - last_tick) as f64 / ppq * usec as f64 / 1e6
            }
        }
    }

    /// Duration in seconds between two ticks.
    pub fn span_seconds(&self, from: u64, to: u64) -> f64 {
        (self.seconds_at(to) - self.seconds_at(from)).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(tracks: Vec<Vec<Event>>) -> MidiDocument {
        MidiDocument {
            format: SmfFormat::Parallel,
            timing: Timing::Metrical { ppq: 480 },
            tracks: tracks.into_iter().map(|events| Track { events }).collect(),
        }
    }

    fn note_on(tick: u64, channel: u8, key: u8) -> Event {
        Event::new(tick, EventKind::NoteOn { channel, key, velocity: 100 })
    }

    #[test]
    fn drum_channels_include_bank_selects() {
        let d = doc(vec![vec![
            Event::new(0, EventKind::ControlChange { channel: 5, controller: 0, value: 120 }),
            Event::new(0, EventKind::ControlChange { channel: 6, controller: 0, value: 1 }),
            note_on(0, 5, 38),
            note_on(0, 6, 38),
        ]]);
        assert_eq!(d.drum_channels().into_iter().collect::<Vec<_>>(), vec![5, 9]);
    }

    #[test]
    fn set_program_inserts_when_missing() {
        let mut d = doc(vec![vec![note_on(0, 2, 60)]]);
        let touched = d.set_channel_program(2, 33);
        assert_eq!(touched, 1);
        assert_eq!(d.first_program(2), Some(33));
        assert_eq!(d.tracks[0].events[0].tick, 0);
    }

    #[test]
    fn set_program_rewrites_existing() {
        let mut d = doc(vec![vec![
            Event::new(0, EventKind::ProgramChange { channel: 0, program: 5 }),
            note_on(10, 0, 60),
            Event::new(960, EventKind::ProgramChange { channel: 0, program: 7 }),
        ]]);
        let touched = d.set_channel_program(0, 80);
        assert_eq!(touched, 2);
        assert_eq!(d.tracks[0].events.len(), 3);
        let programs: Vec<u8> = d.tracks[0]
            .events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::ProgramChange { program, .. } => Some(program),
                _ => None,
            })
            .collect();
        assert_eq!(programs, vec![80, 80]);
    }

    #[test]
    fn late_program_change_still_gets_tick_zero_insert() {
        let mut d = doc(vec![vec![
            note_on(0, 1, 60),
            Event::new(480, EventKind::ProgramChange { channel: 1, program: 3 }),
        ]]);
        d.set_channel_program(1, 40);
        assert_eq!(
            d.tracks[0].events[0].kind,
            EventKind::ProgramChange { channel: 1, program: 40 }
        );
        assert_eq!(d.tracks[0].events.len(), 3);
    }

    #[test]
    fn other_channels_untouched() {
        let mut d = doc(vec![vec![
            Event::new(0, EventKind::ProgramChange { channel: 3, program: 12 }),
            note_on(0, 3, 60),
            note_on(0, 4, 60),
        ]]);
        d.set_channel_program(4, 90);
        assert_eq!(d.first_program(3), Some(12));
        assert_eq!(d.first_program(4), Some(90));
    }

    #[test]
    fn tempo_map_default_and_changes() {
        let d = doc(vec![vec![
            Event::new(0, EventKind::Meta(MetaEvent::Tempo { usec_per_quarter: 500_000 })),
            Event::new(960, EventKind::Meta(MetaEvent::Tempo { usec_per_quarter: 1_000_000 })),
        ]]);
        let map = d.tempo_map();
        assert!((map.seconds_at(960) - 1.0).abs() < 1e-9);
        assert!((map.seconds_at(1440) - 2.0).abs() < 1e-9);

        let plain = doc(vec![vec![]]);
        assert!((plain.tempo_map().seconds_at(480) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn channels_with_notes_ignores_control_only() {
        let d = doc(vec![vec![
            Event::new(0, EventKind::ControlChange { channel: 5, controller: 7, value: 100 }),
            note_on(0, 9, 36),
            Event::new(0, EventKind::NoteOn { channel: 2, key: 60, velocity: 0 }),
        ]]);
        assert_eq!(d.channels_with_notes(), vec![9]);
    }
}
