//! Per-channel feature summaries.

use crate::document::{MidiDocument, TempoMap};
use crate::note::{extract_notes, TimedNote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// GM percussion key map range (Acoustic Bass Drum to Open Triangle).
const DRUM_KEY_RANGE: std::ops::RangeInclusive<u8> = 35..=81;

/// Statistics for one MIDI channel, recomputed every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFeatureSummary {
    pub channel: u8,
    pub note_count: usize,

    // Register
    pub pitch_min: u8,
    pub pitch_max: u8,
    pub pitch_mean: f64,
    pub pitch_span: u8,

    // Dynamics
    pub velocity_mean: f64,
    pub velocity_variance: f64,

    // Timing
    /// Notes per second over the channel's active span (floored at one second).
    pub density: f64,
    pub mean_duration_secs: f64,
    pub mean_duration_beats: f64,

    // Texture
    pub polyphonic_ratio: f64,
    pub max_simultaneous: usize,
    /// Fraction of onsets that repeat the previous pitch.
    pub repeat_ratio: f64,
    /// Fraction of notes inside the GM drum key map.
    pub drum_range_ratio: f64,

    // Instrument
    pub is_percussion: bool,
    pub original_program: u8,
    /// False when the channel never sends a program change (program 0 assumed).
    pub program_explicit: bool,
}

/// Summaries for every channel that sounds at least one note.
pub fn extract_channel_features(doc: &MidiDocument) -> BTreeMap<u8, ChannelFeatureSummary> {
    let notes = extract_notes(doc);
    let tempo = doc.tempo_map();
    let ppq = doc.timing.ppq().max(1) as f64;
    let drum_channels = doc.drum_channels();

    let mut by_channel: BTreeMap<u8, Vec<&TimedNote>> = BTreeMap::new();
    for note in &notes {
        by_channel.entry(note.channel).or_default().push(note);
    }

    by_channel
        .into_iter()
        .map(|(channel, notes)| {
            let program = doc.first_program(channel);
            let summary = summarize(
                channel,
                &notes,
                &tempo,
                ppq,
                drum_channels.contains(&channel),
                program,
            );
            (channel, summary)
        })
        .collect()
}

fn summarize(
    channel: u8,
    notes: &[&TimedNote],
    tempo: &TempoMap,
    ppq: f64,
    is_percussion: bool,
    program: Option<u8>,
) -> ChannelFeatureSummary {
    let count = notes.len() as f64;

    let pitch_min = notes.iter().map(|n| n.pitch).min().unwrap_or(0);
    let pitch_max = notes.iter().map(|n| n.pitch).max().unwrap_or(0);
    let pitch_mean = notes.iter().map(|n| n.pitch as f64).sum::<f64>() / count;

    let (velocity_mean, velocity_variance) = velocity_stats(notes);

    let first_onset = notes.iter().map(|n| n.onset_tick).min().unwrap_or(0);
    let last_offset = notes.iter().map(|n| n.offset_tick).max().unwrap_or(0);
    let active_secs = tempo.span_seconds(first_onset, last_offset).max(1.0);

    let mean_duration_secs = notes
        .iter()
        .map(|n| tempo.span_seconds(n.onset_tick, n.offset_tick))
        .sum::<f64>()
        / count;
    let mean_duration_beats =
        notes.iter().map(|n| n.duration_ticks() as f64 / ppq).sum::<f64>() / count;

    let (max_simultaneous, polyphonic_ratio) = polyphony(notes);

    let repeats = notes.windows(2).filter(|w| w[0].pitch == w[1].pitch).count();
    let repeat_ratio = if notes.len() > 1 {
        repeats as f64 / (notes.len() - 1) as f64
    } else {
        0.0
    };
    let drum_range_ratio =
        notes.iter().filter(|n| DRUM_KEY_RANGE.contains(&n.pitch)).count() as f64 / count;

    ChannelFeatureSummary {
        channel,
        note_count: notes.len(),
        pitch_min,
        pitch_max,
        pitch_mean,
        pitch_span: pitch_max - pitch_min,
        velocity_mean,
        velocity_variance,
        density: count / active_secs,
        mean_duration_secs,
        mean_duration_beats,
        polyphonic_ratio,
        max_simultaneous,
        repeat_ratio,
        drum_range_ratio,
        is_percussion,
        original_program: program.unwrap_or(0),
        program_explicit: program.is_some(),
    }
}

fn velocity_stats(notes: &[&TimedNote]) -> (f64, f64) {
    let count = notes.len() as f64;
    let mean = notes.iter().map(|n| n.velocity as f64).sum::<f64>() / count;
    let variance = notes
        .iter()
        .map(|n| {
            let diff = n.velocity as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / count;
    (mean, variance)
}

/// Max simultaneous notes and the fraction of onsets that sound over another note.
fn polyphony(notes: &[&TimedNote]) -> (usize, f64) {
    // +1 at onset, -1 at offset; offsets sort first so touching notes don't overlap
    let mut events: Vec<(u64, i32)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        events.push((note.onset_tick, 1));
        events.push((note.offset_tick, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current = 0i32;
    let mut max_sim = 0usize;
    let mut polyphonic_onsets = 0usize;
    let mut total_onsets = 0usize;

    for &(_, delta) in &events {
        current += delta;
        let sim = current.max(0) as usize;
        max_sim = max_sim.max(sim);

        if delta > 0 {
            total_onsets += 1;
            if sim > 1 {
                polyphonic_onsets += 1;
            }
        }
    }

    let ratio = if total_onsets > 0 {
        polyphonic_onsets as f64 / total_onsets as f64
    } else {
        0.0
    };

    (max_sim, ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Event, EventKind, SmfFormat, Timing, Track};

    fn note(events: &mut Vec<Event>, start: u64, len: u64, channel: u8, key: u8, velocity: u8) {
        events.push(Event::new(start, EventKind::NoteOn { channel, key, velocity }));
        events.push(Event::new(start + len, EventKind::NoteOff { channel, key, velocity: 0 }));
    }

    fn doc(mut events: Vec<Event>) -> MidiDocument {
        events.sort_by_key(|e| e.tick);
        MidiDocument {
            format: SmfFormat::SingleTrack,
            timing: Timing::Metrical { ppq: 480 },
            tracks: vec![Track { events }],
        }
    }

    #[test]
    fn basic_statistics() {
        let mut events = Vec::new();
        note(&mut events, 0, 480, 0, 60, 100);
        note(&mut events, 480, 480, 0, 64, 80);
        note(&mut events, 960, 480, 0, 67, 90);
        let features = extract_channel_features(&doc(events));

        let ch = &features[&0];
        assert_eq!(ch.note_count, 3);
        assert_eq!((ch.pitch_min, ch.pitch_max, ch.pitch_span), (60, 67, 7));
        assert!((ch.velocity_mean - 90.0).abs() < 1e-9);
        assert!((ch.mean_duration_beats - 1.0).abs() < 1e-9);
        assert!((ch.mean_duration_secs - 0.5).abs() < 1e-9);
        // 3 notes over 1.5s
        assert!((ch.density - 2.0).abs() < 1e-9);
        assert_eq!(ch.max_simultaneous, 1);
        assert_eq!(ch.polyphonic_ratio, 0.0);
        assert!(!ch.program_explicit);
        assert_eq!(ch.original_program, 0);
    }

    #[test]
    fn drum_channel_and_bank_select_flag_percussion() {
        let mut events = vec![Event::new(
            0,
            EventKind::ControlChange { channel: 3, controller: 0, value: 127 },
        )];
        note(&mut events, 0, 120, 9, 36, 100);
        note(&mut events, 0, 120, 3, 38, 100);
        note(&mut events, 0, 120, 4, 60, 100);
        let features = extract_channel_features(&doc(events));

        assert!(features[&9].is_percussion);
        assert!(features[&3].is_percussion);
        assert!(!features[&4].is_percussion);
    }

    #[test]
    fn control_only_channels_are_omitted() {
        let mut events = vec![Event::new(
            0,
            EventKind::ControlChange { channel: 7, controller: 7, value: 100 },
        )];
        note(&mut events, 0, 480, 1, 40, 100);
        let features = extract_channel_features(&doc(events));
        assert_eq!(features.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn chords_are_polyphonic() {
        let mut events = vec![Event::new(0, EventKind::ProgramChange { channel: 2, program: 4 })];
        for (i, root) in [48u8, 53, 55, 48].iter().enumerate() {
            let start = i as u64 * 960;
            note(&mut events, start, 960, 2, *root, 80);
            note(&mut events, start, 960, 2, root + 4, 80);
            note(&mut events, start, 960, 2, root + 7, 80);
        }
        let features = extract_channel_features(&doc(events));
        let ch = &features[&2];
        assert_eq!(ch.max_simultaneous, 3);
        assert!(ch.polyphonic_ratio > 0.6);
        assert!(ch.program_explicit);
        assert_eq!(ch.original_program, 4);
    }

    #[test]
    fn repeated_pitches_counted() {
        let mut events = Vec::new();
        for i in 0..4 {
            note(&mut events, i * 240, 60, 5, 42, 100);
        }
        let features = extract_channel_features(&doc(events));
        assert!((features[&5].repeat_ratio - 1.0).abs() < 1e-9);
        assert!((features[&5].drum_range_ratio - 1.0).abs() < 1e-9);
    }
}
