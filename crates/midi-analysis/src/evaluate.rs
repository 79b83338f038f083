//! Content-preservation metrics between a source file and its remap.
//!
//! Two measures: how closely the dominant melody's pitch contour follows the
//! source, and how many note onsets line up within a timing tolerance.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::MidiDocument;
use crate::note::extract_notes;

/// Default onset matching window.
pub const DEFAULT_ONSET_TOLERANCE: Duration = Duration::from_millis(50);

/// Onset agreement between a reference and a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct OnsetScore {
    pub precision: f64,
    pub recall: f64,
    pub f_measure: f64,
    pub matched: usize,
    pub reference_onsets: usize,
    pub candidate_onsets: usize,
}

/// Both metrics for one reference/candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Pearson correlation in [-1, 1]; 0 for degenerate input.
    pub melody_similarity: f64,
    pub onset: OnsetScore,
}

/// Pitches of the dominant melody in onset order.
///
/// The dominant channel is the non-drum channel with the highest mean pitch.
/// Ties go to the lower channel number.
pub fn melody_pitches(doc: &MidiDocument) -> Vec<u8> {
    let drums = doc.drum_channels();
    let mut by_channel: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for note in extract_notes(doc) {
        if !drums.contains(&note.channel) {
            by_channel.entry(note.channel).or_default().push(note.pitch);
        }
    }

    let mean = |pitches: &[u8]| pitches.iter().map(|&p| f64::from(p)).sum::<f64>() / pitches.len() as f64;
    let mut dominant: Option<(f64, Vec<u8>)> = None;
    for pitches in by_channel.into_values() {
        let m = mean(&pitches);
        if dominant.as_ref().map_or(true, |(best, _)| m > *best) {
            dominant = Some((m, pitches));
        }
    }
    dominant.map(|(_, pitches)| pitches).unwrap_or_default()
}

/// Pearson correlation of the two melody contours over their common prefix.
pub fn melody_contour_similarity(reference: &MidiDocument, candidate: &MidiDocument) -> f64 {
    let a = melody_pitches(reference);
    let b = melody_pitches(candidate);
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    pearson(&a[..n], &b[..n])
}

fn pearson(a: &[u8], b: &[u8]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().map(|&x| f64::from(x)).sum::<f64>() / n;
    let mean_b = b.iter().map(|&x| f64::from(x)).sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b) {
        let dx = f64::from(x) - mean_a;
        let dy = f64::from(y) - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    let r = cov / (var_a.sqrt() * var_b.sqrt());
    if r.is_nan() {
        0.0
    } else {
        r.clamp(-1.0, 1.0)
    }
}

/// Every sounding note-on, in seconds, sorted.
pub fn onset_seconds(doc: &MidiDocument) -> Vec<f64> {
    let tempo = doc.tempo_map();
    let mut onsets: Vec<f64> = doc
        .tracks
        .iter()
        .flat_map(|t| &t.events)
        .filter(|e| e.kind.is_sounding_note_on())
        .map(|e| tempo.seconds_at(e.tick))
        .collect();
    onsets.sort_by(f64::total_cmp);
    onsets
}

/// Greedy one-to-one onset matching.
///
/// Each reference onset, in order, claims the nearest unclaimed candidate
/// within `tolerance`. Either side empty scores zero.
pub fn onset_alignment(reference: &MidiDocument, candidate: &MidiDocument, tolerance: Duration) -> OnsetScore {
    score_onsets(&onset_seconds(reference), &onset_seconds(candidate), tolerance.as_secs_f64())
}

fn score_onsets(reference: &[f64], candidate: &[f64], tolerance: f64) -> OnsetScore {
    let mut score = OnsetScore {
        reference_onsets: reference.len(),
        candidate_onsets: candidate.len(),
        ..OnsetScore::default()
    };
    if reference.is_empty() || candidate.is_empty() {
        return score;
    }

    let mut claimed = vec![false; candidate.len()];
    for &t in reference {
        let start = candidate.partition_point(|&c| c < t - tolerance);
        let nearest = (start..candidate.len())
            .take_while(|&j| candidate[j] <= t + tolerance)
            .filter(|&j| !claimed[j])
            .min_by(|&x, &y| (candidate[x] - t).abs().total_cmp(&(candidate[y] - t).abs()));
        if let Some(j) = nearest {
            claimed[j] = true;
            score.matched += 1;
        }
    }

    score.precision = score.matched as f64 / candidate.len() as f64;
    score.recall = score.matched as f64 / reference.len() as f64;
    if score.precision + score.recall > 0.0 {
        score.f_measure = 2.0 * score.precision * score.recall / (score.precision + score.recall);
    }
    score
}

/// Melody similarity and onset alignment together.
pub fn evaluate(reference: &MidiDocument, candidate: &MidiDocument, tolerance: Duration) -> Evaluation {
    Evaluation {
        melody_similarity: melody_contour_similarity(reference, candidate),
        onset: onset_alignment(reference, candidate, tolerance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Event, EventKind, SmfFormat, Timing, Track};

    const PPQ: u64 = 480;

    /// Quarter notes at 120 bpm, so each beat is half a second.
    fn line(channel: u8, keys: &[u8], offset_ticks: u64) -> Vec<Event> {
        let mut events = Vec::new();
        for (i, &key) in keys.iter().enumerate() {
            let start = offset_ticks + i as u64 * PPQ;
            events.push(Event::new(start, EventKind::NoteOn { channel, key, velocity: 90 }));
            events.push(Event::new(start + PPQ / 2, EventKind::NoteOff { channel, key, velocity: 0 }));
        }
        events
    }

    fn doc(lines: Vec<Vec<Event>>) -> MidiDocument {
        let mut events: Vec<Event> = lines.into_iter().flatten().collect();
        events.sort_by_key(|e| e.tick);
        MidiDocument {
            format: SmfFormat::SingleTrack,
            timing: Timing::Metrical { ppq: PPQ as u16 },
            tracks: vec![Track { events }],
        }
    }

    const TUNE: [u8; 6] = [72, 76, 79, 77, 74, 72];

    #[test]
    fn identical_files_score_perfectly() {
        let a = doc(vec![line(0, &TUNE, 0), line(1, &[36, 43, 36, 43], 0)]);
        let eval = evaluate(&a, &a.clone(), DEFAULT_ONSET_TOLERANCE);
        assert!((eval.melody_similarity - 1.0).abs() < 1e-9);
        assert_eq!(eval.onset.matched, 10);
        assert_eq!(eval.onset.precision, 1.0);
        assert_eq!(eval.onset.recall, 1.0);
        assert_eq!(eval.onset.f_measure, 1.0);
    }

    #[test]
    fn dominant_melody_is_highest_non_drum_channel() {
        let a = doc(vec![
            line(0, &TUNE, 0),
            line(1, &[36, 43, 36, 43], 0),
            line(9, &[81, 81, 81], 0),
        ]);
        assert_eq!(melody_pitches(&a), TUNE.to_vec());
    }

    #[test]
    fn transposed_melody_keeps_its_contour() {
        let a = doc(vec![line(0, &TUNE, 0)]);
        let up: Vec<u8> = TUNE.iter().map(|k| k + 12).collect();
        let b = doc(vec![line(0, &up, 0)]);
        assert!((melody_contour_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_melody_correlates_negatively() {
        let a = doc(vec![line(0, &[60, 62, 64, 66], 0)]);
        let b = doc(vec![line(0, &[66, 64, 62, 60], 0)]);
        assert!((melody_contour_similarity(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn small_shift_stays_within_tolerance() {
        let a = doc(vec![line(0, &TUNE, 0)]);
        // 24 ticks at 120 bpm is 25 ms.
        let b = doc(vec![line(0, &TUNE, 24)]);
        let score = onset_alignment(&a, &b, DEFAULT_ONSET_TOLERANCE);
        assert_eq!(score.matched, TUNE.len());
        assert_eq!(score.f_measure, 1.0);
    }

    #[test]
    fn large_shift_matches_nothing() {
        let a = doc(vec![line(0, &TUNE, 0)]);
        // 192 ticks is 200 ms.
        let b = doc(vec![line(0, &TUNE, 192)]);
        let score = onset_alignment(&a, &b, DEFAULT_ONSET_TOLERANCE);
        assert_eq!(score.matched, 0);
        assert_eq!(score.f_measure, 0.0);
        assert!((melody_contour_similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn extra_candidate_onsets_cost_precision() {
        let a = doc(vec![line(0, &[60, 64], 0)]);
        let b = doc(vec![line(0, &[60, 64, 67, 72], 0)]);
        let score = onset_alignment(&a, &b, DEFAULT_ONSET_TOLERANCE);
        assert_eq!(score.matched, 2);
        assert_eq!(score.recall, 1.0);
        assert_eq!(score.precision, 0.5);
        assert!((score.f_measure - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn each_candidate_is_claimed_once() {
        let score = score_onsets(&[1.0, 1.01], &[1.005], 0.05);
        assert_eq!(score.matched, 1);
        assert_eq!(score.recall, 0.5);
        assert_eq!(score.precision, 1.0);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let empty = doc(Vec::new());
        let a = doc(vec![line(0, &TUNE, 0)]);

        let eval = evaluate(&empty, &a, DEFAULT_ONSET_TOLERANCE);
        assert_eq!(eval.melody_similarity, 0.0);
        assert_eq!(eval.onset.f_measure, 0.0);
        assert_eq!(eval.onset.candidate_onsets, TUNE.len());

        let eval = evaluate(&empty, &empty, DEFAULT_ONSET_TOLERANCE);
        assert_eq!(eval.melody_similarity, 0.0);
        assert_eq!(eval.onset, OnsetScore::default());
    }

    #[test]
    fn flat_melody_scores_zero() {
        let a = doc(vec![line(0, &[60, 60, 60], 0)]);
        let b = doc(vec![line(0, &[60, 62, 64], 0)]);
        assert_eq!(melody_contour_similarity(&a, &b), 0.0);
    }
}
