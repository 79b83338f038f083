//! Content-preservation runs over a directory of MIDI files.
//!
//! Every file is remapped for every selected style without rendering, then
//! scored against its source for melody contour and onset alignment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use midi_analysis::{
    classify_all, evaluate, extract_channel_features, load_with_timeout, to_smf_bytes,
    ClassifierWeights, Evaluation, OnsetScore,
};
use serde::Serialize;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{RemasterError, Result};
use crate::mapper;
use crate::pipeline::Pipeline;
use crate::styles::{ConsoleStyle, StyleBank};

/// One file under one style.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusRow {
    pub midi_file: String,
    pub style: ConsoleStyle,
    pub melody_similarity: Option<f64>,
    pub onset: Option<OnsetScore>,
    pub error: Option<String>,
}

/// Means over the rows of one style that scored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleSummary {
    pub style: ConsoleStyle,
    pub scored: usize,
    pub failed: usize,
    pub mean_melody_similarity: Option<f64>,
    pub mean_onset_f_measure: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorpusReport {
    pub files: usize,
    pub tolerance_ms: u128,
    pub rows: Vec<CorpusRow>,
    pub summary: Vec<StyleSummary>,
}

/// `.mid` and `.midi` files under `dir`, recursively, sorted by path.
pub fn find_midi_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| RemasterError::Io {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf()),
            source: e.into(),
        })?;
        let is_midi = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mid") || ext.eq_ignore_ascii_case("midi"));
        if entry.file_type().is_file() && is_midi {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

/// Remap `bytes` for `style` and score the written result against the source.
pub fn evaluate_remap(
    bytes: &[u8],
    style: ConsoleStyle,
    bank: &StyleBank,
    weights: &ClassifierWeights,
    parse_timeout: Duration,
    tolerance: Duration,
) -> Result<Evaluation> {
    let source = load_with_timeout(bytes, parse_timeout)?;
    let features = extract_channel_features(&source);
    let classifications = classify_all(features.values(), weights);

    let mut remapped = source.clone();
    mapper::remap(&mut remapped, &classifications, style, bank);
    let written = load_with_timeout(&to_smf_bytes(&remapped), parse_timeout)?;
    Ok(evaluate(&source, &written, tolerance))
}

/// Score every MIDI file under `dir` for each style in `styles`.
///
/// Per-file failures land in their row; only an unreadable corpus or one
/// with no MIDI files fails the run.
#[instrument(skip_all, fields(corpus = %dir.display()))]
pub async fn evaluate_corpus(
    pipeline: &Pipeline,
    dir: &Path,
    styles: &[ConsoleStyle],
    tolerance: Duration,
) -> Result<CorpusReport> {
    let walk_dir = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || find_midi_files(&walk_dir))
        .await
        .map_err(|e| RemasterError::Processing(format!("corpus scan failed: {e}")))??;
    if files.is_empty() {
        return Err(RemasterError::Processing(format!(
            "no .mid or .midi files under {}",
            dir.display()
        )));
    }
    let parse_timeout = pipeline
        .config()
        .limits
        .parse_timeout()
        .map_err(|e| RemasterError::Processing(e.to_string()))?;
    info!(files = files.len(), styles = styles.len(), "evaluating corpus");

    let mut rows = Vec::with_capacity(files.len() * styles.len());
    for path in &files {
        let midi_file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let bytes = tokio::fs::read(path).await.map_err(|source| RemasterError::Io {
            path: path.clone(),
            source,
        });

        for &style in styles {
            let scored = match &bytes {
                Ok(bytes) => {
                    let bytes = bytes.clone();
                    let bank = pipeline.styles();
                    let weights = pipeline.weights().clone();
                    tokio::task::spawn_blocking(move || {
                        evaluate_remap(&bytes, style, bank, &weights, parse_timeout, tolerance)
                    })
                    .await
                    .map_err(|e| RemasterError::Processing(format!("evaluation task failed: {e}")))
                    .and_then(|r| r)
                }
                Err(e) => Err(RemasterError::Processing(e.to_string())),
            };

            let row = match scored {
                Ok(eval) => {
                    info!(
                        file = %midi_file,
                        %style,
                        melody_similarity = eval.melody_similarity,
                        onset_f = eval.onset.f_measure,
                        "scored"
                    );
                    CorpusRow {
                        midi_file: midi_file.clone(),
                        style,
                        melody_similarity: Some(eval.melody_similarity),
                        onset: Some(eval.onset),
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(file = %midi_file, %style, error = %e, "evaluation failed");
                    CorpusRow {
                        midi_file: midi_file.clone(),
                        style,
                        melody_similarity: None,
                        onset: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            rows.push(row);
        }
    }

    let summary = styles.iter().map(|&style| summarize(style, &rows)).collect();
    Ok(CorpusReport {
        files: files.len(),
        tolerance_ms: tolerance.as_millis(),
        rows,
        summary,
    })
}

fn summarize(style: ConsoleStyle, rows: &[CorpusRow]) -> StyleSummary {
    let mine: Vec<&CorpusRow> = rows.iter().filter(|r| r.style == style).collect();
    let similarities: Vec<f64> = mine.iter().filter_map(|r| r.melody_similarity).collect();
    let f_measures: Vec<f64> = mine.iter().filter_map(|r| r.onset.map(|o| o.f_measure)).collect();
    StyleSummary {
        style,
        scored: similarities.len(),
        failed: mine.iter().filter(|r| r.error.is_some()).count(),
        mean_melody_similarity: mean(&similarities),
        mean_onset_f_measure: mean(&f_measures),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(style: ConsoleStyle, similarity: Option<f64>, f: Option<f64>) -> CorpusRow {
        CorpusRow {
            midi_file: "a.mid".to_string(),
            style,
            melody_similarity: similarity,
            onset: f.map(|f_measure| OnsetScore {
                f_measure,
                ..OnsetScore::default()
            }),
            error: similarity.is_none().then(|| "parse".to_string()),
        }
    }

    #[test]
    fn test_summary_skips_failed_rows() {
        let rows = vec![
            row(ConsoleStyle::Snes, Some(1.0), Some(1.0)),
            row(ConsoleStyle::Snes, Some(0.5), Some(0.0)),
            row(ConsoleStyle::Snes, None, None),
            row(ConsoleStyle::Gba, Some(0.2), Some(0.4)),
        ];
        let snes = summarize(ConsoleStyle::Snes, &rows);
        assert_eq!(snes.scored, 2);
        assert_eq!(snes.failed, 1);
        assert_eq!(snes.mean_melody_similarity, Some(0.75));
        assert_eq!(snes.mean_onset_f_measure, Some(0.5));

        let wii = summarize(ConsoleStyle::Wii, &rows);
        assert_eq!(wii.scored, 0);
        assert_eq!(wii.mean_melody_similarity, None);
    }

    #[test]
    fn test_find_midi_files_recurses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("act1")).unwrap();
        std::fs::write(dir.path().join("b.MID"), b"x").unwrap();
        std::fs::write(dir.path().join("act1/a.midi"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let files = find_midi_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["act1/a.midi", "b.MID"]);
    }
}
