use crate::features::ChannelFeatureSummary;
use crate::gm::{self, GmFamily};
use serde::{Deserialize, Serialize};

/// Instrument category a channel is mapped through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentCategory {
    Lead,
    Bass,
    /// Sustained pads and string sections.
    Pad,
    Keys,
    Percussion,
    Other,
}

impl InstrumentCategory {
    /// Fixed evaluation order; ties in score keep this order.
    pub const ALL: [InstrumentCategory; 6] = [
        Self::Lead,
        Self::Bass,
        Self::Pad,
        Self::Keys,
        Self::Percussion,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Bass => "bass",
            Self::Pad => "pad",
            Self::Keys => "keys",
            Self::Percussion => "percussion",
            Self::Other => "other",
        }
    }

    /// The category a GM program family naturally belongs to.
    pub fn for_family(family: GmFamily) -> Self {
        match family {
            GmFamily::Piano | GmFamily::ChromaticPercussion | GmFamily::Organ => Self::Keys,
            GmFamily::Bass => Self::Bass,
            GmFamily::Strings | GmFamily::Ensemble | GmFamily::SynthPad => Self::Pad,
            GmFamily::Guitar
            | GmFamily::Brass
            | GmFamily::Reed
            | GmFamily::Pipe
            | GmFamily::SynthLead => Self::Lead,
            GmFamily::Percussive => Self::Percussion,
            GmFamily::SynthEffects | GmFamily::Ethnic | GmFamily::SoundEffects => Self::Other,
        }
    }
}

impl std::fmt::Display for InstrumentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstrumentCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown instrument category: {s}"))
    }
}

/// Scoring weights and thresholds for [`classify`].
///
/// Each category's base score is a weighted mean of feature terms in [0, 1].
/// The GM family then contributes `family` of the final score, so every score
/// stays in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierWeights {
    /// Weight of pitch-register terms.
    pub register: f64,
    /// Weight of pitch-span terms.
    pub span: f64,
    /// Weight of note-density terms.
    pub density: f64,
    /// Weight of polyphony terms.
    pub polyphony: f64,
    /// Weight of note-duration terms.
    pub duration: f64,
    /// Share of the final score decided by the original program's GM family.
    pub family: f64,
    /// Family share multiplier when the channel never sent a program change.
    pub implicit_family_scale: f64,
    /// Base score for `other`, which has no feature terms.
    pub other_floor: f64,
    /// Ceiling for percussion detected from note statistics alone.
    pub percussion_heuristic: f64,
    /// How much velocity spread matters to the percussion heuristic.
    pub velocity_mix: f64,
    /// Runner-up within this margin wins if it matches the GM family.
    pub tie_epsilon: f64,
    /// Confidence reported for channels flagged as percussion.
    pub percussion_confidence: f64,
}

impl Default for ClassifierWeights {
    fn default() -> Self {
        Self {
            register: 1.0,
            span: 1.0,
            density: 1.0,
            polyphony: 1.0,
            duration: 1.0,
            family: 0.25,
            implicit_family_scale: 0.5,
            other_floor: 0.3,
            percussion_heuristic: 0.8,
            velocity_mix: 0.5,
            tie_epsilon: 0.05,
            percussion_confidence: 0.99,
        }
    }
}

/// A channel's category decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub channel: u8,
    pub category: InstrumentCategory,
    pub confidence: f64,
    pub original_program: u8,
    pub original_program_name: String,
    /// Remaining categories by descending score.
    pub alternatives: Vec<(InstrumentCategory, f64)>,
}

/// Classify one channel. Pure: identical inputs give identical output.
pub fn classify(features: &ChannelFeatureSummary, weights: &ClassifierWeights) -> Classification {
    let program = features.original_program;
    let base = Classification {
        channel: features.channel,
        category: InstrumentCategory::Percussion,
        confidence: weights.percussion_confidence.clamp(0.0, 1.0),
        original_program: program,
        original_program_name: gm::program_name(program).to_string(),
        alternatives: Vec::new(),
    };

    if features.is_percussion {
        return base;
    }

    let natural = InstrumentCategory::for_family(GmFamily::of(program));
    let mut ranked: Vec<(InstrumentCategory, f64)> = InstrumentCategory::ALL
        .into_iter()
        .map(|c| (c, score(c, features, weights, natural)))
        .collect();
    // Stable: equal scores keep evaluation order.
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    if ranked[1].0 == natural && ranked[0].1 - ranked[1].1 <= weights.tie_epsilon {
        ranked.swap(0, 1);
    }

    let (category, confidence) = ranked[0];
    Classification {
        category,
        confidence,
        alternatives: ranked[1..].to_vec(),
        ..base
    }
}

/// Classify every channel in a feature map, in channel order.
pub fn classify_all<'a>(
    features: impl IntoIterator<Item = &'a ChannelFeatureSummary>,
    weights: &ClassifierWeights,
) -> Vec<Classification> {
    features.into_iter().map(|f| classify(f, weights)).collect()
}

fn score(
    category: InstrumentCategory,
    f: &ChannelFeatureSummary,
    w: &ClassifierWeights,
    natural: InstrumentCategory,
) -> f64 {
    let monophony = 1.0 - f.polyphonic_ratio;
    let base = match category {
        InstrumentCategory::Lead => weighted(&[
            (w.register, ramp_up(f.pitch_mean, 55.0, 72.0)),
            (w.polyphony, monophony),
            (w.density, ramp_up(f.density, 0.5, 3.0)),
        ]),
        InstrumentCategory::Bass => weighted(&[
            (w.register, ramp_down(f.pitch_mean, 40.0, 55.0)),
            (w.polyphony, monophony),
            (w.span, ramp_down(f.pitch_span as f64, 12.0, 36.0)),
        ]),
        InstrumentCategory::Pad => weighted(&[
            (w.duration, ramp_up(f.mean_duration_beats, 1.0, 4.0)),
            (w.density, ramp_down(f.density, 0.5, 3.0)),
            (w.polyphony, f.polyphonic_ratio),
        ]),
        InstrumentCategory::Keys => weighted(&[
            (w.polyphony, f.polyphonic_ratio),
            (w.span, ramp_up(f.pitch_span as f64, 12.0, 30.0)),
            (w.register, 1.0 - ((f.pitch_mean - 60.0).abs() / 24.0).min(1.0)),
        ]),
        InstrumentCategory::Percussion => {
            let short = ramp_down(f.mean_duration_beats, 0.1, 0.5);
            let spread = ramp_up(f.velocity_variance.sqrt(), 10.0, 30.0);
            let accent = 1.0 - w.velocity_mix + w.velocity_mix * spread;
            w.percussion_heuristic * f.repeat_ratio * short * f.drum_range_ratio * accent
        }
        InstrumentCategory::Other => w.other_floor,
    };

    let family_share = if f.program_explicit {
        w.family
    } else {
        w.family * w.implicit_family_scale
    }
    .clamp(0.0, 1.0);
    let family_term = if category == natural { 1.0 } else { 0.0 };

    ((1.0 - family_share) * base.clamp(0.0, 1.0) + family_share * family_term).clamp(0.0, 1.0)
}

fn weighted(terms: &[(f64, f64)]) -> f64 {
    let total: f64 = terms.iter().map(|(w, _)| w.max(0.0)).sum();
    if total <= 0.0 {
        return 0.0;
    }
    terms.iter().map(|(w, t)| w.max(0.0) * t).sum::<f64>() / total
}

/// 0 at or below `lo`, 1 at or above `hi`, linear between.
fn ramp_up(x: f64, lo: f64, hi: f64) -> f64 {
    ((x - lo) / (hi - lo)).clamp(0.0, 1.0)
}

fn ramp_down(x: f64, lo: f64, hi: f64) -> f64 {
    1.0 - ramp_up(x, lo, hi)
}
