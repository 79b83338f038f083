//! Upload validation. Runs before any workspace exists.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RemasterError, Result};
use crate::styles::ConsoleStyle;

pub const ALLOWED_EXTENSIONS: [&str; 2] = [".mid", ".midi"];
pub const ALLOWED_CONTENT_TYPES: [&str; 3] =
    ["audio/midi", "audio/x-midi", "application/octet-stream"];

/// Longest stem kept from an uploaded file name.
const MAX_STEM_CHARS: usize = 200;

/// How a request is remastered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Classify, remap, synthesize, encode.
    #[default]
    Baseline,
    /// Baseline, then condition a generative model on the rendered audio.
    Ml,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Baseline => "baseline",
            Mode::Ml => "ml",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseline" => Ok(Mode::Baseline),
            "ml" | "generative" => Ok(Mode::Ml),
            other => Err(format!("unknown mode {other:?}; expected baseline or ml")),
        }
    }
}

/// One remaster request as received from the transport.
#[derive(Debug, Clone, Default)]
pub struct RemasterRequest {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub style: String,
    pub mode: Mode,
    pub description: Option<String>,
    pub checkpoint: Option<String>,
    /// Style whose soundfont renders an independent "B" output.
    pub alternate_soundfont: Option<String>,
}

/// A request that passed intake.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    /// Sanitized input file name, ending in `.mid` or `.midi`.
    pub input_name: String,
    /// Safe stem for output names.
    pub stem: String,
    pub style: ConsoleStyle,
    pub alternate: Option<ConsoleStyle>,
    pub mode: Mode,
    pub description: Option<String>,
    pub checkpoint: Option<String>,
}

/// Check extension, content type, size and style, in that order.
pub fn validate(request: &RemasterRequest, max_upload_bytes: u64) -> Result<ValidatedRequest> {
    if !is_allowed_extension(&request.filename) {
        return Err(RemasterError::InvalidExtension(request.filename.clone()));
    }
    if !is_allowed_content_type(request.content_type.as_deref()) {
        return Err(RemasterError::InvalidContentType(
            request.content_type.clone().unwrap_or_default(),
        ));
    }
    let size = request.bytes.len() as u64;
    if size > max_upload_bytes {
        return Err(RemasterError::PayloadTooLarge {
            size,
            limit: max_upload_bytes,
        });
    }
    let style: ConsoleStyle = request.style.parse()?;
    let alternate = request
        .alternate_soundfont
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .transpose()?;

    let input_name = safe_midi_input_basename(&request.filename);
    let stem = output_stem(&input_name);

    Ok(ValidatedRequest {
        input_name,
        stem,
        style,
        alternate,
        mode: request.mode,
        description: request
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        checkpoint: request
            .checkpoint
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string),
    })
}

pub fn is_allowed_extension(filename: &str) -> bool {
    let name = filename.trim().to_ascii_lowercase();
    ALLOWED_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Missing content types pass; parameters after `;` are ignored.
pub fn is_allowed_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type.filter(|c| !c.trim().is_empty()) else {
        return true;
    };
    let main = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ALLOWED_CONTENT_TYPES.contains(&main.as_str())
}

/// Last path component with only alphanumerics, space, `.`, `_` and `-` kept.
pub fn sanitize_basename(name: &str) -> String {
    let safe = clean_component(name);
    let safe = safe.trim_start_matches('.').trim();
    if safe.is_empty() {
        "input".to_string()
    } else {
        safe.to_string()
    }
}

/// A safe basename that ends in `.mid` or `.midi`.
pub fn safe_midi_input_basename(original: &str) -> String {
    let base = clean_component(original);
    let lower = base.to_ascii_lowercase();
    for ext in [".midi", ".mid"] {
        if lower.ends_with(ext) {
            let stem = base[..base.len() - ext.len()].trim_start_matches('.').trim();
            let stem = if stem.is_empty() { "input" } else { stem };
            return format!("{stem}{ext}");
        }
    }
    format!("{}.mid", sanitize_basename(original))
}

fn clean_component(name: &str) -> String {
    let base = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let safe: String = base
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .take(MAX_STEM_CHARS)
        .collect();
    safe.trim().to_string()
}

/// Stem for generated artifact names: alphanumerics, `-` and `_` only.
pub fn output_stem(input_name: &str) -> String {
    let stem = input_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(input_name);
    let safe: String = stem
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => Some(c),
            ' ' => Some('_'),
            _ => None,
        })
        .take(MAX_STEM_CHARS)
        .collect();
    if safe.is_empty() {
        "song".to_string()
    } else if safe.eq_ignore_ascii_case("generated") {
        // Generated audio owns generated.wav and generated.mp3.
        format!("{safe}_input")
    } else {
        safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(filename: &str, bytes: usize) -> RemasterRequest {
        RemasterRequest {
            filename: filename.to_string(),
            content_type: Some("audio/midi".to_string()),
            bytes: vec![0; bytes],
            style: "snes".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_extension() {
        assert!(is_allowed_extension("song.MID"));
        assert!(is_allowed_extension(" theme.midi "));
        assert!(!is_allowed_extension("song.mp3"));
        assert!(!is_allowed_extension("midi"));
    }

    #[test]
    fn test_content_type() {
        assert!(is_allowed_content_type(None));
        assert!(is_allowed_content_type(Some("")));
        assert!(is_allowed_content_type(Some("audio/midi; charset=binary")));
        assert!(is_allowed_content_type(Some("Application/Octet-Stream")));
        assert!(!is_allowed_content_type(Some("text/plain")));
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_basename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_basename("C:\\Users\\me\\song.mid"), "song.mid");
        assert_eq!(sanitize_basename("..."), "input");
        assert_eq!(sanitize_basename(""), "input");
        assert_eq!(sanitize_basename("a<b>|c.mid"), "abc.mid");
    }

    #[test]
    fn test_midi_basename() {
        assert_eq!(safe_midi_input_basename("Theme.MIDI"), "Theme.midi");
        assert_eq!(safe_midi_input_basename("level 1.mid"), "level 1.mid");
        assert_eq!(safe_midi_input_basename(".mid"), "input.mid");
        assert_eq!(safe_midi_input_basename("dir/../x.mid"), "x.mid");
        assert_eq!(safe_midi_input_basename("tune"), "tune.mid");
    }

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("level 1 (final).mid"), "level_1_final");
        assert_eq!(output_stem("ÿ.mid"), "song");
        assert_eq!(output_stem("Generated.mid"), "Generated_input");
    }

    #[test]
    fn test_validate_order_and_limits() {
        let ok = validate(&request("boss.mid", 100), 1000).unwrap();
        assert_eq!(ok.style, ConsoleStyle::Snes);
        assert_eq!(ok.input_name, "boss.mid");
        assert_eq!(ok.stem, "boss");

        assert!(matches!(
            validate(&request("boss.wav", 100), 1000),
            Err(RemasterError::InvalidExtension(_))
        ));
        assert!(matches!(
            validate(&request("boss.mid", 1001), 1000),
            Err(RemasterError::PayloadTooLarge { size: 1001, limit: 1000 })
        ));

        let mut r = request("boss.mid", 10);
        r.content_type = Some("image/png".to_string());
        assert!(matches!(validate(&r, 1000), Err(RemasterError::InvalidContentType(_))));

        let mut r = request("boss.mid", 10);
        r.style = "n64".to_string();
        assert!(matches!(validate(&r, 1000), Err(RemasterError::UnknownStyle(_))));
    }

    #[test]
    fn test_blank_optionals_dropped() {
        let mut r = request("boss.mid", 10);
        r.description = Some("   ".to_string());
        r.alternate_soundfont = Some("".to_string());
        r.checkpoint = Some(" ckpt.pt ".to_string());
        let v = validate(&r, 1000).unwrap();
        assert_eq!(v.description, None);
        assert_eq!(v.alternate, None);
        assert_eq!(v.checkpoint.as_deref(), Some("ckpt.pt"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("ML".parse::<Mode>().unwrap(), Mode::Ml);
        assert_eq!("generative".parse::<Mode>().unwrap(), Mode::Ml);
        assert!("fast".parse::<Mode>().is_err());
    }
}
