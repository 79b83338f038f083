//! Request-level errors and the machine-readable error contract.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Codes carried across the boundary in [`ErrorBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    InvalidExtension,
    InvalidContentType,
    PayloadTooLarge,
    UnknownStyle,
    CheckpointNotFound,
    SoundfontNotFound,
    MlUnavailable,
    ParseTimeout,
    ParseError,
    UnsupportedFormat,
    InvalidRequestId,
    InvalidFilename,
    NotFound,
    WorkspaceError,
    ProcessingError,
    RenderFailed,
    RenderTimeout,
    GenerationFailed,
    GenerationTimeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidExtension => "invalid-extension",
            Self::InvalidContentType => "invalid-content-type",
            Self::PayloadTooLarge => "payload-too-large",
            Self::UnknownStyle => "unknown-style",
            Self::CheckpointNotFound => "checkpoint-not-found",
            Self::SoundfontNotFound => "soundfont-not-found",
            Self::MlUnavailable => "ml-unavailable",
            Self::ParseTimeout => "parse-timeout",
            Self::ParseError => "parse-error",
            Self::UnsupportedFormat => "unsupported-format",
            Self::InvalidRequestId => "invalid-request-id",
            Self::InvalidFilename => "invalid-filename",
            Self::NotFound => "not-found",
            Self::WorkspaceError => "workspace-error",
            Self::ProcessingError => "processing-error",
            Self::RenderFailed => "render-failed",
            Self::RenderTimeout => "render-timeout",
            Self::GenerationFailed => "generation-failed",
            Self::GenerationTimeout => "generation-timeout",
        }
    }

    /// HTTP status an external transport should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidExtension
            | Self::UnknownStyle
            | Self::ParseTimeout
            | Self::ParseError
            | Self::InvalidRequestId
            | Self::InvalidFilename => 400,
            Self::NotFound => 404,
            Self::PayloadTooLarge => 413,
            Self::InvalidContentType => 415,
            Self::UnsupportedFormat => 422,
            Self::CheckpointNotFound | Self::SoundfontNotFound | Self::MlUnavailable => 503,
            Self::RenderTimeout | Self::GenerationTimeout => 504,
            Self::WorkspaceError
            | Self::ProcessingError
            | Self::RenderFailed
            | Self::GenerationFailed => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error JSON: `{ detail, code, debug? }`.
///
/// Also used inside successful responses for degraded stages
/// (`audio_error`, `generative_error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            code,
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }
}

/// Failures that end a request.
///
/// Stage-local failures (synthesis, encoding, generation) never appear here;
/// they degrade the response instead.
#[derive(Debug, Error)]
pub enum RemasterError {
    #[error("only .mid and .midi files are accepted, got {0:?}")]
    InvalidExtension(String),

    #[error("content type {0:?} is not allowed; use audio/midi or application/octet-stream")]
    InvalidContentType(String),

    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("unknown style {0:?}; expected one of snes, gba, nds, ps2, wii")]
    UnknownStyle(String),

    #[error("checkpoint {checkpoint:?} not found for style {style}")]
    CheckpointNotFound { style: String, checkpoint: String },

    #[error("soundfont not found: {}", .0.display())]
    SoundfontNotFound(PathBuf),

    #[error("generative mode is unavailable: {0}")]
    MlUnavailable(String),

    #[error("MIDI parsing timed out; the file may be corrupt or too complex")]
    ParseTimeout,

    #[error("malformed MIDI: {0}")]
    Parse(String),

    #[error("unsupported MIDI format {0}")]
    UnsupportedFormat(u16),

    #[error(transparent)]
    Workspace(#[from] scratch::ScratchError),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("processing error: {0}")]
    Processing(String),
}

impl RemasterError {
    pub fn code(&self) -> ErrorCode {
        use scratch::ScratchError;
        match self {
            Self::InvalidExtension(_) => ErrorCode::InvalidExtension,
            Self::InvalidContentType(_) => ErrorCode::InvalidContentType,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::UnknownStyle(_) => ErrorCode::UnknownStyle,
            Self::CheckpointNotFound { .. } => ErrorCode::CheckpointNotFound,
            Self::SoundfontNotFound(_) => ErrorCode::SoundfontNotFound,
            Self::MlUnavailable(_) => ErrorCode::MlUnavailable,
            Self::ParseTimeout => ErrorCode::ParseTimeout,
            Self::Parse(_) => ErrorCode::ParseError,
            Self::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            Self::Workspace(e) => match e {
                ScratchError::InvalidId(_) => ErrorCode::InvalidRequestId,
                ScratchError::InvalidFilename(_) => ErrorCode::InvalidFilename,
                ScratchError::NotFound(_) | ScratchError::Reclaiming(_) => ErrorCode::NotFound,
                ScratchError::Io { .. } => ErrorCode::WorkspaceError,
            },
            Self::Io { .. } => ErrorCode::WorkspaceError,
            Self::Processing(_) => ErrorCode::ProcessingError,
        }
    }

    pub fn status(&self) -> u16 {
        self.code().status()
    }

    /// Boundary form. Internal detail goes to `debug`, never `detail`.
    pub fn to_body(&self) -> ErrorBody {
        match self {
            Self::Workspace(scratch::ScratchError::Io { .. }) | Self::Io { .. } => {
                ErrorBody::new(self.code(), "Workspace storage failed. Try again later.")
                    .with_debug(self.to_string())
            }
            Self::Workspace(scratch::ScratchError::NotFound(_))
            | Self::Workspace(scratch::ScratchError::Reclaiming(_)) => {
                ErrorBody::new(self.code(), "File not found or expired.")
            }
            Self::Processing(_) => {
                ErrorBody::new(self.code(), "Processing error. Check logs or try again.")
                    .with_debug(self.to_string())
            }
            _ => ErrorBody::new(self.code(), self.to_string()),
        }
    }
}

impl From<midi_analysis::Error> for RemasterError {
    fn from(e: midi_analysis::Error) -> Self {
        match e {
            midi_analysis::Error::Parse(message) => Self::Parse(message),
            midi_analysis::Error::UnsupportedFormat(format) => Self::UnsupportedFormat(format),
            midi_analysis::Error::ParseTimeout => Self::ParseTimeout,
        }
    }
}

pub type Result<T> = std::result::Result<T, RemasterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_kebab_case() {
        let body = ErrorBody::new(ErrorCode::PayloadTooLarge, "too big");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "payload-too-large");
        assert!(json.get("debug").is_none());
        assert_eq!(ErrorCode::MlUnavailable.as_str(), "ml-unavailable");
    }

    #[test]
    fn test_as_str_matches_serde() {
        for code in [
            ErrorCode::InvalidExtension,
            ErrorCode::SoundfontNotFound,
            ErrorCode::ParseTimeout,
            ErrorCode::InvalidRequestId,
            ErrorCode::GenerationTimeout,
        ] {
            let json = serde_json::to_value(code).unwrap();
            assert_eq!(json, code.as_str());
        }
    }

    #[test]
    fn test_statuses() {
        assert_eq!(RemasterError::InvalidContentType("text/plain".into()).status(), 415);
        assert_eq!(
            RemasterError::PayloadTooLarge { size: 2, limit: 1 }.status(),
            413
        );
        assert_eq!(RemasterError::ParseTimeout.status(), 400);
        assert_eq!(
            RemasterError::from(scratch::ScratchError::InvalidId("x".into())).code(),
            ErrorCode::InvalidRequestId
        );
    }

    #[test]
    fn test_loader_errors_map() {
        assert_eq!(
            RemasterError::from(midi_analysis::Error::UnsupportedFormat(2)).code(),
            ErrorCode::UnsupportedFormat
        );
        assert_eq!(
            RemasterError::from(midi_analysis::Error::ParseTimeout).code(),
            ErrorCode::ParseTimeout
        );
    }

    #[test]
    fn test_processing_detail_hides_internals() {
        let body = RemasterError::Processing("join error: panicked".into()).to_body();
        assert!(!body.detail.contains("panicked"));
        assert!(body.debug.unwrap().contains("panicked"));
    }
}
