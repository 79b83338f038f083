//! Per-request event log.
//!
//! Every stage appends here. Events are returned to the caller in the
//! response and persisted in `metadata.json`; each one is also mirrored to
//! `tracing` so operators see the same stream.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// RFC 3339 UTC with milliseconds.
    pub ts: String,
    pub level: Level,
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

/// Append-only, ordered as stages ran.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    request_id: String,
    events: Vec<PipelineEvent>,
}

impl EventLog {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            events: Vec::new(),
        }
    }

    pub fn info(&mut self, stage: &str, message: impl Into<String>) {
        self.push(Level::Info, stage, message.into(), None);
    }

    pub fn warn(&mut self, stage: &str, message: impl Into<String>, debug: Option<String>) {
        self.push(Level::Warn, stage, message.into(), debug);
    }

    pub fn error(&mut self, stage: &str, message: impl Into<String>, debug: Option<String>) {
        self.push(Level::Error, stage, message.into(), debug);
    }

    pub fn events(&self) -> &[PipelineEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<PipelineEvent> {
        self.events
    }

    fn push(&mut self, level: Level, stage: &str, message: String, debug: Option<String>) {
        let id = self.request_id.as_str();
        let detail = debug.as_deref();
        match level {
            Level::Info => info!(request.id = %id, stage, "{message}"),
            Level::Warn => warn!(request.id = %id, stage, detail, "{message}"),
            Level::Error => error!(request.id = %id, stage, detail, "{message}"),
        }
        self.events.push(PipelineEvent {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            stage: stage.to_string(),
            message,
            debug,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_keep_order() {
        let mut log = EventLog::new("abc");
        log.info("intake", "accepted");
        log.warn("render", "synth missing", Some("fluidsynth: not found".into()));
        log.error("generate", "failed", None);

        let stages: Vec<_> = log.events().iter().map(|e| e.stage.as_str()).collect();
        assert_eq!(stages, ["intake", "render", "generate"]);
        assert_eq!(log.events()[1].level, Level::Warn);
    }

    #[test]
    fn test_debug_detail_kept() {
        let mut log = EventLog::new("abc");
        log.warn("encode", "kept as WAV", Some("lame exited 1".into()));
        log.error("render", "failed", Some("segfault".into()));
        assert_eq!(log.events()[0].debug.as_deref(), Some("lame exited 1"));
        assert_eq!(log.events()[1].debug.as_deref(), Some("segfault"));
        assert_eq!(log.events()[1].level, Level::Error);
    }

    #[test]
    fn test_timestamp_format() {
        let mut log = EventLog::new("abc");
        log.info("parse", "ok");
        let ts = &log.events()[0].ts;
        assert!(ts.ends_with('Z'), "{ts}");
        // 2026-01-01T00:00:00.000Z
        assert_eq!(ts.len(), 24, "{ts}");
    }

    #[test]
    fn test_serialized_shape() {
        let mut log = EventLog::new("abc");
        log.info("parse", "ok");
        let json = serde_json::to_value(&log.events()[0]).unwrap();
        assert_eq!(json["level"], "info");
        assert!(json.get("debug").is_none());
    }
}
