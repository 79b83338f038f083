//! Run provenance written next to the artifacts.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{RemasterError, Result};
use crate::events::PipelineEvent;
use crate::intake::Mode;
use crate::mapper::ChannelRemap;
use crate::styles::ConsoleStyle;

pub const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub input_filename: String,
    pub mode: Mode,
    pub style: ConsoleStyle,
    /// RFC 3339 UTC, set when the run started.
    pub timestamp: String,
    pub tool_versions: BTreeMap<String, String>,
    /// Checkpoint id used for generation, if any.
    pub checkpoint: Option<String>,
    /// Generation ran on the base model because no checkpoint resolved.
    pub fallback_to_base: bool,
    pub classifications: Vec<ChannelRemap>,
    pub events: Vec<PipelineEvent>,
}

impl RunMetadata {
    /// Write once. An existing file is an error, never overwritten.
    pub async fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| RemasterError::Processing(format!("metadata encode: {e}")))?;
        let io = |source| RemasterError::Io {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(io)?;
        file.write_all(&json).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        Ok(())
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let bytes = std::fs::read(&path).map_err(|source| RemasterError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RemasterError::Processing(format!("metadata decode: {e}")))
    }
}
