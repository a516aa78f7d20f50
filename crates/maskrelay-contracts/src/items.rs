use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Request discriminator every current call site sends. The server reads the
/// referenced file itself, so client and server must share a filesystem view.
pub const WORK_ITEM_TYPE: &str = "video";

/// One image plus the prompt and frame context it is segmented under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    resource_path: PathBuf,
    prompt: String,
    frame_index: u32,
}

impl WorkItem {
    /// `resource_path` should already be absolute; the server resolves it, not us.
    pub fn new(resource_path: impl Into<PathBuf>, prompt: impl Into<String>, frame_index: u32) -> Self {
        Self {
            resource_path: resource_path.into(),
            prompt: prompt.into(),
            frame_index,
        }
    }

    pub fn image(resource_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self::new(resource_path, prompt, 0)
    }

    pub fn resource_path(&self) -> &Path {
        &self.resource_path
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Output identity in the result store: the file stem, suffixed with the
    /// frame number for frames past the first.
    pub fn identity(&self) -> String {
        let stem = self
            .resource_path
            .file_stem()
            .map(|value| value.to_string_lossy().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "item".to_string());
        if self.frame_index == 0 {
            stem
        } else {
            format!("{stem}_{:06}", self.frame_index)
        }
    }

    pub fn file_name(&self) -> String {
        self.resource_path
            .file_name()
            .map(|value| value.to_string_lossy().to_string())
            .unwrap_or_else(|| self.identity())
    }
}

/// Streaming-variant request record, packed as a MessagePack map with named keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub resource_path: String,
    pub text: String,
    pub frame_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Skipped,
    Sent,
    Normalized,
    Stored,
    Failed,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Sent => "sent",
            Self::Normalized => "normalized",
            Self::Stored => "stored",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress update handed to the caller once per item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemReport {
    pub index: usize,
    pub total: usize,
    pub identity: String,
    pub state: ItemState,
    pub detail: Option<String>,
}
