use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::now_utc_iso;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub identity: String,
    pub error: String,
}

/// Outcome of one batch invocation. `interrupted` means the run stopped on
/// request; `aborted` means the server became unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BatchSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub total: u64,
    pub stored: u64,
    pub skipped: u64,
    pub failed: Vec<FailedItem>,
    pub interrupted: bool,
    pub aborted: bool,
}

impl BatchSummary {
    pub fn new(run_id: impl Into<String>, total: u64) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: now_utc_iso(),
            total,
            ..Self::default()
        }
    }

    pub fn record_failure(&mut self, identity: &str, error: impl Into<String>) {
        self.failed.push(FailedItem {
            identity: identity.to_string(),
            error: error.into(),
        });
    }

    /// Items the run never reached, either because of an interrupt or an abort.
    pub fn unvisited(&self) -> u64 {
        self.total
            .saturating_sub(self.stored + self.skipped + self.failed.len() as u64)
    }

    pub fn finish(&mut self) {
        self.finished_at = now_utc_iso();
    }
}

pub fn write_summary(path: &Path, summary: &BatchSummary) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert(
        "unvisited".to_string(),
        Value::Number(summary.unvisited().into()),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}
