use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug)]
enum JournalSink {
    File(PathBuf),
    Discard,
}

/// Per-run progress journal. Every batch step (start, each item outcome,
/// interrupt or abort, finish) becomes one JSON line stamped with the run id
/// and a microsecond UTC timestamp, so a tail of `events.jsonl` shows where a
/// run stopped. Payload keys are written after the stamp and win on clash.
///
/// Clones share the same journal and lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Journal>,
}

#[derive(Debug)]
struct Journal {
    sink: JournalSink,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self::open(JournalSink::File(path.into()), run_id.into())
    }

    /// Stamps events without writing them anywhere.
    pub fn discard(run_id: impl Into<String>) -> Self {
        Self::open(JournalSink::Discard, run_id.into())
    }

    fn open(sink: JournalSink, run_id: String) -> Self {
        Self {
            inner: Arc::new(Journal {
                sink,
                run_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.inner.sink {
            JournalSink::File(path) => Some(path),
            JournalSink::Discard => None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    /// Stamp and append one event, returning the object as written. The file is
    /// reopened per event; a missing parent directory is created.
    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let record = self.stamp(event_type, payload);
        if let JournalSink::File(path) = &self.inner.sink {
            append_line(&self.inner.lock, path, &record)?;
        }
        Ok(record)
    }

    fn stamp(&self, event_type: &str, payload: EventPayload) -> Value {
        let mut record = Map::with_capacity(payload.len() + 3);
        record.insert("type".to_string(), Value::from(event_type));
        record.insert("run_id".to_string(), Value::from(self.run_id()));
        record.insert("ts".to_string(), Value::from(now_utc_iso()));
        record.extend(payload);
        Value::Object(record)
    }
}

fn append_line(lock: &Mutex<()>, path: &Path, record: &Value) -> anyhow::Result<()> {
    let line = serde_json::to_string(record)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let _guard = lock
        .lock()
        .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
