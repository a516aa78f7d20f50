use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use maskrelay_contracts::events::{EventPayload, EventWriter};
use maskrelay_contracts::items::{ItemReport, ItemState, WorkItem};
use maskrelay_contracts::runs::summary::BatchSummary;
use serde_json::{json, Value};

use crate::config::RequestOptions;
use crate::encoder::encode;
use crate::mask::source_shape;
use crate::normalize::{normalize, normalize_body, Normalized};
use crate::store::{BatchState, ResultStore};
use crate::transport::{Channel, Connector, ExchangeError, ServerReply};

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Result of one pass over the work list. `abort` is set when a connection
/// failure ended the run early; item failures only show up in the summary.
#[derive(Debug)]
pub struct BatchOutcome {
    pub summary: BatchSummary,
    pub abort: Option<ExchangeError>,
}

impl BatchOutcome {
    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }
}

/// Sequential batch loop over one lazily opened channel.
pub struct BatchDriver<'a> {
    connector: &'a dyn Connector,
    store: &'a ResultStore,
    options: RequestOptions,
    events: EventWriter,
    stop: Arc<AtomicBool>,
}

impl<'a> BatchDriver<'a> {
    pub fn new(
        connector: &'a dyn Connector,
        store: &'a ResultStore,
        options: RequestOptions,
        events: EventWriter,
    ) -> Self {
        Self {
            connector,
            store,
            options,
            events,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a stop flag with an interrupt handler. The flag is checked before
    /// each item. A connection failure while the flag is set counts as an
    /// interrupt, which is how a connector holding the same flag ends a wait.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Journal writes after `batch_started` never end the run; the masks on
    /// disk are the record that matters.
    fn note(&self, event: &str, payload: Value) {
        if let Err(err) = self.events.emit(event, map_object(payload)) {
            tracing::warn!(event, error = %format!("{err:#}"), "failed to append event");
        }
    }

    fn mark_interrupted(&self, summary: &mut BatchSummary, next_index: usize) {
        summary.interrupted = true;
        self.note("batch_interrupted", json!({ "next_index": next_index }));
        tracing::warn!(next_index, "batch interrupted");
    }

    /// Process `items` in order. Items whose identity is already in `state` are
    /// skipped without touching the network; newly stored identities are added
    /// to `state` as the run progresses.
    pub fn run(
        &self,
        items: &[WorkItem],
        state: &mut BatchState,
        progress: &mut dyn FnMut(&ItemReport),
    ) -> Result<BatchOutcome> {
        let total = items.len();
        let mut summary = BatchSummary::new(self.events.run_id(), total as u64);
        self.events.emit(
            "batch_started",
            map_object(json!({
                "total": total,
                "already_done": state.len(),
                "server": self.connector.endpoint(),
                "transport": self.connector.kind().as_str(),
                "output_dir": self.store.root().to_string_lossy().to_string(),
            })),
        )?;
        tracing::info!(
            total,
            already_done = state.len(),
            server = %self.connector.endpoint(),
            "batch started"
        );

        let mut channel: Option<Box<dyn Channel>> = None;
        let mut abort = None;

        for (index, item) in items.iter().enumerate() {
            if self.stop.load(Ordering::SeqCst) {
                self.mark_interrupted(&mut summary, index);
                break;
            }

            let identity = item.identity();
            let mut report = ItemReport {
                index: index + 1,
                total,
                identity: identity.clone(),
                state: ItemState::Pending,
                detail: None,
            };

            if state.contains(&identity) {
                summary.skipped += 1;
                report.state = ItemState::Skipped;
                self.note("item_skipped", json!({ "identity": identity }));
                progress(&report);
                continue;
            }

            if channel.is_none() {
                match self.connector.open() {
                    Ok(opened) => channel = Some(opened),
                    Err(err) => {
                        abort = Some(err);
                        break;
                    }
                }
            }
            let Some(active) = channel.as_mut() else {
                break;
            };

            match self.process_item(active.as_mut(), item) {
                Ok(path) => {
                    state.insert(identity.clone());
                    summary.stored += 1;
                    report.state = ItemState::Stored;
                    report.detail = Some(path.to_string_lossy().to_string());
                    self.note(
                        "item_stored",
                        json!({
                            "identity": identity,
                            "path": path.to_string_lossy().to_string(),
                        }),
                    );
                    progress(&report);
                }
                Err(err) if err.is_connection() && self.stop.load(Ordering::SeqCst) => {
                    tracing::debug!(identity = %identity, error = %err, "exchange ended by stop flag");
                    self.mark_interrupted(&mut summary, index);
                    break;
                }
                Err(err) if err.is_connection() => {
                    abort = Some(err);
                    break;
                }
                Err(err) => {
                    tracing::warn!(identity = %identity, error = %err, "item failed");
                    summary.record_failure(&identity, err.message());
                    report.state = ItemState::Failed;
                    report.detail = Some(err.message().to_string());
                    self.note(
                        "item_failed",
                        json!({
                            "identity": identity,
                            "error": err.message(),
                        }),
                    );
                    progress(&report);
                }
            }
        }

        if let Some(mut open) = channel.take() {
            open.close();
        }

        if let Some(err) = abort.as_ref() {
            summary.aborted = true;
            tracing::error!(error = %err, "server unreachable, aborting batch");
            self.note(
                "batch_aborted",
                json!({
                    "error": err.message(),
                    "stored": summary.stored,
                }),
            );
        }

        summary.finish();
        self.note(
            "batch_finished",
            json!({
                "total": summary.total,
                "stored": summary.stored,
                "skipped": summary.skipped,
                "failed": summary.failed.len(),
                "interrupted": summary.interrupted,
                "aborted": summary.aborted,
            }),
        );
        tracing::info!(
            stored = summary.stored,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "batch finished"
        );

        Ok(BatchOutcome { summary, abort })
    }

    /// PENDING -> SENT -> NORMALIZED -> STORED for one item. Anything other than
    /// a connection failure comes back as an item error.
    fn process_item(
        &self,
        channel: &mut dyn Channel,
        item: &WorkItem,
    ) -> Result<PathBuf, ExchangeError> {
        let identity = item.identity();
        let shape = source_shape(item.resource_path()).map_err(item_error)?;
        let payload = encode(item, channel.kind(), &self.options).map_err(item_error)?;

        let reply = channel.exchange(payload)?;
        tracing::debug!(identity = %identity, state = %ItemState::Sent, "reply received");

        let normalized = match &reply {
            ServerReply::Tree(tree) => normalize(tree, shape),
            ServerReply::Body(body) => normalize_body(body, shape),
        }
        .map_err(item_error)?;
        let mask = match normalized {
            Normalized::Mask(mask) => mask,
            Normalized::NotFound => {
                return Err(ExchangeError::item("no mask found in server reply"));
            }
        };
        tracing::debug!(identity = %identity, state = %ItemState::Normalized, shape = ?mask.dim());

        self.store.store(&identity, &mask).map_err(item_error)
    }
}

fn item_error(err: anyhow::Error) -> ExchangeError {
    ExchangeError::item(format!("{err:#}"))
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}
