use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use maskrelay_contracts::items::WorkItem;

use crate::config::{RequestOptions, TransportKind};
use crate::encoder::encode;
use crate::inputs::absolute_path;
use crate::mask::{overlay, source_shape, NormalizedMask};
use crate::normalize::{normalize, Normalized};
use crate::store::write_archive;
use crate::transport::{Connector, ServerReply};

pub const DEFAULT_PROBE_CONFIDENCE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeAttempt {
    pub prompt: String,
    /// `None` when the prompt produced a mask, otherwise why it did not.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub attempts: Vec<ProbeAttempt>,
    pub matched: Option<(String, NormalizedMask)>,
}

impl ProbeOutcome {
    pub fn matched_prompt(&self) -> Option<&str> {
        self.matched.as_ref().map(|(prompt, _)| prompt.as_str())
    }
}

/// Try `prompts` in order against one image over a single streaming channel,
/// stopping at the first that yields a mask. Per-prompt failures are recorded;
/// losing the connection ends the probe with an error.
pub fn probe_prompts(
    connector: &dyn Connector,
    image_path: &Path,
    prompts: &[String],
    options: &RequestOptions,
) -> Result<ProbeOutcome> {
    if connector.kind() != TransportKind::Streaming {
        bail!(
            "prompt probing needs a streaming server (ws:// or wss://), got {}",
            connector.endpoint()
        );
    }
    if prompts.is_empty() {
        bail!("at least one prompt is required");
    }
    let resource = absolute_path(image_path)?;
    let shape = source_shape(&resource)?;

    let mut channel = connector.open()?;
    let mut outcome = ProbeOutcome {
        attempts: Vec::new(),
        matched: None,
    };
    for prompt in prompts {
        let item = WorkItem::image(&resource, prompt.as_str());
        let payload = encode(&item, TransportKind::Streaming, options)?;
        let reply = match channel.exchange(payload) {
            Ok(reply) => reply,
            Err(err) if err.is_connection() => {
                channel.close();
                return Err(err.into());
            }
            Err(err) => {
                outcome.attempts.push(ProbeAttempt {
                    prompt: prompt.clone(),
                    failure: Some(err.message().to_string()),
                });
                continue;
            }
        };
        let normalized = match &reply {
            ServerReply::Tree(tree) => normalize(tree, shape),
            ServerReply::Body(_) => Err(anyhow::anyhow!("unexpected unary reply body")),
        };
        match normalized {
            Ok(Normalized::Mask(mask)) => {
                let covered = mask.iter().filter(|value| **value > 0).count();
                tracing::info!(prompt = %prompt, covered, "prompt matched");
                outcome.attempts.push(ProbeAttempt {
                    prompt: prompt.clone(),
                    failure: None,
                });
                outcome.matched = Some((prompt.clone(), mask));
                break;
            }
            Ok(Normalized::NotFound) => outcome.attempts.push(ProbeAttempt {
                prompt: prompt.clone(),
                failure: Some("no mask found in server reply".to_string()),
            }),
            Err(err) => outcome.attempts.push(ProbeAttempt {
                prompt: prompt.clone(),
                failure: Some(format!("{err:#}")),
            }),
        }
    }
    channel.close();
    Ok(outcome)
}

/// Persist a probe hit: the mask archive plus a green-tinted overlay of the
/// source image.
pub fn save_probe_result(
    image_path: &Path,
    mask: &NormalizedMask,
    archive_path: &Path,
    overlay_path: &Path,
) -> Result<()> {
    write_archive(archive_path, mask)?;
    let source = image::open(image_path)
        .with_context(|| format!("failed to open {}", image_path.display()))?
        .to_rgb8();
    let tinted = overlay(&source, mask)?;
    if let Some(parent) = overlay_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent)?;
    }
    tinted
        .save(overlay_path)
        .with_context(|| format!("failed to write overlay {}", overlay_path.display()))?;
    Ok(())
}
