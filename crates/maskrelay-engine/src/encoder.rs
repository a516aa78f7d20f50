use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use maskrelay_contracts::items::{WireRequest, WorkItem, WORK_ITEM_TYPE};

use crate::config::{RequestOptions, TransportKind};

/// Request body ready for a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    /// MessagePack map for the streaming variant.
    Packed(Vec<u8>),
    /// Multipart upload for the unary variant.
    Upload(UploadPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadPayload {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
    pub mode: String,
}

pub fn wire_request(item: &WorkItem, options: &RequestOptions) -> Result<WireRequest> {
    let resource_path = item
        .resource_path()
        .to_str()
        .with_context(|| {
            format!(
                "resource path is not valid UTF-8: {}",
                item.resource_path().display()
            )
        })?
        .to_string();
    Ok(WireRequest {
        kind: WORK_ITEM_TYPE.to_string(),
        resource_path,
        text: item.prompt().to_string(),
        frame_index: item.frame_index(),
        confidence: options.confidence,
    })
}

/// The streaming variant sends a path reference and lets the server read the
/// file; the unary variant has no shared filesystem and uploads the bytes.
pub fn encode(item: &WorkItem, kind: TransportKind, options: &RequestOptions) -> Result<WirePayload> {
    match kind {
        TransportKind::Streaming => {
            let request = wire_request(item, options)?;
            let packed = rmp_serde::to_vec_named(&request).context("failed to pack request")?;
            Ok(WirePayload::Packed(packed))
        }
        TransportKind::Unary => {
            let path = item.resource_path();
            let bytes =
                fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
            Ok(WirePayload::Upload(UploadPayload {
                file_name: item.file_name(),
                mime: mime_for_path(path),
                bytes,
                mode: options.mode.clone(),
            }))
        }
    }
}

fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}
