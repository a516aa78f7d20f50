use anyhow::{anyhow, bail, Context, Result};
use ndarray::{ArrayD, IxDyn};

use crate::mask::{self, NormalizedMask};
use crate::reply::RawReply;
use crate::store;

/// Candidate field names, most likely first. The first present, non-nil field wins.
pub const MASK_FIELD_PRIORITY: [&str; 5] = ["masks", "mask", "segmentation", "prediction", "outputs"];

/// A mapping carrying this field is a typed message, never bare mask data.
pub const DISCRIMINATOR_FIELD: &str = "type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Field(&'static str),
    WholeMapping,
    Envelope,
    Bare,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Mask(NormalizedMask),
    NotFound,
}

/// Pick the part of a reply that holds the mask.
///
/// 1. priority fields, text key then byte key, skipping nil values
/// 2. a mapping without a `type` discriminator is itself the data
/// 3. a mapping that is a numeric-array envelope is itself the data
/// 4. anything that is not a mapping is the data
pub fn locate_payload(reply: &RawReply) -> Option<(PayloadSource, &RawReply)> {
    if !reply.is_mapping() {
        return Some((PayloadSource::Bare, reply));
    }
    for name in MASK_FIELD_PRIORITY {
        if let Some(value) = reply.fields(name).find(|value| !value.is_nil()) {
            return Some((PayloadSource::Field(name), value));
        }
    }
    if !reply.contains_key(DISCRIMINATOR_FIELD) {
        return Some((PayloadSource::WholeMapping, reply));
    }
    if is_array_envelope(reply) {
        return Some((PayloadSource::Envelope, reply));
    }
    None
}

/// Reduce a reply tree to a 2-D mask at the server's resolution.
pub fn reduce_reply(reply: &RawReply) -> Result<Option<NormalizedMask>> {
    let Some((source, payload)) = locate_payload(reply) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    let array = payload_to_array(payload).with_context(|| match source {
        PayloadSource::Field(name) => format!("field '{name}' is not array-like"),
        PayloadSource::WholeMapping => "reply mapping is not array-like".to_string(),
        PayloadSource::Envelope => "reply array envelope is malformed".to_string(),
        PayloadSource::Bare => format!("bare {} reply is not array-like", payload.kind_name()),
    })?;
    reduce_array(array)
}

/// Full normalization: locate, convert, collapse, then match the source resolution.
pub fn normalize(reply: &RawReply, source_shape: (usize, usize)) -> Result<Normalized> {
    match reduce_reply(reply)? {
        Some(mask) => Ok(Normalized::Mask(mask::postprocess(mask, source_shape)?)),
        None => Ok(Normalized::NotFound),
    }
}

/// Unary-variant body: an `.npz` archive holding `masks`, else an encoded image.
pub fn normalize_body(body: &[u8], source_shape: (usize, usize)) -> Result<Normalized> {
    if body.is_empty() {
        return Ok(Normalized::NotFound);
    }
    match reduce_array(decode_body(body)?)? {
        Some(mask) => Ok(Normalized::Mask(mask::postprocess(mask, source_shape)?)),
        None => Ok(Normalized::NotFound),
    }
}

pub fn decode_body(body: &[u8]) -> Result<ArrayD<u8>> {
    match store::read_mask_array(std::io::Cursor::new(body)) {
        Ok(array) => Ok(array),
        Err(archive_err) => {
            let image = image::load_from_memory(body).map_err(|image_err| {
                anyhow!(
                    "reply body is neither an npz archive ({archive_err:#}) nor an encoded image ({image_err})"
                )
            })?;
            mask::image_to_array(image)
        }
    }
}

fn reduce_array(array: ArrayD<u8>) -> Result<Option<NormalizedMask>> {
    if array.is_empty() {
        return Ok(None);
    }
    mask::collapse(array).map(Some)
}

/// Convert a located payload into a dense `u8` array.
pub fn payload_to_array(payload: &RawReply) -> Result<ArrayD<u8>> {
    match payload {
        RawReply::Sequence(_) => sequence_to_array(payload),
        RawReply::Mapping(_) if is_array_envelope(payload) => envelope_to_array(payload),
        RawReply::Mapping(_) => bail!("mapping without array data"),
        RawReply::Bytes(bytes) => {
            let image = image::load_from_memory(bytes)
                .context("byte payload is not an encoded image")?;
            mask::image_to_array(image)
        }
        other => bail!("{} payload cannot hold a mask", other.kind_name()),
    }
}

fn sequence_to_array(payload: &RawReply) -> Result<ArrayD<u8>> {
    let shape = nested_shape(payload)?;
    let mut values = Vec::with_capacity(shape.iter().product());
    flatten_into(payload, &mut values)?;
    ArrayD::from_shape_vec(IxDyn(&shape), values).context("nested sequence has inconsistent size")
}

fn nested_shape(value: &RawReply) -> Result<Vec<usize>> {
    match value {
        RawReply::Sequence(items) => {
            let Some(first) = items.first() else {
                return Ok(vec![0]);
            };
            let inner = nested_shape(first)?;
            for (idx, item) in items.iter().enumerate().skip(1) {
                if nested_shape(item)? != inner {
                    bail!("ragged nested sequence at index {idx}");
                }
            }
            let mut shape = Vec::with_capacity(inner.len() + 1);
            shape.push(items.len());
            shape.extend(inner);
            Ok(shape)
        }
        _ => Ok(Vec::new()),
    }
}

fn flatten_into(value: &RawReply, out: &mut Vec<u8>) -> Result<()> {
    match value {
        RawReply::Sequence(items) => {
            for item in items {
                flatten_into(item, out)?;
            }
            Ok(())
        }
        leaf => {
            out.push(scalar_to_u8(leaf)?);
            Ok(())
        }
    }
}

/// Clip, never rescale: 0/1 and 0/255 conventions pass through untouched.
fn scalar_to_u8(value: &RawReply) -> Result<u8> {
    match value {
        RawReply::Integer(number) => Ok((*number).clamp(0, 255) as u8),
        RawReply::Float(number) => Ok(clip_float(*number)),
        RawReply::Bool(flag) => Ok(u8::from(*flag)),
        other => bail!("{} element inside a mask array", other.kind_name()),
    }
}

/// Saturating, truncating cast; NaN becomes 0.
fn clip_float(value: f64) -> u8 {
    value as u8
}

/// Arrays packed by numpy-aware MessagePack encoders:
/// `{nd: true, type: "<dtype>", kind: "", shape: [..], data: <bytes>}`.
pub fn is_array_envelope(value: &RawReply) -> bool {
    value.get("nd").map(RawReply::is_truthy).unwrap_or(false)
        && value.contains_key("shape")
        && value.contains_key("data")
        && value.contains_key("type")
}

fn envelope_to_array(envelope: &RawReply) -> Result<ArrayD<u8>> {
    if let Some(kind) = envelope.get("kind") {
        if !kind.is_empty() {
            bail!("array envelope of kind '{}' is not numeric", kind.as_text().unwrap_or("?"));
        }
    }
    let dtype = envelope
        .get("type")
        .and_then(RawReply::as_text)
        .context("array envelope dtype is not text")?;
    let element = ElementType::parse(dtype)?;
    let shape = match envelope.get("shape") {
        Some(RawReply::Sequence(dims)) => dims
            .iter()
            .map(|dim| dim.as_u64().and_then(|value| usize::try_from(value).ok()))
            .collect::<Option<Vec<usize>>>()
            .context("array envelope shape must be non-negative integers")?,
        _ => bail!("array envelope shape is not a sequence"),
    };
    let data = envelope
        .get("data")
        .and_then(RawReply::as_bytes)
        .context("array envelope data is not a byte string")?;
    if data.len() % element.size != 0 {
        bail!(
            "array envelope data length {} is not a multiple of {}",
            data.len(),
            element.size
        );
    }
    let Some(count) = shape
        .iter()
        .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    else {
        bail!("array envelope shape {shape:?} is too large");
    };
    if data.len() / element.size != count {
        bail!(
            "array envelope holds {} elements but shape {:?} needs {count}",
            data.len() / element.size,
            shape
        );
    }
    let values = data
        .chunks_exact(element.size)
        .map(|chunk| element.to_u8(chunk))
        .collect::<Vec<u8>>();
    ArrayD::from_shape_vec(IxDyn(&shape), values).context("array envelope shape mismatch")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Bool,
    Unsigned,
    Signed,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ElementType {
    kind: ElementKind,
    size: usize,
    big_endian: bool,
}

impl ElementType {
    /// numpy `dtype.str` notation, e.g. `|u1`, `<f4`, `>i2`, `|b1`.
    fn parse(dtype: &str) -> Result<Self> {
        let dtype = dtype.trim();
        let (big_endian, rest) = match dtype.chars().next() {
            Some('>') => (true, &dtype[1..]),
            Some('<') | Some('|') | Some('=') => (false, &dtype[1..]),
            _ => (false, dtype),
        };
        let mut chars = rest.chars();
        let kind = match chars.next() {
            Some('b') => ElementKind::Bool,
            Some('u') => ElementKind::Unsigned,
            Some('i') => ElementKind::Signed,
            Some('f') => ElementKind::Float,
            _ => bail!("unsupported array dtype '{dtype}'"),
        };
        let size: usize = chars
            .as_str()
            .parse()
            .with_context(|| format!("unsupported array dtype '{dtype}'"))?;
        let supported = match kind {
            ElementKind::Bool => size == 1,
            ElementKind::Unsigned | ElementKind::Signed => matches!(size, 1 | 2 | 4 | 8),
            ElementKind::Float => matches!(size, 4 | 8),
        };
        if !supported {
            bail!("unsupported array dtype '{dtype}'");
        }
        Ok(Self {
            kind,
            size,
            big_endian,
        })
    }

    fn to_u8(self, chunk: &[u8]) -> u8 {
        let mut raw = [0u8; 8];
        raw[..self.size].copy_from_slice(chunk);
        if self.big_endian {
            raw[..self.size].reverse();
        }
        match self.kind {
            ElementKind::Bool => u8::from(raw[0] != 0),
            ElementKind::Unsigned => u64::from_le_bytes(raw).min(255) as u8,
            ElementKind::Signed => {
                let shift = 64 - 8 * self.size as u32;
                let value = (i64::from_le_bytes(raw) << shift) >> shift;
                value.clamp(0, 255) as u8
            }
            ElementKind::Float if self.size == 4 => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&raw[..4]);
                clip_float(f64::from(f32::from_le_bytes(bytes)))
            }
            ElementKind::Float => clip_float(f64::from_le_bytes(raw)),
        }
    }
}
