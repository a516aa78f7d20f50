use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::{ArrayD, Ix2};
use ndarray_npy::{NpzReader, NpzWriter, ReadableElement};

use crate::mask::NormalizedMask;

/// Array name inside every result archive; `np.load(path)["masks"]` reads it back.
pub const MASK_ARRAY_NAME: &str = "masks";
pub const ARCHIVE_EXTENSION: &str = "npz";

/// Identities already present in the result store, scanned once at the start
/// of a run. Only finished `.npz` files count; in-flight temp files end in
/// `.partial` and never do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchState {
    completed: BTreeSet<String>,
}

impl BatchState {
    pub fn contains(&self, identity: &str) -> bool {
        self.completed.contains(identity)
    }

    pub fn insert(&mut self, identity: impl Into<String>) {
        self.completed.insert(identity.into());
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

/// One compressed `.npz` archive per item, named after the item identity.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create output directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.{ARCHIVE_EXTENSION}"))
    }

    pub fn exists(&self, identity: &str) -> bool {
        self.path_for(identity).is_file()
    }

    pub fn scan(&self) -> Result<BatchState> {
        let mut state = BatchState::default();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(state),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("failed to scan {}", self.root.display())))
            }
        };
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let is_archive = path
                .extension()
                .and_then(|value| value.to_str())
                .map(|value| value == ARCHIVE_EXTENSION)
                .unwrap_or(false);
            if !is_archive {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|value| value.to_str()) {
                state.insert(stem);
            }
        }
        Ok(state)
    }

    pub fn store(&self, identity: &str, mask: &NormalizedMask) -> Result<PathBuf> {
        let path = self.path_for(identity);
        write_archive(&path, mask)?;
        Ok(path)
    }

    pub fn load(&self, identity: &str) -> Result<NormalizedMask> {
        read_archive(&self.path_for(identity))
    }
}

/// Write `mask` to `path` through a hidden sibling temp file and an atomic
/// rename, so a crash never leaves a truncated archive under the final name.
pub fn write_archive(path: &Path, mask: &NormalizedMask) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("mask");
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{stem}."))
        .suffix(".partial")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    {
        let mut npz = NpzWriter::new_compressed(temp.as_file_mut());
        npz.add_array(MASK_ARRAY_NAME, mask)
            .with_context(|| format!("failed to encode mask for {}", path.display()))?;
        npz.finish()
            .with_context(|| format!("failed to finish archive for {}", path.display()))?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("failed to move archive into place at {}", path.display()))?;
    Ok(())
}

pub fn read_archive(path: &Path) -> Result<NormalizedMask> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    read_mask_array(file)?
        .into_dimensionality::<Ix2>()
        .with_context(|| format!("{} does not hold a 2-D mask", path.display()))
}

/// Read the `masks` array from an `.npz` stream as `u8`, accepting the element
/// types segmentation servers commonly emit.
pub fn read_mask_array<R: Read + Seek>(reader: R) -> Result<ArrayD<u8>> {
    let mut npz = NpzReader::new(reader).context("not an npz archive")?;
    let names = npz.names().context("unreadable npz index")?;
    let Some(name) = names.into_iter().find(|name| name == MASK_ARRAY_NAME) else {
        bail!("npz archive has no '{MASK_ARRAY_NAME}' array");
    };

    if let Some(array) = read_converted::<_, u8, _>(&mut npz, &name, |v| v) {
        return Ok(array);
    }
    if let Some(array) = read_converted::<_, bool, _>(&mut npz, &name, u8::from) {
        return Ok(array);
    }
    if let Some(array) = read_converted::<_, i64, _>(&mut npz, &name, |v| v.clamp(0, 255) as u8) {
        return Ok(array);
    }
    if let Some(array) = read_converted::<_, i32, _>(&mut npz, &name, |v| v.clamp(0, 255) as u8) {
        return Ok(array);
    }
    if let Some(array) = read_converted::<_, f32, _>(&mut npz, &name, |v| v as u8) {
        return Ok(array);
    }
    if let Some(array) = read_converted::<_, f64, _>(&mut npz, &name, |v| v as u8) {
        return Ok(array);
    }
    bail!("npz array '{name}' has an unsupported element type")
}

fn read_converted<R, T, F>(npz: &mut NpzReader<R>, name: &str, convert: F) -> Option<ArrayD<u8>>
where
    R: Read + Seek,
    T: ReadableElement + Copy,
    F: Fn(T) -> u8,
{
    let array: ArrayD<T> = npz.by_name(name).ok()?;
    Some(array.mapv(convert))
}
