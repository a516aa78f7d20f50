use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use maskrelay_contracts::items::WorkItem;

pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Images directly inside `dir`, sorted by path. A missing or non-directory
/// input is a configuration error; an empty directory is not.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        bail!("input directory does not exist: {}", dir.display());
    }
    if !dir.is_dir() {
        bail!("input path is not a directory: {}", dir.display());
    }
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && is_image_path(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|value| value.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// One single-image work item per path. Paths are made absolute so the server
/// can open them regardless of its working directory. Symlinks are kept as
/// they are: the identity comes from the enumerated name, not the link target.
pub fn work_items(paths: &[PathBuf], prompt: &str) -> Result<Vec<WorkItem>> {
    paths
        .iter()
        .map(|path| Ok(WorkItem::image(absolute_path(path)?, prompt)))
        .collect()
}

pub fn absolute_path(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("failed to resolve {}", path.display()))
}
