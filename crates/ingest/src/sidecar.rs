use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::debug;

/// Image extensions accepted as poster art
const POSTER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Check if a skip marker (.ingestskip) exists for a file
pub fn has_skip_marker(file_path: &Path) -> bool {
    skip_marker_path(file_path).exists()
}

/// Get the path to the skip marker file for a given media file
pub fn skip_marker_path(file_path: &Path) -> PathBuf {
    file_path.with_extension("ingestskip")
}

fn first_existing(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|p| p.is_file())
}

/// Poster art next to the media file: `poster.*`, `<stem>.*`, `folder.jpg`, `cover.jpg`
pub fn find_poster(media: &Path) -> Option<PathBuf> {
    let dir = media.parent()?;
    let stem = media.file_stem()?.to_string_lossy().into_owned();

    let mut candidates: Vec<PathBuf> = POSTER_EXTENSIONS.iter().map(|ext| dir.join(format!("poster.{}", ext))).collect();
    candidates.extend(POSTER_EXTENSIONS.iter().map(|ext| dir.join(format!("{}.{}", stem, ext))));
    candidates.push(dir.join("folder.jpg"));
    candidates.push(dir.join("cover.jpg"));
    first_existing(candidates)
}

/// Descriptive text next to the media file: `<stem>.nfo`, then `description.txt`
pub fn find_description(media: &Path) -> Option<PathBuf> {
    let dir = media.parent()?;
    first_existing([media.with_extension("nfo"), dir.join("description.txt")])
}

/// Sidecar files copied into a job directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sidecars {
    pub poster: Option<PathBuf>,
    pub info: Option<PathBuf>,
}

fn copy_as(source: &Path, job_dir: &Path, base: &str) -> Result<PathBuf> {
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| "bin".to_string());
    let target = job_dir.join(format!("{}.{}", base, ext));
    fs::copy(source, &target)
        .with_context(|| format!("Failed to copy {} to {}", source.display(), target.display()))?;
    debug!("Copied sidecar {} -> {}", source.display(), target.display());
    Ok(target)
}

/// Copy poster art and descriptive text as `poster.<ext>` / `info.<ext>`
pub fn copy_sidecars(media: &Path, job_dir: &Path) -> Result<Sidecars> {
    let poster = find_poster(media).map(|p| copy_as(&p, job_dir, "poster")).transpose()?;
    let info = find_description(media).map(|p| copy_as(&p, job_dir, "info")).transpose()?;
    Ok(Sidecars { poster, info })
}
