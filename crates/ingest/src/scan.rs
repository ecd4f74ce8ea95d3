use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::config::IngestConfig;
use crate::job::{generate_id, Job, JobState};
use crate::sidecar;

/// Media file extensions to consider for ingestion
const MEDIA_EXTENSIONS: &[&str] = &["mkv", "mp4", "m4v", "avi", "mov", "webm", "ts", "m2ts"];

/// Tokens that start the release-info tail of a file name
const RELEASE_TOKENS: &[&str] = &[
    "bluray", "bdrip", "brrip", "webrip", "web", "webdl", "hdtv", "dvdrip", "remux", "uhd", "hdr", "hdr10",
    "dv", "x264", "x265", "h264", "h265", "hevc", "av1", "xvid", "10bit", "8bit", "aac", "ac3", "eac3",
    "flac", "dts", "truehd", "atmos", "proper", "repack", "extended", "unrated", "4k",
];

/// Result of scanning a file
#[derive(Debug, Clone)]
pub enum ScanResult {
    /// File should be processed (path, size in bytes)
    Candidate(PathBuf, u64),
    /// File should be skipped (path, reason)
    Skipped(PathBuf, String),
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| MEDIA_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Scan library roots for candidate media files.
///
/// Every media file is sized twice, `stable_wait_secs` apart; files that grew
/// in between are still being copied and are skipped this round.
pub async fn scan_library(cfg: &IngestConfig) -> Result<Vec<ScanResult>> {
    let mut results = Vec::new();
    let mut first_pass: Vec<(PathBuf, u64)> = Vec::new();
    let mut files_checked = 0;

    for root in &cfg.library_roots {
        if !root.exists() {
            warn!("Library root does not exist: {}", root.display());
            continue;
        }

        info!("Scanning directory: {}", root.display());

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !is_media_file(path) {
                continue;
            }

            files_checked += 1;
            if files_checked % 1000 == 0 {
                debug!("Checked {} media files so far...", files_checked);
            }

            if sidecar::has_skip_marker(path) {
                results.push(ScanResult::Skipped(path.to_path_buf(), "skip marker (.ingestskip) exists".to_string()));
                continue;
            }

            match std::fs::metadata(path) {
                Ok(meta) => first_pass.push((path.to_path_buf(), meta.len())),
                Err(e) => warn!("Failed to stat file {}: {}", path.display(), e),
            }
        }
    }

    if !first_pass.is_empty() && cfg.stable_wait_secs > 0 {
        debug!("Waiting {}s to check {} file(s) for stability", cfg.stable_wait_secs, first_pass.len());
        tokio::time::sleep(tokio::time::Duration::from_secs(cfg.stable_wait_secs)).await;
    }

    for (path, size0) in first_pass {
        let size1 = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                results.push(ScanResult::Skipped(path, format!("vanished during scan: {}", e)));
                continue;
            }
        };
        if size1 != size0 || size1 == 0 {
            results.push(ScanResult::Skipped(path, "file still copying".to_string()));
            continue;
        }
        debug!("Found candidate: {} ({} bytes)", path.display(), size1);
        results.push(ScanResult::Candidate(path, size1));
    }

    let candidates = results.iter().filter(|r| matches!(r, ScanResult::Candidate(..))).count();
    info!("Scan complete: {} media files, {} candidates", files_checked, candidates);
    Ok(results)
}

fn remove_bracketed(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    for c in text.chars() {
        match c {
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// `1080p`, `720i` and friends
fn is_resolution(word: &str) -> bool {
    let digits = word.trim_end_matches(|c| c == 'p' || c == 'i');
    digits.len() != word.len() && digits.len() >= 3 && digits.chars().all(|c| c.is_ascii_digit())
}

/// Normalized key used to recognize a file as one already known.
///
/// Lower-cased, bracketed groups and years dropped, cut at the first release
/// token, separators collapsed. Season and episode tokens are kept, so every
/// episode has its own key.
pub fn title_key(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let cleaned = remove_bracketed(&stem);
    let mut words = Vec::new();
    for word in cleaned.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        if RELEASE_TOKENS.contains(&word) || is_resolution(word) {
            break;
        }
        words.push(word);
    }

    if words.is_empty() {
        stem.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        words.join(" ")
    }
}

/// What discovery needs to know about the outside world, passed explicitly
#[derive(Debug, Clone, Default)]
pub struct DiscoveryContext {
    /// Ids of every job known or created in this round
    pub active_ids: HashSet<String>,
    pub fast_mode: bool,
    pub fast_keywords: Vec<String>,
    pub translate_all: bool,
    pub translate_keywords: Vec<String>,
}

fn matches_keyword(path: &Path, keywords: &[String]) -> bool {
    let haystack = path.to_string_lossy().to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .any(|k| haystack.contains(&k.to_lowercase()))
}

impl DiscoveryContext {
    pub fn from_config(cfg: &IngestConfig, known: &[Job]) -> Self {
        Self {
            active_ids: known.iter().map(|j| j.id.clone()).collect(),
            fast_mode: cfg.fast_mode,
            fast_keywords: cfg.fast_keywords.clone(),
            translate_all: cfg.translate_all,
            translate_keywords: cfg.translate_keywords.clone(),
        }
    }

    pub fn is_fast(&self, path: &Path) -> bool {
        self.fast_mode || matches_keyword(path, &self.fast_keywords)
    }

    pub fn wants_translation(&self, path: &Path) -> bool {
        self.translate_all || matches_keyword(path, &self.translate_keywords)
    }

    fn apply_flags(&self, job: &mut Job) {
        let path = job.input_path();
        job.fast = self.is_fast(&path);
        job.translate = self.wants_translation(&path);
    }
}

fn modified_time(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path).ok()?.modified().ok().map(DateTime::<Utc>::from)
}

/// Decide which candidates need a pipeline run.
///
/// A file matching a complete job whose source is unchanged is skipped. A
/// changed source gets a fresh job; an unfinished one is run again.
pub fn plan_jobs(candidates: &[(PathBuf, u64)], known: &[Job], ctx: &mut DiscoveryContext) -> Vec<Job> {
    let by_path: HashMap<PathBuf, &Job> = known.iter().map(|j| (j.input_path(), j)).collect();
    let mut by_key: HashMap<&str, &Job> = HashMap::new();
    for job in known {
        // Latest job wins for a key
        by_key.insert(job.title_key.as_str(), job);
    }

    let mut planned = Vec::new();
    for (path, size) in candidates {
        let key = title_key(path);
        let existing = by_path.get(path).or_else(|| by_key.get(key.as_str())).copied();

        match existing {
            Some(job) if job.source_changed(*size, modified_time(path)) || job.input_path() != *path => {
                let mut fresh = Job::new(generate_id(&ctx.active_ids), path, key);
                ctx.active_ids.insert(fresh.id.clone());
                ctx.apply_flags(&mut fresh);
                info!("Source changed for job {}, new job {} for: {}", job.id, fresh.id, path.display());
                planned.push(fresh);
            }
            Some(job) if job.state == JobState::Complete => {
                debug!("Job {} already complete: {}", job.id, path.display());
            }
            Some(job) => {
                let mut again = job.clone();
                ctx.apply_flags(&mut again);
                info!("Job {} unfinished ({:?}), running again: {}", again.id, again.state, path.display());
                planned.push(again);
            }
            None => {
                let mut job = Job::new(generate_id(&ctx.active_ids), path, key);
                ctx.active_ids.insert(job.id.clone());
                ctx.apply_flags(&mut job);
                info!("Created job {} for: {} ({} bytes)", job.id, path.display(), size);
                planned.push(job);
            }
        }
    }

    planned
}
