use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::ffprobe::StreamKind;

/// Name of the snapshot file inside every job directory
pub const JOB_FILE: &str = "job.json";

/// Pipeline progress. Only ever moves forward within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Incomplete,
    StreamsExtracted,
    Complete,
}

/// An extracted subtitle, audio or attachment track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    /// Index in the source container
    pub index: u32,
    pub kind: StreamKind,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    /// Attachment filename as stored in the container
    pub filename: Option<String>,
    pub mimetype: Option<String>,
    pub channels: Option<u32>,
    /// File relative to the job directory; `None` once the file has been consumed
    pub location: Option<String>,
    /// ASS original kept next to a bridged WebVTT track
    #[serde(default)]
    pub styled_location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub start: f64,
    pub end: f64,
    pub title: Option<String>,
}

/// A video output with one audio track muxed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxedOutput {
    pub codec: String,
    pub audio_index: u32,
    pub file: String,
}

/// Persisted record for one input file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// File name of the input, without directory
    pub input_file: String,
    pub input_dir: PathBuf,
    /// Key used to match a rediscovered file to this job
    pub title_key: String,
    pub checksum: Option<String>,
    /// Seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub encoded_codecs: Vec<String>,
    pub codec_sizes: BTreeMap<String, u64>,
    pub streams: Vec<Stream>,
    #[serde(default)]
    pub muxed: Vec<MuxedOutput>,
    pub chapters: Vec<Chapter>,
    /// Dominant colour samples of the poster art, `#rrggbb`
    pub colors: Vec<String>,
    pub original_size: u64,
    pub original_modified: Option<DateTime<Utc>>,
    /// Stream copy instead of transcode
    pub fast: bool,
    pub translate: bool,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a job for a newly discovered input file
    pub fn new(id: String, input: &Path, title_key: String) -> Self {
        let now = Utc::now();
        let input_file = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let input_dir = input.parent().map(Path::to_path_buf).unwrap_or_default();

        let (original_size, original_modified) = match fs::metadata(input) {
            Ok(meta) => (meta.len(), meta.modified().ok().map(DateTime::<Utc>::from)),
            Err(_) => (0, None),
        };

        Job {
            id,
            input_file,
            input_dir,
            title_key,
            checksum: None,
            duration: 0.0,
            width: 0,
            height: 0,
            encoded_codecs: Vec::new(),
            codec_sizes: BTreeMap::new(),
            streams: Vec::new(),
            muxed: Vec::new(),
            chapters: Vec::new(),
            colors: Vec::new(),
            original_size,
            original_modified,
            fast: false,
            translate: false,
            state: JobState::Incomplete,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn input_path(&self) -> PathBuf {
        self.input_dir.join(&self.input_file)
    }

    /// Output directory of this job, always named by its id
    pub fn dir(&self, output_root: &Path) -> PathBuf {
        output_root.join(&self.id)
    }

    /// Whether the input changed since the job was created
    pub fn source_changed(&self, size: u64, modified: Option<DateTime<Utc>>) -> bool {
        self.original_size != size || self.original_modified != modified
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &Stream> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }
}

/// Remove a partial or intermediate file from a job directory. A file that is
/// already gone is fine; any other failure is logged.
pub fn discard_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Failed to remove {}: {}", path.display(), e),
    }
}

/// Generate a short opaque id not present in `active`
pub fn generate_id(active: &HashSet<String>) -> String {
    loop {
        let id = uuid::Uuid::new_v4().simple().to_string()[..10].to_string();
        if !active.contains(&id) {
            return id;
        }
    }
}

/// Write `<output_root>/<id>/job.json`, replacing the previous snapshot atomically
pub fn save_job(job: &mut Job, output_root: &Path) -> Result<()> {
    job.updated_at = Utc::now();

    let dir = job.dir(output_root);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create job directory: {}", dir.display()))?;

    let json = serde_json::to_string_pretty(job)
        .with_context(|| format!("Failed to serialize job {}", job.id))?;

    let tmp = dir.join(format!("{}.tmp", JOB_FILE));
    let path = dir.join(JOB_FILE);
    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write job file: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("Failed to move job file into place: {}", path.display()))?;

    Ok(())
}

pub fn load_job(path: &Path) -> Result<Job> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))
}

/// Load every job snapshot below `output_root`. Unreadable snapshots are logged and skipped.
pub fn load_all_jobs(output_root: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();

    if !output_root.exists() {
        return Ok(jobs);
    }

    let entries = fs::read_dir(output_root)
        .with_context(|| format!("Failed to read output directory: {}", output_root.display()))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", output_root.display()))?;
        let path = entry.path().join(JOB_FILE);
        if !path.is_file() {
            continue;
        }
        match load_job(&path) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("Skipping unreadable job snapshot {}: {:#}", path.display(), e),
        }
    }

    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_avoids_active_ids() {
        let mut active = HashSet::new();
        for _ in 0..50 {
            let id = generate_id(&active);
            assert_eq!(id.len(), 10);
            assert!(active.insert(id));
        }
    }

    #[test]
    fn test_save_and_load_round_trip_state() {
        let out = tempfile::tempdir().unwrap();
        let mut job = Job::new("abc123".to_string(), Path::new("/media/show/ep01.mkv"), "show".to_string());
        job.state = JobState::StreamsExtracted;
        job.encoded_codecs.push("h264".to_string());
        save_job(&mut job, out.path()).unwrap();

        let path = out.path().join("abc123").join(JOB_FILE);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"state\": \"streams_extracted\""));

        let loaded = load_all_jobs(out.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "abc123");
        assert_eq!(loaded[0].input_path(), PathBuf::from("/media/show/ep01.mkv"));
        assert_eq!(loaded[0].state, JobState::StreamsExtracted);
    }

    #[test]
    fn test_broken_snapshot_is_skipped() {
        let out = tempfile::tempdir().unwrap();
        fs::create_dir_all(out.path().join("broken")).unwrap();
        fs::write(out.path().join("broken").join(JOB_FILE), "{not json").unwrap();
        assert!(load_all_jobs(out.path()).unwrap().is_empty());
    }

    #[test]
    fn test_states_are_ordered() {
        assert!(JobState::Incomplete < JobState::StreamsExtracted);
        assert!(JobState::StreamsExtracted < JobState::Complete);
    }

    #[test]
    fn test_discard_file_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("av1.video.mp4");
        fs::write(&partial, b"partial").unwrap();

        discard_file(&partial);
        assert!(!partial.exists());
        discard_file(&partial);
    }
}
