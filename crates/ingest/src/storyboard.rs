//! Thumbnail sprite sheets for scrubbing previews, plus the WebVTT index
//! that maps each time range to a rectangle inside a sheet.

use std::fs;
use std::path::Path;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use crate::config::{IngestConfig, StoryboardConfig};
use crate::ffprobe::{last_video_packet_time, probe_file};
use crate::runner::{CommandRunner, Invocation};
use crate::subtitle::ass::format_vtt_time;

pub const INDEX_FILE: &str = "storyboard.vtt";

/// Container and packet durations further apart than this are treated as disagreeing
const DURATION_TOLERANCE_SECS: f64 = 1.0;

/// Geometry shared by every sheet of one video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpriteLayout {
    pub thumb_width: u32,
    pub thumb_height: u32,
    /// Seconds between thumbnails
    pub interval: u64,
    /// Seconds covered by one sheet
    pub chunk_secs: u64,
    pub per_chunk: u32,
    pub columns: u32,
    pub rows: u32,
    pub chunks: u32,
    /// Thumbnails over the whole video
    pub total: u32,
}

/// One index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpriteCue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub sprite: String,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

pub fn sprite_name(chunk: u32) -> String {
    format!("sprite_{:03}.jpg", chunk)
}

/// Smallest `c` with `c * c >= n`
fn ceil_sqrt(n: u32) -> u32 {
    let mut c = (n as f64).sqrt() as u32;
    while c * c < n {
        c += 1;
    }
    while c > 1 && (c - 1) * (c - 1) >= n {
        c -= 1;
    }
    c.max(1)
}

/// Compute the sheet geometry, or `None` for a video without usable size or length
pub fn layout(duration_ms: u64, width: u32, height: u32, cfg: &StoryboardConfig) -> Option<SpriteLayout> {
    if duration_ms == 0 || width == 0 || height == 0 {
        return None;
    }

    let interval = cfg.interval_secs.max(1);
    // Whole number of thumbnails per sheet
    let chunk_secs = (cfg.chunk_secs.max(interval) / interval) * interval;
    let per_chunk = (chunk_secs / interval) as u32;

    let thumb_height = (cfg.thumb_height.max(2) + 1) / 2 * 2;
    let raw_width = (width as u64 * thumb_height as u64 + height as u64 / 2) / height as u64;
    let thumb_width = (((raw_width + 1) / 2) * 2).max(2) as u32;

    let interval_ms = interval * 1000;
    let total = ((duration_ms + interval_ms - 1) / interval_ms) as u32;
    let chunks = (total + per_chunk - 1) / per_chunk;
    let columns = ceil_sqrt(per_chunk);
    let rows = (per_chunk + columns - 1) / columns;

    Some(SpriteLayout { thumb_width, thumb_height, interval, chunk_secs, per_chunk, columns, rows, chunks, total })
}

impl SpriteLayout {
    /// Thumbnails held by sheet `chunk`
    pub fn thumbs_in(&self, chunk: u32) -> u32 {
        (self.total - chunk * self.per_chunk).min(self.per_chunk)
    }

    /// Rows actually used by sheet `chunk`; the last sheet may be shorter
    pub fn rows_in(&self, chunk: u32) -> u32 {
        (self.thumbs_in(chunk) + self.columns - 1) / self.columns
    }

    /// Index entries for every thumbnail, placed with integer arithmetic
    pub fn cues(&self, duration_ms: u64) -> Vec<SpriteCue> {
        let interval_ms = self.interval * 1000;
        (0..self.total)
            .map(|i| {
                let chunk = i / self.per_chunk;
                let pos = i % self.per_chunk;
                let start_ms = i as u64 * interval_ms;
                SpriteCue {
                    start_ms,
                    end_ms: (start_ms + interval_ms).min(duration_ms),
                    sprite: sprite_name(chunk),
                    x: (pos % self.columns) * self.thumb_width,
                    y: (pos / self.columns) * self.thumb_height,
                    width: self.thumb_width,
                    height: self.thumb_height,
                }
            })
            .collect()
    }
}

pub fn render_index(cues: &[SpriteCue]) -> String {
    let mut out = String::from("WEBVTT\n");
    for cue in cues {
        out.push_str(&format!(
            "\n{} --> {}\n{}#xywh={},{},{},{}\n",
            format_vtt_time(cue.start_ms),
            format_vtt_time(cue.end_ms),
            cue.sprite,
            cue.x,
            cue.y,
            cue.width,
            cue.height
        ));
    }
    out
}

/// Container duration, replaced by the last packet time when the two disagree
async fn actual_duration(runner: &dyn CommandRunner, ffprobe: &Path, video: &Path, container: Option<f64>) -> Option<f64> {
    let packets = match last_video_packet_time(runner, ffprobe, video).await {
        Ok(end) => end,
        Err(e) => {
            warn!("Packet scan of {} failed: {:#}", video.display(), e);
            None
        }
    };
    match (container, packets) {
        (Some(c), Some(p)) if (c - p).abs() > DURATION_TOLERANCE_SECS => {
            debug!("Container says {:.3}s, last packet ends at {:.3}s", c, p);
            Some(p)
        }
        (Some(c), _) => Some(c),
        (None, p) => p,
    }
}

/// Build sheets and index for `reference` inside `job_dir`. Returns the number of sheets.
pub async fn generate(runner: &dyn CommandRunner, cfg: &IngestConfig, job_id: &str, reference: &Path, job_dir: &Path) -> Result<u32> {
    let probe = probe_file(runner, &cfg.ffprobe_bin, reference).await?;
    let video = probe
        .first_video()
        .with_context(|| format!("No video stream in {}", reference.display()))?;
    let (width, height) = (video.width.unwrap_or(0), video.height.unwrap_or(0));

    let Some(duration) = actual_duration(runner, &cfg.ffprobe_bin, reference, probe.duration()).await else {
        bail!("Could not determine the duration of {}", reference.display());
    };
    let duration_ms = (duration * 1000.0).round() as u64;

    let Some(layout) = layout(duration_ms, width, height, &cfg.storyboard) else {
        bail!("Video {}x{} of {:.3}s has nothing to sample", width, height, duration);
    };
    info!(
        "🖼️  Job {}: {} thumbnails of {}x{} in {} sheet(s)",
        job_id, layout.total, layout.thumb_width, layout.thumb_height, layout.chunks
    );

    for chunk in 0..layout.chunks {
        let output = job_dir.join(sprite_name(chunk));
        let filter = format!(
            "fps=1/{},scale={}:{},tile={}x{}",
            layout.interval,
            layout.thumb_width,
            layout.thumb_height,
            layout.columns,
            layout.rows_in(chunk)
        );
        let inv = Invocation::new(&cfg.ffmpeg_bin)
            .args(["-hide_banner", "-nostdin", "-y", "-v", "error"])
            .args(["-ss".to_string(), (chunk as u64 * layout.chunk_secs).to_string()])
            .args(["-t".to_string(), layout.chunk_secs.to_string()])
            .arg("-i")
            .path_arg(reference)
            .args(["-vf".to_string(), filter])
            .args(["-frames:v", "1", "-q:v", "4"])
            .path_arg(&output)
            .low_priority(cfg.low_priority);

        runner.run(&inv).await?.check(&format!("sprite sheet {}", chunk))?;
    }

    let index = job_dir.join(INDEX_FILE);
    fs::write(&index, render_index(&layout.cues(duration_ms)))
        .with_context(|| format!("Failed to write storyboard index: {}", index.display()))?;

    Ok(layout.chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use proptest::prelude::*;

    fn cfg(chunk_secs: u64, interval_secs: u64, thumb_height: u32) -> StoryboardConfig {
        StoryboardConfig { chunk_secs, interval_secs, thumb_height }
    }

    #[test]
    fn test_ceil_sqrt() {
        assert_eq!(ceil_sqrt(1), 1);
        assert_eq!(ceil_sqrt(60), 8);
        assert_eq!(ceil_sqrt(64), 8);
        assert_eq!(ceil_sqrt(65), 9);
    }

    #[test]
    fn test_layout_for_1080p() {
        let l = layout(1_425_024, 1920, 1080, &cfg(600, 10, 90)).unwrap();
        assert_eq!((l.thumb_width, l.thumb_height), (160, 90));
        assert_eq!(l.per_chunk, 60);
        assert_eq!((l.columns, l.rows), (8, 8));
        assert_eq!(l.total, 143);
        assert_eq!(l.chunks, 3);
        assert_eq!(l.thumbs_in(2), 23);
        assert_eq!(l.rows_in(2), 3);
    }

    #[test]
    fn test_odd_widths_round_to_even() {
        let l = layout(60_000, 720, 404, &cfg(600, 10, 90)).unwrap();
        assert_eq!(l.thumb_width % 2, 0);
        assert_eq!(l.thumb_width, 160);
        assert!(layout(0, 1920, 1080, &cfg(600, 10, 90)).is_none());
        assert!(layout(60_000, 0, 0, &cfg(600, 10, 90)).is_none());
    }

    #[test]
    fn test_index_entries() {
        let l = layout(25_000, 1920, 1080, &cfg(20, 10, 90)).unwrap();
        let cues = l.cues(25_000);
        assert_eq!(cues.len(), 3);
        let index = render_index(&cues);
        assert!(index.starts_with("WEBVTT\n\n00:00:00.000 --> 00:00:10.000\nsprite_000.jpg#xywh=0,0,160,90\n"));
        assert!(index.contains("00:00:10.000 --> 00:00:20.000\nsprite_000.jpg#xywh=160,0,160,90\n"));
        assert!(index.contains("00:00:20.000 --> 00:00:25.000\nsprite_001.jpg#xywh=0,0,160,90\n"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn test_cues_stay_inside_their_sheet(
            duration_ms in 1u64..20_000_000,
            width in 16u32..4096,
            height in 16u32..2160,
            interval in 1u64..30,
            chunk in 1u64..1200,
        ) {
            let l = layout(duration_ms, width, height, &cfg(chunk, interval, 90)).unwrap();
            let cues = l.cues(duration_ms);
            prop_assert_eq!(cues.len() as u32, l.total);
            for (i, cue) in cues.iter().enumerate() {
                prop_assert!(cue.x + cue.width <= l.columns * l.thumb_width);
                prop_assert!(cue.y + cue.height <= l.rows * l.thumb_height);
                prop_assert_eq!(cue.start_ms, i as u64 * l.interval * 1000);
                prop_assert!(cue.end_ms <= duration_ms);
            }
            prop_assert_eq!(cues.last().map(|c| c.end_ms), Some(duration_ms));
        }
    }

    #[tokio::test]
    async fn test_packet_time_overrides_wrong_container_duration() {
        let mut runner = FakeRunner::default();
        runner.packets_csv = "0.0,0.5\n42.0,0.5\n".to_string();
        let d = actual_duration(&runner, Path::new("ffprobe"), Path::new("/x.mp4"), Some(3600.0)).await;
        assert_eq!(d, Some(42.5));
        let d = actual_duration(&runner, Path::new("ffprobe"), Path::new("/x.mp4"), Some(42.9)).await;
        assert_eq!(d, Some(42.9));
    }

    #[tokio::test]
    async fn test_generate_writes_sheets_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new(crate::testing::PROBE_JSON);
        let cfg = IngestConfig::default();
        let reference = dir.path().join("h264.mp4");
        fs::write(&reference, b"video").unwrap();

        let sheets = generate(&runner, &cfg, "job1", &reference, dir.path()).await.unwrap();
        assert_eq!(sheets, 3);
        for chunk in 0..3 {
            assert!(dir.path().join(sprite_name(chunk)).is_file());
        }
        let index = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(index.contains("sprite_002.jpg#xywh="));
        assert!(runner.commands().iter().any(|c| c.contains("tile=8x3")));
    }
}
