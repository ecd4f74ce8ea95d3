use std::path::Path;
use std::collections::HashMap;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::runner::{CommandRunner, Invocation};

/// Complete ffprobe output structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: ProbeFormat,
    #[serde(default)]
    pub chapters: Vec<ProbeChapter>,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    #[serde(default)]
    pub format_name: String,
    /// Seconds, as ffprobe prints them
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub channels: Option<u32>,
    pub tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeChapter {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub tags: Option<HashMap<String, String>>,
}

/// What a container stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    Attachment,
    Data,
}

impl StreamKind {
    pub fn from_codec_type(codec_type: &str) -> Option<Self> {
        match codec_type {
            "video" => Some(StreamKind::Video),
            "audio" => Some(StreamKind::Audio),
            "subtitle" => Some(StreamKind::Subtitle),
            "attachment" => Some(StreamKind::Attachment),
            "data" => Some(StreamKind::Data),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
            StreamKind::Subtitle => "subtitle",
            StreamKind::Attachment => "attachment",
            StreamKind::Data => "data",
        }
    }
}

fn tag<'a>(tags: &'a Option<HashMap<String, String>>, key: &str) -> Option<&'a str> {
    // Matroska writes FILENAME/MIMETYPE in upper case, mp4 in lower case
    tags.as_ref()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.trim().is_empty())
}

impl ProbeStream {
    pub fn kind(&self) -> Option<StreamKind> {
        self.codec_type.as_deref().and_then(StreamKind::from_codec_type)
    }

    pub fn codec(&self) -> &str {
        self.codec_name.as_deref().unwrap_or("unknown")
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        tag(&self.tags, key)
    }

    pub fn language(&self) -> Option<&str> {
        self.tag("language")
    }

    pub fn title(&self) -> Option<&str> {
        self.tag("title")
    }

    pub fn filename(&self) -> Option<&str> {
        self.tag("filename")
    }

    pub fn mimetype(&self) -> Option<&str> {
        self.tag("mimetype")
    }
}

impl ProbeChapter {
    pub fn title(&self) -> Option<&str> {
        tag(&self.tags, "title")
    }
}

impl ProbeData {
    /// Container duration in seconds, if ffprobe reported one
    pub fn duration(&self) -> Option<f64> {
        self.format.duration.as_deref().and_then(|d| d.trim().parse().ok())
    }

    pub fn first_video(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.kind() == Some(StreamKind::Video))
    }

    pub fn streams_of(&self, kind: StreamKind) -> impl Iterator<Item = &ProbeStream> {
        self.streams.iter().filter(move |s| s.kind() == Some(kind))
    }
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file(runner: &dyn CommandRunner, ffprobe: &Path, file_path: &Path) -> Result<ProbeData> {
    use log::debug;

    // Verify file exists before trying to probe
    if !file_path.exists() {
        anyhow::bail!("File does not exist: {}", file_path.display());
    }

    let inv = Invocation::new(ffprobe)
        .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format", "-show_chapters"])
        .path_arg(file_path);

    let output = runner
        .run(&inv)
        .await
        .with_context(|| format!("Failed to execute ffprobe for: {}", file_path.display()))?
        .check(&format!("ffprobe of {}", file_path.display()))?;

    let json_str = String::from_utf8(output.stdout)
        .context("ffprobe output is not valid UTF-8")?;

    let data: ProbeData = serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))?;

    debug!("ffprobe: {} streams, {} chapters in {}", data.streams.len(), data.chapters.len(), file_path.display());
    Ok(data)
}

/// End time in seconds of the last packet of the first video stream
pub async fn last_video_packet_time(runner: &dyn CommandRunner, ffprobe: &Path, file_path: &Path) -> Result<Option<f64>> {
    let inv = Invocation::new(ffprobe)
        .args([
            "-v", "error",
            "-select_streams", "v:0",
            "-show_entries", "packet=pts_time,duration_time",
            "-of", "csv=p=0",
        ])
        .path_arg(file_path);

    let output = runner
        .run(&inv)
        .await
        .with_context(|| format!("Failed to read packets of: {}", file_path.display()))?
        .check("ffprobe packet scan")?;

    Ok(parse_packet_end(&String::from_utf8_lossy(&output.stdout)))
}

fn parse_packet_end(csv: &str) -> Option<f64> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',');
            let pts: f64 = fields.next()?.trim().parse().ok()?;
            let dur: f64 = fields.next().and_then(|d| d.trim().parse().ok()).unwrap_or(0.0);
            Some(pts + dur)
        })
        .fold(None, |acc: Option<f64>, end| Some(acc.map_or(end, |a| a.max(end))))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "channels": 6, "tags": {"language": "jpn"}},
            {"index": 2, "codec_type": "subtitle", "codec_name": "ass", "tags": {"language": "eng", "title": "Full"}},
            {"index": 3, "codec_type": "attachment", "codec_name": "ttf", "tags": {"FILENAME": "font.ttf", "MIMETYPE": "font/ttf"}}
        ],
        "format": {"format_name": "matroska,webm", "duration": "1425.024000"},
        "chapters": [{"start_time": "0.000000", "end_time": "90.000000", "tags": {"title": "Opening"}}]
    }"#;

    #[test]
    fn test_parse_probe_json() {
        let data: ProbeData = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(data.duration(), Some(1425.024));
        assert_eq!(data.first_video().and_then(|v| v.width), Some(1920));
        assert_eq!(data.streams_of(StreamKind::Subtitle).count(), 1);
        assert_eq!(data.streams[1].language(), Some("jpn"));
        assert_eq!(data.streams[3].filename(), Some("font.ttf"));
        assert_eq!(data.streams[3].mimetype(), Some("font/ttf"));
        assert_eq!(data.chapters[0].title(), Some("Opening"));
    }

    #[test]
    fn test_packet_end_takes_latest_packet() {
        let csv = "0.000000,0.041708\n10.010000,0.041708\n5.000000,0.041708\nN/A,N/A\n";
        let end = parse_packet_end(csv).unwrap();
        assert!((end - 10.051708).abs() < 1e-6);
        assert_eq!(parse_packet_end(""), None);
    }
}
