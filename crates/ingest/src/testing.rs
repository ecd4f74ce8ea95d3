//! Scripted stand-ins for external programs, shared by the unit tests

use std::path::Path;
use std::sync::Mutex;
use anyhow::Result;
use async_trait::async_trait;
use crate::runner::{CommandOutput, CommandRunner, Invocation};

/// Pretends to be ffmpeg/ffprobe: writes the output file named by the last
/// argument and answers probes with canned JSON.
#[derive(Debug, Default)]
pub struct FakeRunner {
    /// Returned for `ffprobe -show_streams`
    pub probe_json: String,
    /// Returned for packet scans
    pub packets_csv: String,
    /// Returned when the output is stdout (`-`)
    pub raw_stdout: Vec<u8>,
    /// Calls whose arguments contain any of these substrings fail
    pub fail_when: Vec<String>,
    pub calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub fn new(probe_json: &str) -> Self {
        Self { probe_json: probe_json.to_string(), ..Default::default() }
    }

    pub fn failing(mut self, pattern: &str) -> Self {
        self.fail_when.push(pattern.to_string());
        self
    }

    /// Every recorded call as a command line
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(Invocation::display).collect())
            .unwrap_or_default()
    }

    fn ok(stdout: Vec<u8>) -> CommandOutput {
        CommandOutput { success: true, exit_code: Some(0), stdout, stderr: Vec::new() }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }

        let joined = invocation.args.join(" ");
        if self.fail_when.iter().any(|p| joined.contains(p.as_str())) {
            return Ok(CommandOutput {
                success: false,
                exit_code: Some(1),
                stdout: Vec::new(),
                stderr: b"simulated failure\n".to_vec(),
            });
        }

        let program = invocation.program.to_string_lossy();
        if program.contains("ffprobe") {
            if joined.contains("-show_streams") {
                return Ok(Self::ok(self.probe_json.clone().into_bytes()));
            }
            return Ok(Self::ok(self.packets_csv.clone().into_bytes()));
        }

        // Attachments are dumped next to the -dump_attachment option, not at the end
        if let Some(pos) = invocation.args.iter().position(|a| a.starts_with("-dump_attachment")) {
            if let Some(out) = invocation.args.get(pos + 1) {
                std::fs::write(out, b"attachment")?;
            }
            return Ok(CommandOutput { success: false, exit_code: Some(1), ..Default::default() });
        }

        match invocation.args.last().map(String::as_str) {
            Some("-") => Ok(Self::ok(self.raw_stdout.clone())),
            Some(out) => {
                let path = Path::new(out);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, format!("output of {}", invocation.display()))?;
                Ok(Self::ok(Vec::new()))
            }
            None => Ok(Self::ok(Vec::new())),
        }
    }
}

/// A short mkv with one video, two audio and two subtitle tracks and a font
pub const PROBE_JSON: &str = r#"{
    "streams": [
        {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
        {"index": 1, "codec_type": "audio", "codec_name": "aac", "channels": 2, "tags": {"language": "jpn"}},
        {"index": 2, "codec_type": "audio", "codec_name": "flac", "channels": 6, "tags": {"language": "eng"}},
        {"index": 3, "codec_type": "subtitle", "codec_name": "subrip", "tags": {"language": "eng"}},
        {"index": 4, "codec_type": "subtitle", "codec_name": "hdmv_pgs_subtitle", "tags": {"language": "jpn"}},
        {"index": 5, "codec_type": "attachment", "codec_name": "ttf", "tags": {"filename": "Main Font.ttf", "mimetype": "font/ttf"}}
    ],
    "format": {"format_name": "matroska,webm", "duration": "1425.024000"},
    "chapters": [
        {"start_time": "0.000000", "end_time": "90.000000", "tags": {"title": "Opening"}},
        {"start_time": "90.000000", "end_time": "1425.024000", "tags": {"title": "Part A"}}
    ]
}"#;
