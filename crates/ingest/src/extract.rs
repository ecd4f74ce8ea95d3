use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use crate::config::IngestConfig;
use crate::ffprobe::{ProbeData, ProbeStream, StreamKind};
use crate::job::{discard_file, Stream};
use crate::runner::{CommandRunner, Invocation};
use crate::subtitle::ass::StyledDocument;
use crate::subtitle::{is_styled_codec, is_text_codec};

/// File extension for a raw subtitle copy
pub fn subtitle_extension(codec: &str) -> &str {
    match codec {
        "subrip" | "srt" => "srt",
        "ass" => "ass",
        "ssa" => "ssa",
        "webvtt" => "vtt",
        "mov_text" => "mp4",
        "hdmv_pgs_subtitle" => "sup",
        // Bitmap tracks have no standalone format ffmpeg writes, keep them in Matroska
        "dvd_subtitle" | "dvb_subtitle" => "mks",
        other => other,
    }
}

/// File extension for a raw audio copy
pub fn audio_extension(codec: &str) -> &str {
    match codec {
        "aac" => "m4a",
        "vorbis" => "ogg",
        "opus" => "opus",
        "truehd" => "thd",
        "mp3" => "mp3",
        "flac" => "flac",
        "ac3" => "ac3",
        "eac3" => "eac3",
        "dts" => "dts",
        c if c.starts_with("pcm_") => "wav",
        other => other,
    }
}

/// Keep only the last path component and characters safe in a file name
fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(name);
    base.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Build the record for a probed stream, without a location yet
fn stream_record(probe: &ProbeStream, kind: StreamKind) -> Stream {
    Stream {
        index: probe.index,
        kind,
        codec: probe.codec().to_string(),
        language: probe.language().map(str::to_string),
        title: probe.title().map(str::to_string),
        filename: probe.filename().map(str::to_string),
        mimetype: probe.mimetype().map(str::to_string),
        channels: probe.channels,
        location: None,
        styled_location: None,
    }
}

/// Convert an ASS file to plain WebVTT holding only the spoken lines
pub fn bridge_styled(ass_path: &Path, vtt_path: &Path) -> Result<usize> {
    let raw = fs::read_to_string(ass_path)
        .with_context(|| format!("Failed to read styled subtitle: {}", ass_path.display()))?;
    let doc = StyledDocument::parse(&raw);
    let plain = doc.to_plain_cues();
    fs::write(vtt_path, &plain)
        .with_context(|| format!("Failed to write bridged subtitle: {}", vtt_path.display()))?;
    Ok(doc.spoken().count())
}

/// Writes the tracks of one input file into its job directory
pub struct Extractor<'a> {
    runner: &'a dyn CommandRunner,
    cfg: &'a IngestConfig,
    job_id: &'a str,
    job_dir: &'a Path,
}

impl<'a> Extractor<'a> {
    pub fn new(runner: &'a dyn CommandRunner, cfg: &'a IngestConfig, job_id: &'a str, job_dir: &'a Path) -> Self {
        Self { runner, cfg, job_id, job_dir }
    }

    fn ffmpeg(&self) -> Invocation {
        Invocation::new(&self.cfg.ffmpeg_bin)
            .args(["-hide_banner", "-nostdin", "-y", "-v", "error"])
            .low_priority(self.cfg.low_priority)
    }

    /// Map one stream of `input` into `output` with the given subtitle/audio codec
    async fn map_stream(&self, input: &Path, index: u32, codec_args: &[&str], output: &Path) -> Result<()> {
        let inv = self
            .ffmpeg()
            .arg("-i")
            .path_arg(input)
            .args(["-map".to_string(), format!("0:{}", index)])
            .args(codec_args.iter().copied())
            .path_arg(output);

        let result = self.runner.run(&inv).await?.check(&format!("extraction of stream {}", index));
        if let Err(e) = result {
            discard_file(output);
            return Err(e);
        }
        if !output.is_file() {
            bail!("ffmpeg reported success but wrote no {}", output.display());
        }
        Ok(())
    }

    /// Extract every stream of `kind` found by the probe.
    ///
    /// Streams whose conversions all fail are logged and left out of the result.
    pub async fn extract_streams(&self, input: &Path, probe: &ProbeData, kind: StreamKind) -> Vec<Stream> {
        let enabled = match kind {
            StreamKind::Subtitle => true,
            StreamKind::Audio => self.cfg.extract_audio,
            StreamKind::Attachment => self.cfg.extract_attachments,
            StreamKind::Video | StreamKind::Data => false,
        };
        if !enabled {
            debug!("Job {}: {} extraction disabled", self.job_id, kind.as_str());
            return Vec::new();
        }

        let mut extracted = Vec::new();
        for probed in probe.streams_of(kind) {
            let record = stream_record(probed, kind);
            let result = match kind {
                StreamKind::Subtitle => self.extract_subtitle(input, record).await,
                StreamKind::Audio => self.extract_audio(input, record).await,
                _ => self.extract_attachment(input, record).await,
            };
            match result {
                Ok(stream) => {
                    debug!(
                        "Job {}: {} stream {} -> {}",
                        self.job_id,
                        kind.as_str(),
                        stream.index,
                        stream.location.as_deref().unwrap_or("-")
                    );
                    extracted.push(stream);
                }
                Err(e) => warn!(
                    "Job {}: skipping {} stream {} ({}): {:#}",
                    self.job_id,
                    kind.as_str(),
                    probed.index,
                    probed.codec(),
                    e
                ),
            }
        }

        info!("📦 Job {}: extracted {} {} stream(s)", self.job_id, extracted.len(), kind.as_str());
        extracted
    }

    /// WebVTT directly, else ASS bridged to WebVTT, else a raw copy
    async fn extract_subtitle(&self, input: &Path, mut stream: Stream) -> Result<Stream> {
        let index = stream.index;
        let codec = stream.codec.clone();
        let vtt_name = format!("sub_{}.vtt", index);
        let vtt_path = self.job_dir.join(&vtt_name);

        // Styled tracks converted straight to WebVTT would keep their signs and drawings
        if is_text_codec(&codec) && !is_styled_codec(&codec) {
            match self.map_stream(input, index, &["-c:s", "webvtt"], &vtt_path).await {
                Ok(()) => {
                    stream.location = Some(vtt_name);
                    return Ok(stream);
                }
                Err(e) => warn!("Job {}: WebVTT conversion of stream {} failed: {:#}", self.job_id, index, e),
            }
        }

        if is_text_codec(&codec) {
            let ass_name = format!("sub_{}.ass", index);
            let ass_path = self.job_dir.join(&ass_name);
            let bridged = match self.map_stream(input, index, &["-c:s", "ass"], &ass_path).await {
                Ok(()) => bridge_styled(&ass_path, &vtt_path),
                Err(e) => Err(e),
            };
            match bridged {
                Ok(spoken) => {
                    debug!("Job {}: stream {} bridged, {} spoken lines", self.job_id, index, spoken);
                    stream.location = Some(vtt_name);
                    stream.styled_location = Some(ass_name);
                    return Ok(stream);
                }
                Err(e) => warn!("Job {}: styled conversion of stream {} failed: {:#}", self.job_id, index, e),
            }
        }

        let copy_name = format!("sub_{}.{}", index, subtitle_extension(&codec));
        self.map_stream(input, index, &["-c", "copy"], &self.job_dir.join(&copy_name))
            .await?;
        stream.location = Some(copy_name);
        Ok(stream)
    }

    async fn extract_audio(&self, input: &Path, mut stream: Stream) -> Result<Stream> {
        let name = format!("audio_{}.{}", stream.index, audio_extension(&stream.codec));
        self.map_stream(input, stream.index, &["-c", "copy"], &self.job_dir.join(&name))
            .await?;
        stream.location = Some(name);
        Ok(stream)
    }

    async fn extract_attachment(&self, input: &Path, mut stream: Stream) -> Result<Stream> {
        let name = match stream.filename.as_deref().map(safe_file_name).filter(|n| !n.is_empty()) {
            Some(file) => format!("att_{}_{}", stream.index, file),
            None => format!("att_{}.bin", stream.index),
        };
        let path: PathBuf = self.job_dir.join(&name);

        // ffmpeg dumps the attachment, then complains about the missing output; the file decides
        let inv = self
            .ffmpeg()
            .args([format!("-dump_attachment:{}", stream.index)])
            .path_arg(&path)
            .arg("-i")
            .path_arg(input);
        let output = self.runner.run(&inv).await?;

        if !path.is_file() {
            let text = String::from_utf8_lossy(&output.combined()).into_owned();
            bail!("attachment was not written: {}", text.trim());
        }
        stream.location = Some(name);
        Ok(stream)
    }
}
