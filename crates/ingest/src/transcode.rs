use std::fs;
use std::path::Path;
use std::sync::Arc;
use anyhow::{bail, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use crate::config::IngestConfig;
use crate::job::{discard_file, MuxedOutput, Stream};
use crate::runner::{CommandRunner, Invocation};

/// Name recorded for the stream-copy output of fast jobs
pub const COPY_OUTPUT: &str = "copy";

/// Target video codecs, each finalized as its own `<name>.mp4`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Av1,
    Hevc,
    H264,
    /// Baseline profile, at most 720 lines, for old devices
    H264Compat,
}

impl Codec {
    pub const ALL: [Codec; 4] = [Codec::Av1, Codec::Hevc, Codec::H264, Codec::H264Compat];

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Av1 => "av1",
            Codec::Hevc => "hevc",
            Codec::H264 => "h264",
            Codec::H264Compat => "h264_compat",
        }
    }

    pub fn output_file(&self) -> String {
        output_file(self.name())
    }

    /// Encoder and rate control arguments
    pub fn encoder_args(&self) -> Vec<&'static str> {
        match self {
            Codec::Av1 => vec!["-c:v", "libsvtav1", "-crf", "32", "-preset", "6", "-pix_fmt", "yuv420p10le"],
            Codec::Hevc => vec![
                "-c:v", "libx265", "-crf", "24", "-preset", "medium", "-pix_fmt", "yuv420p10le", "-tag:v", "hvc1",
            ],
            Codec::H264 => vec!["-c:v", "libx264", "-crf", "20", "-preset", "medium", "-pix_fmt", "yuv420p"],
            Codec::H264Compat => vec![
                "-vf", "scale=-2:'min(720,ih)'",
                "-c:v", "libx264", "-profile:v", "baseline", "-level", "3.1",
                "-crf", "23", "-preset", "fast", "-pix_fmt", "yuv420p",
            ],
        }
    }
}

/// Final output of a recorded codec name
pub fn output_file(name: &str) -> String {
    format!("{}.mp4", name)
}

/// Video-only encode of a codec, gone once its outputs are finalized
pub fn video_file(name: &str) -> String {
    format!("{}.video.mp4", name)
}

fn ffmpeg(cfg: &IngestConfig) -> Invocation {
    Invocation::new(&cfg.ffmpeg_bin)
        .args(["-hide_banner", "-nostdin", "-y", "-v", "error"])
        .low_priority(cfg.low_priority)
}

/// Video-only encode of the first video stream
pub fn encode_invocation(cfg: &IngestConfig, codec: Codec, input: &Path, output: &Path) -> Invocation {
    ffmpeg(cfg)
        .arg("-i")
        .path_arg(input)
        .args(["-map", "0:v:0", "-an", "-sn", "-dn"])
        .args(codec.encoder_args())
        .args(["-movflags", "+faststart"])
        .path_arg(output)
}

/// Run one encoder per codec concurrently and wait for all of them.
///
/// Returns the codecs whose encoder exited cleanly and left an output file,
/// in the requested order. Failed encoders have their partial output removed.
pub async fn transcode_all(
    runner: Arc<dyn CommandRunner>,
    cfg: &IngestConfig,
    job_id: &str,
    input: &Path,
    job_dir: &Path,
    codecs: &[Codec],
) -> Vec<Codec> {
    let succeeded: Arc<Mutex<Vec<Codec>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::with_capacity(codecs.len());

    for &codec in codecs {
        let runner = Arc::clone(&runner);
        let succeeded = Arc::clone(&succeeded);
        let output = job_dir.join(video_file(codec.name()));
        let inv = encode_invocation(cfg, codec, input, &output);
        let job_id = job_id.to_string();

        handles.push(tokio::spawn(async move {
            info!("🎬 Job {}: encoding {}", job_id, codec.name());
            let result = match runner.run(&inv).await {
                Ok(out) => out.check(&format!("{} encode", codec.name())).map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) if output.is_file() => {
                    info!("✅ Job {}: {} finished", job_id, codec.name());
                    succeeded.lock().await.push(codec);
                }
                Ok(()) => warn!("Job {}: {} encoder wrote no output", job_id, codec.name()),
                Err(e) => {
                    warn!("Job {}: {} encode failed: {:#}", job_id, codec.name(), e);
                    discard_file(&output);
                }
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!("Job {}: encode task panicked: {}", job_id, e);
        }
    }

    let mut done = succeeded.lock().await.clone();
    done.sort_by_key(|c| codecs.iter().position(|r| r == c));
    done
}

/// Re-container the first video stream without re-encoding, audio to AAC
pub async fn stream_copy(runner: &dyn CommandRunner, cfg: &IngestConfig, job_id: &str, input: &Path, job_dir: &Path) -> Result<()> {
    let output = job_dir.join(output_file(COPY_OUTPUT));
    let inv = ffmpeg(cfg)
        .arg("-i")
        .path_arg(input)
        .args(["-map", "0:v:0", "-map", "0:a?", "-c:v", "copy", "-c:a", "aac", "-b:a", "192k", "-sn", "-dn"])
        .args(["-movflags", "+faststart"])
        .path_arg(&output);

    info!("⚡ Job {}: stream copy", job_id);
    if let Err(e) = runner.run(&inv).await?.check("stream copy") {
        discard_file(&output);
        return Err(e);
    }
    if !output.is_file() {
        bail!("stream copy wrote no output");
    }
    Ok(())
}

fn audio_codec_args(codec: &str) -> Vec<&'static str> {
    match codec {
        // Already playable inside mp4
        "aac" => vec!["-c:a", "copy"],
        _ => vec!["-c:a", "aac", "-b:a", "192k"],
    }
}

/// Mux every extracted audio track into every encoded video.
///
/// The first track goes into `<codec>.mp4`, every other one into
/// `<codec>.<audio index>.mp4`. Failures are logged and skipped.
pub async fn remux_audio(
    runner: &dyn CommandRunner,
    cfg: &IngestConfig,
    job_id: &str,
    job_dir: &Path,
    codecs: &[String],
    audio: &[Stream],
) -> Vec<MuxedOutput> {
    let mut muxed = Vec::new();

    for codec in codecs {
        let video = job_dir.join(video_file(codec));
        for (position, track) in audio.iter().enumerate() {
            let Some(location) = track.location.as_deref() else { continue };
            let file = match position {
                0 => output_file(codec),
                _ => format!("{}.{}.mp4", codec, track.index),
            };
            let output = job_dir.join(&file);

            let mut inv = ffmpeg(cfg)
                .arg("-i")
                .path_arg(&video)
                .arg("-i")
                .path_arg(&job_dir.join(location))
                .args(["-map", "0:v:0", "-map", "1:a:0", "-c:v", "copy"])
                .args(audio_codec_args(&track.codec));
            if let Some(lang) = track.language.as_deref() {
                inv = inv.args(["-metadata:s:a:0".to_string(), format!("language={}", lang)]);
            }
            let inv = inv.args(["-shortest", "-movflags", "+faststart"]).path_arg(&output);

            let result = match runner.run(&inv).await {
                Ok(out) => out.check(&format!("mux of {} with audio {}", codec, track.index)).map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) if output.is_file() => {
                    debug!("Job {}: muxed {}", job_id, file);
                    muxed.push(MuxedOutput { codec: codec.clone(), audio_index: track.index, file });
                }
                Ok(()) => warn!("Job {}: mux of {} wrote no output", job_id, file),
                Err(e) => {
                    warn!("Job {}: mux of {} failed: {:#}", job_id, file, e);
                    discard_file(&output);
                }
            }
        }
    }

    info!("🔊 Job {}: {} muxed output(s)", job_id, muxed.len());
    muxed
}

/// Settle each codec on its final `<codec>.mp4` and drop the video-only encode.
///
/// A codec without a muxed primary output keeps its encode, renamed. Returns
/// the codecs whose final output exists, in the given order.
pub fn finalize_outputs(job_id: &str, job_dir: &Path, codecs: &[String]) -> Vec<String> {
    let mut finalized = Vec::with_capacity(codecs.len());
    for codec in codecs {
        let video = job_dir.join(video_file(codec));
        let output = job_dir.join(output_file(codec));
        if output.is_file() {
            discard_file(&video);
        } else if let Err(e) = fs::rename(&video, &output) {
            warn!("Job {}: failed to move {} into place: {}", job_id, video.display(), e);
            continue;
        }
        finalized.push(codec.clone());
    }
    finalized
}
