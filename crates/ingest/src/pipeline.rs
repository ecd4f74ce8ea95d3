//! Drives one job from discovery to a complete, persisted record.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use crate::checksum;
use crate::color;
use crate::config::{IngestConfig, TranslationConfig};
use crate::error::BackendError;
use crate::extract::Extractor;
use crate::ffprobe::{probe_file, ProbeData, StreamKind};
use crate::job::{discard_file, save_job, Chapter, Job, JobState};
use crate::runner::CommandRunner;
use crate::sidecar;
use crate::storyboard;
use crate::transcode::{self, Codec, COPY_OUTPUT};
use crate::translate::backend::{self, TranslationBackend};
use crate::translate::document::{choose_source, SourceChoice};
use crate::translate::translate_track;

/// Builds the translation backend for a job
pub type BackendFactory =
    Arc<dyn Fn(&TranslationConfig) -> Result<Box<dyn TranslationBackend>, BackendError> + Send + Sync>;

/// Runs jobs against one configuration and one process runner
#[derive(Clone)]
pub struct Pipeline {
    cfg: Arc<IngestConfig>,
    runner: Arc<dyn CommandRunner>,
    backends: BackendFactory,
}

impl Pipeline {
    pub fn new(cfg: Arc<IngestConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { cfg, runner, backends: Arc::new(backend::from_config) }
    }

    /// Replace how translation backends are created
    pub fn with_backends(mut self, backends: BackendFactory) -> Self {
        self.backends = backends;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.cfg
    }

    /// Process `job` to completion, saving it after every milestone.
    ///
    /// Fatal errors return immediately and leave whatever was written on disk.
    pub async fn run(&self, job: &mut Job) -> Result<()> {
        if job.state == JobState::Complete {
            info!("Job {}: already complete", job.id);
            return Ok(());
        }

        let output_root = self.cfg.output_dir.as_path();
        let dir = job.dir(output_root);
        let input = job.input_path();
        info!("🚀 Job {}: processing {}", job.id, input.display());

        fs::create_dir_all(&dir)
            .with_context(|| format!("Job {}: failed to create directory {}", job.id, dir.display()))?;
        // Record the job before any stage can fail, so discovery finds it again
        save_job(job, output_root)?;

        let digest = checksum::write_checksum(&input, &dir)
            .await
            .with_context(|| format!("Job {}: checksum failed", job.id))?;
        job.checksum = Some(digest);

        self.copy_sidecars(job, &input, &dir).await;

        let probe = probe_file(self.runner.as_ref(), &self.cfg.ffprobe_bin, &input)
            .await
            .with_context(|| format!("Job {}: probe failed", job.id))?;
        apply_probe(job, &probe).with_context(|| format!("Job {}: unusable input", job.id))?;

        if job.state == JobState::StreamsExtracted && streams_present(job, &dir) {
            info!("Job {}: streams already extracted, resuming", job.id);
        } else {
            self.extract(job, &input, &dir, &probe).await;
            job.state = JobState::StreamsExtracted;
            save_job(job, output_root)?;
        }

        if job.translate {
            self.translate(job, &dir, &probe).await;
        }

        if job.fast {
            transcode::stream_copy(self.runner.as_ref(), &self.cfg, &job.id, &input, &dir)
                .await
                .with_context(|| format!("Job {}: stream copy failed", job.id))?;
            job.encoded_codecs = vec![COPY_OUTPUT.to_string()];
        } else {
            let done = transcode::transcode_all(
                Arc::clone(&self.runner),
                &self.cfg,
                &job.id,
                &input,
                &dir,
                &self.cfg.codecs,
            )
            .await;
            if done.is_empty() {
                bail!("Job {}: no encoder produced output", job.id);
            }
            job.encoded_codecs = done.iter().map(|c| c.name().to_string()).collect();
            self.remux(job, &dir).await;

            job.encoded_codecs = transcode::finalize_outputs(&job.id, &dir, &job.encoded_codecs);
            if job.encoded_codecs.is_empty() {
                bail!("Job {}: no encoded output could be finalized", job.id);
            }
            let encoded = &job.encoded_codecs;
            job.muxed.retain(|m| encoded.contains(&m.codec));
        }

        job.codec_sizes = job
            .encoded_codecs
            .iter()
            .filter_map(|name| {
                let size = fs::metadata(dir.join(transcode::output_file(name))).ok()?.len();
                Some((name.clone(), size))
            })
            .collect();

        self.storyboard(job, &dir).await;
        remove_stale_outputs(job, &dir);

        job.state = JobState::Complete;
        save_job(job, output_root)?;
        info!("✅ Job {}: complete ({})", job.id, job.encoded_codecs.join(", "));
        Ok(())
    }

    async fn copy_sidecars(&self, job: &mut Job, input: &Path, dir: &Path) {
        let copied = match sidecar::copy_sidecars(input, dir) {
            Ok(copied) => copied,
            Err(e) => {
                warn!("Job {}: sidecar copy failed: {:#}", job.id, e);
                return;
            }
        };
        let Some(poster) = copied.poster else {
            debug!("Job {}: no poster art", job.id);
            return;
        };
        match color::dominant_colors(self.runner.as_ref(), &self.cfg, &poster).await {
            Ok(colors) => job.colors = colors,
            Err(e) => warn!("Job {}: colour sampling failed: {:#}", job.id, e),
        }
    }

    async fn extract(&self, job: &mut Job, input: &Path, dir: &Path, probe: &ProbeData) {
        let extractor = Extractor::new(self.runner.as_ref(), &self.cfg, &job.id, dir);
        let mut streams = Vec::new();
        for kind in [StreamKind::Subtitle, StreamKind::Audio, StreamKind::Attachment] {
            streams.extend(extractor.extract_streams(input, probe, kind).await);
        }
        job.streams = streams;
        job.muxed.clear();
    }

    /// Translate the best subtitle track. Every failure here is logged and skipped.
    async fn translate(&self, job: &mut Job, dir: &Path, probe: &ProbeData) {
        let Some(tcfg) = self.cfg.translation.as_ref() else {
            warn!("Job {}: translation requested but no translation backend is configured", job.id);
            return;
        };

        let original = probe.streams_of(StreamKind::Audio).find_map(|s| s.language());
        let source = match choose_source(&job.streams, dir, original, &tcfg.target_language) {
            SourceChoice::Translate(stream) => stream.clone(),
            SourceChoice::AlreadyPresent(stream) => {
                info!("Job {}: subtitle track {} is already in {}", job.id, stream.index, tcfg.target_language);
                return;
            }
            SourceChoice::None => {
                info!("Job {}: no subtitle track to translate", job.id);
                return;
            }
        };

        let mut backend = match (self.backends)(tcfg) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Job {}: translation backend unavailable: {}", job.id, e);
                return;
            }
        };

        info!("🌐 Job {}: translating subtitle track {} to {}", job.id, source.index, tcfg.target_language);
        match translate_track(backend.as_mut(), tcfg, dir, &source).await {
            Ok(stream) => {
                let location = stream.location.clone();
                job.streams.retain(|s| s.location != location);
                job.streams.push(stream);
            }
            Err(e) => warn!("Job {}: translation failed: {:#}", job.id, e),
        }
    }

    /// Mux audio into every encoded video, then drop the audio files that were muxed
    async fn remux(&self, job: &mut Job, dir: &Path) {
        let audio: Vec<_> = job
            .streams_of(StreamKind::Audio)
            .filter(|s| s.location.is_some())
            .cloned()
            .collect();
        if audio.is_empty() {
            return;
        }

        let muxed =
            transcode::remux_audio(self.runner.as_ref(), &self.cfg, &job.id, dir, &job.encoded_codecs, &audio).await;

        for stream in job.streams.iter_mut().filter(|s| s.kind == StreamKind::Audio) {
            if !muxed.iter().any(|m| m.audio_index == stream.index) {
                continue;
            }
            if let Some(location) = stream.location.take() {
                if let Err(e) = fs::remove_file(dir.join(&location)) {
                    warn!("Job {}: failed to remove muxed audio {}: {}", job.id, location, e);
                }
            }
        }
        job.muxed = muxed;
    }

    async fn storyboard(&self, job: &Job, dir: &Path) {
        if !self.cfg.sprites || job.fast {
            debug!("Job {}: storyboard skipped", job.id);
            return;
        }
        let Some(reference) = job.encoded_codecs.first() else { return };
        let reference = dir.join(transcode::output_file(reference));
        match storyboard::generate(self.runner.as_ref(), &self.cfg, &job.id, &reference, dir).await {
            Ok(sheets) => debug!("Job {}: {} storyboard sheet(s)", job.id, sheets),
            Err(e) => warn!("Job {}: storyboard failed: {:#}", job.id, e),
        }
    }
}

/// Copy duration, geometry and chapters from the probe
fn apply_probe(job: &mut Job, probe: &ProbeData) -> Result<()> {
    let Some(video) = probe.first_video() else {
        bail!("no video stream");
    };
    job.width = video.width.unwrap_or(0);
    job.height = video.height.unwrap_or(0);
    job.duration = probe.duration().unwrap_or(0.0);
    job.chapters = probe
        .chapters
        .iter()
        .map(|c| Chapter {
            start: c.start_time.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0.0),
            end: c.end_time.as_deref().and_then(|t| t.parse().ok()).unwrap_or(0.0),
            title: c.title().map(str::to_string),
        })
        .collect();
    Ok(())
}

/// Every stream file recorded by a previous run is still on disk
fn streams_present(job: &Job, dir: &Path) -> bool {
    job.streams
        .iter()
        .flat_map(|s| s.location.iter().chain(s.styled_location.iter()))
        .all(|location| dir.join(location).is_file())
}

/// Remove video-only encodes and the outputs of codecs that are not in the record
fn remove_stale_outputs(job: &Job, dir: &Path) {
    for codec in Codec::ALL {
        discard_file(&dir.join(transcode::video_file(codec.name())));
    }

    let names = Codec::ALL.iter().map(|c| c.name()).chain(std::iter::once(COPY_OUTPUT));
    for name in names {
        if job.encoded_codecs.iter().any(|e| e == name) {
            continue;
        }
        let path = dir.join(transcode::output_file(name));
        if path.exists() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Job {}: removed stale {}", job.id, path.display()),
                Err(e) => warn!("Job {}: failed to remove {}: {}", job.id, path.display(), e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::job::{load_all_jobs, load_job, JOB_FILE};
    use crate::scan::{plan_jobs, DiscoveryContext};
    use crate::testing::{FakeRunner, PROBE_JSON};
    use crate::translate::backend::{Reply, Usage};

    struct Setup {
        _media: tempfile::TempDir,
        out: tempfile::TempDir,
        job: Job,
    }

    fn setup() -> Setup {
        let media = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let input = media.path().join("Show S01E01.mkv");
        fs::write(&input, b"matroska").unwrap();
        let job = Job::new("job0000001".to_string(), &input, "show s01e01".to_string());
        Setup { _media: media, out, job }
    }

    fn config(out: &Path) -> IngestConfig {
        IngestConfig {
            output_dir: out.to_path_buf(),
            codecs: vec![Codec::Av1, Codec::H264],
            low_priority: false,
            ..IngestConfig::default()
        }
    }

    fn pipeline(cfg: IngestConfig, runner: Arc<FakeRunner>) -> Pipeline {
        Pipeline::new(Arc::new(cfg), runner)
    }

    fn persisted(out: &Path, id: &str) -> Job {
        load_job(&out.join(id).join(JOB_FILE)).unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_is_complete_and_matches_disk() {
        let Setup { _media, out, mut job } = setup();
        let runner = Arc::new(FakeRunner::new(PROBE_JSON));
        pipeline(config(out.path()), runner.clone()).run(&mut job).await.unwrap();

        let saved = persisted(out.path(), &job.id);
        let dir = out.path().join(&job.id);
        assert_eq!(saved.state, JobState::Complete);
        assert_eq!(saved.encoded_codecs, vec!["av1", "h264"]);
        for codec in &saved.encoded_codecs {
            assert!(dir.join(format!("{}.mp4", codec)).is_file());
            assert!(!dir.join(format!("{}.video.mp4", codec)).exists());
            assert!(saved.codec_sizes[codec] > 0);
        }

        assert_eq!(saved.duration, 1425.024);
        assert_eq!((saved.width, saved.height), (1920, 1080));
        assert_eq!(saved.chapters.len(), 2);
        assert!(saved.checksum.is_some());
        assert!(dir.join(checksum::CHECKSUM_FILE).is_file());
        assert!(dir.join(storyboard::INDEX_FILE).is_file());

        // Two audio tracks muxed into two videos, then removed
        assert_eq!(saved.muxed.len(), 4);
        assert!(saved.muxed.iter().any(|m| m.file == "av1.mp4" && m.audio_index == 1));
        assert!(dir.join("av1.2.mp4").is_file());
        let audio: Vec<_> = saved.streams_of(StreamKind::Audio).collect();
        assert_eq!(audio.len(), 2);
        assert!(audio.iter().all(|s| s.location.is_none()));
        assert!(!dir.join("audio_1.m4a").exists());

        assert_eq!(saved.streams_of(StreamKind::Subtitle).count(), 2);
        assert_eq!(saved.streams_of(StreamKind::Attachment).count(), 1);
    }

    #[tokio::test]
    async fn test_failed_codec_is_left_out() {
        let Setup { _media, out, mut job } = setup();
        let runner = Arc::new(FakeRunner::new(PROBE_JSON).failing("libsvtav1"));
        pipeline(config(out.path()), runner).run(&mut job).await.unwrap();

        let saved = persisted(out.path(), &job.id);
        assert_eq!(saved.state, JobState::Complete);
        assert_eq!(saved.encoded_codecs, vec!["h264"]);
        assert!(!out.path().join(&job.id).join("av1.mp4").exists());
        assert!(saved.muxed.iter().all(|m| m.codec == "h264"));
    }

    #[tokio::test]
    async fn test_video_only_encode_becomes_output_without_audio() {
        let Setup { _media, out, mut job } = setup();
        let mut cfg = config(out.path());
        cfg.extract_audio = false;
        let runner = Arc::new(FakeRunner::new(PROBE_JSON));
        pipeline(cfg, runner).run(&mut job).await.unwrap();

        let saved = persisted(out.path(), &job.id);
        let dir = out.path().join(&job.id);
        assert_eq!(saved.encoded_codecs, vec!["av1", "h264"]);
        assert!(saved.muxed.is_empty());
        for codec in ["av1", "h264"] {
            let output = fs::read_to_string(dir.join(format!("{}.mp4", codec))).unwrap();
            assert!(output.contains(&format!("{}.video.mp4", codec)));
            assert!(!dir.join(format!("{}.video.mp4", codec)).exists());
        }
    }

    #[tokio::test]
    async fn test_no_encoder_output_is_fatal() {
        let Setup { _media, out, mut job } = setup();
        let runner = Arc::new(FakeRunner::new(PROBE_JSON).failing("libsvtav1").failing("libx264"));
        let err = pipeline(config(out.path()), runner).run(&mut job).await.unwrap_err();

        assert!(err.to_string().contains("no encoder produced output"));
        assert_eq!(persisted(out.path(), &job.id).state, JobState::StreamsExtracted);
    }

    #[tokio::test]
    async fn test_unreadable_input_is_fatal() {
        let Setup { _media, out, mut job } = setup();
        let runner = Arc::new(FakeRunner::new(PROBE_JSON).failing("-show_streams"));
        assert!(pipeline(config(out.path()), runner).run(&mut job).await.is_err());
        assert_eq!(persisted(out.path(), &job.id).state, JobState::Incomplete);
    }

    #[tokio::test]
    async fn test_failed_job_is_found_again_by_discovery() {
        let Setup { _media, out, job } = setup();
        let input = job.input_path();
        let size = fs::metadata(&input).unwrap().len();
        let cfg = config(out.path());
        let runner = Arc::new(FakeRunner::new(PROBE_JSON).failing("-show_streams"));
        let pipeline = pipeline(cfg.clone(), runner);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let known = load_all_jobs(out.path()).unwrap();
            let mut ctx = DiscoveryContext::from_config(&cfg, &known);
            let mut planned = plan_jobs(&[(input.clone(), size)], &known, &mut ctx);
            assert_eq!(planned.len(), 1);
            assert!(pipeline.run(&mut planned[0]).await.is_err());
            ids.push(planned[0].id.clone());
        }

        assert_eq!(ids[0], ids[1]);
        let records = load_all_jobs(out.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, JobState::Incomplete);
        assert_eq!(fs::read_dir(out.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_fast_job_copies_streams() {
        let Setup { _media, out, mut job } = setup();
        job.fast = true;
        let runner = Arc::new(FakeRunner::new(PROBE_JSON));
        pipeline(config(out.path()), runner.clone()).run(&mut job).await.unwrap();

        let saved = persisted(out.path(), &job.id);
        assert_eq!(saved.encoded_codecs, vec![COPY_OUTPUT]);
        assert!(out.path().join(&job.id).join("copy.mp4").is_file());
        assert!(!out.path().join(&job.id).join(storyboard::INDEX_FILE).exists());
        assert!(!runner.commands().iter().any(|c| c.contains("libx264")));
    }

    #[tokio::test]
    async fn test_complete_job_is_not_touched() {
        let Setup { _media, out, mut job } = setup();
        job.state = JobState::Complete;
        let runner = Arc::new(FakeRunner::new(PROBE_JSON));
        pipeline(config(out.path()), runner.clone()).run(&mut job).await.unwrap();
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_resume_skips_extraction() {
        let Setup { _media, out, mut job } = setup();
        let runner = Arc::new(FakeRunner::new(PROBE_JSON).failing("libsvtav1").failing("libx264"));
        let _ = pipeline(config(out.path()), runner).run(&mut job).await;
        let mut resumed = persisted(out.path(), &job.id);
        assert_eq!(resumed.state, JobState::StreamsExtracted);

        let runner = Arc::new(FakeRunner::new(PROBE_JSON));
        pipeline(config(out.path()), runner.clone()).run(&mut resumed).await.unwrap();
        assert_eq!(resumed.state, JobState::Complete);
        assert!(!runner.commands().iter().any(|c| c.contains("-map 0:3")));
        assert_eq!(resumed.streams_of(StreamKind::Subtitle).count(), 2);
    }

    struct EchoBackend;

    #[async_trait]
    impl TranslationBackend for EchoBackend {
        async fn start_session(&mut self, _instructions: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn send(&mut self, text: &str) -> Result<Reply, BackendError> {
            Ok(Reply { text: text.to_string(), usage: Usage::default() })
        }
    }

    #[tokio::test]
    async fn test_translated_track_is_recorded() {
        let Setup { _media, out, mut job } = setup();
        job.translate = true;
        let mut cfg = config(out.path());
        cfg.translation = Some(TranslationConfig { target_language: "spa".to_string(), ..Default::default() });

        let dir = out.path().join(&job.id);
        let runner = Arc::new(FakeRunner::new(PROBE_JSON));
        let pipeline = pipeline(cfg, runner).with_backends(Arc::new(|_: &TranslationConfig| {
            Ok(Box::new(EchoBackend) as Box<dyn TranslationBackend>)
        }));

        // The fake extraction writes no cues, so give the track real ones and resume
        job.translate = false;
        pipeline.run(&mut job).await.unwrap();
        fs::write(
            dir.join("sub_3.vtt"),
            "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nHello\n\n00:00:03.000 --> 00:00:04.000\nBye\n",
        )
        .unwrap();
        job.state = JobState::StreamsExtracted;
        job.translate = true;
        pipeline.run(&mut job).await.unwrap();

        let saved = persisted(out.path(), &job.id);
        let translated = saved
            .streams
            .iter()
            .find(|s| s.language.as_deref() == Some("spa"))
            .expect("translated stream recorded");
        assert_eq!(translated.location.as_deref(), Some("sub_spa_mt.vtt"));
        assert_eq!(translated.title.as_deref(), Some("Machine translation"));
        assert!(dir.join("sub_spa_mt.vtt").is_file());
    }
}
