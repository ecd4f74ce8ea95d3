//! Subtitle machine translation: a document is cut into segments, each
//! segment is sent to a [`TranslationBackend`] and the reply is only kept
//! when an [`AcceptPolicy`] judges it structurally sound.

pub mod backend;
pub mod document;

use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use crate::config::TranslationConfig;
use crate::error::TranslateError;
use crate::ffprobe::StreamKind;
use crate::job::Stream;
use crate::subtitle::ass::{normalize_dialogue_section, validate_dialogue_section, StyledDocument};
use crate::subtitle::sanitize::{cue_count, is_cue_marker, sanitize};
use self::backend::{TranslationBackend, Usage};
use self::document::{instructions, split_segments, Segment};

/// Attempts per segment before falling back to the best effort
pub const MAX_ATTEMPTS: usize = 3;

/// Decides what a backend reply must look like to be kept
pub trait AcceptPolicy: Send + Sync {
    /// Repair a raw reply before it is judged
    fn sanitize(&self, raw: &str) -> String;
    fn accept(&self, candidate: &str) -> bool;
}

/// At least 98% of the expected markers must be present, in integers
fn meets_ratio(found: usize, expected: usize) -> bool {
    found * 100 >= expected * 98
}

/// Plain WebVTT: compare cue markers against the segment that was sent
#[derive(Debug, Clone)]
pub struct CueRatioPolicy {
    expected: usize,
}

impl CueRatioPolicy {
    pub fn new(expected: usize) -> Self {
        Self { expected }
    }
}

impl AcceptPolicy for CueRatioPolicy {
    fn sanitize(&self, raw: &str) -> String {
        sanitize(raw)
    }

    fn accept(&self, candidate: &str) -> bool {
        if self.expected == 0 {
            return !candidate.trim().is_empty();
        }
        let found = cue_count(candidate);
        debug!("Cue markers: {} of {} expected", found, self.expected);
        meets_ratio(found, self.expected)
    }
}

/// ASS dialogue sections: every line must parse and the line count must hold up
#[derive(Debug, Clone)]
pub struct StyledDialoguePolicy {
    fields: Vec<String>,
    expected: usize,
}

impl StyledDialoguePolicy {
    pub fn new(fields: Vec<String>, expected: usize) -> Self {
        Self { fields, expected }
    }
}

impl AcceptPolicy for StyledDialoguePolicy {
    fn sanitize(&self, raw: &str) -> String {
        normalize_dialogue_section(raw)
    }

    fn accept(&self, candidate: &str) -> bool {
        let found = candidate.lines().filter(|l| l.starts_with("Dialogue:")).count();
        validate_dialogue_section(candidate, &self.fields) && meets_ratio(found, self.expected)
    }
}

/// Result of translating a segment or a document
#[derive(Debug)]
pub enum Outcome {
    /// Passed the policy
    Accepted(String),
    /// Nothing passed; `best_effort` is the longest candidate seen and must not be treated as validated
    Exhausted { best_effort: String, error: TranslateError },
}

/// Retry loop around a backend
#[derive(Debug, Clone)]
pub struct TranslationGate {
    pub max_attempts: usize,
    pub max_segments: usize,
}

impl TranslationGate {
    pub fn new(max_segments: usize) -> Self {
        Self { max_attempts: MAX_ATTEMPTS, max_segments }
    }

    /// Send one segment until the policy accepts a reply or the attempts run out.
    ///
    /// Backend errors end the loop immediately. Empty replies count as a failed attempt.
    pub async fn translate_segment(
        &self,
        backend: &mut dyn TranslationBackend,
        index: usize,
        segment: &Segment,
        policy: &dyn AcceptPolicy,
    ) -> Result<Outcome, TranslateError> {
        let mut best_effort = String::new();
        let mut usage = Usage::default();
        let mut last_error = TranslateError::Exhausted { segment: index, attempts: self.max_attempts };

        for attempt in 1..=self.max_attempts {
            let reply = backend.send(&segment.text).await?;
            usage.prompt_tokens += reply.usage.prompt_tokens;
            usage.completion_tokens += reply.usage.completion_tokens;

            if reply.text.trim().is_empty() {
                warn!("Segment {}: empty reply on attempt {}/{}", index, attempt, self.max_attempts);
                last_error = TranslateError::EmptyResponse;
                continue;
            }

            let candidate = policy.sanitize(&reply.text);
            if policy.accept(&candidate) {
                debug!(
                    "Segment {}: accepted on attempt {} ({} prompt / {} completion tokens)",
                    index, attempt, usage.prompt_tokens, usage.completion_tokens
                );
                return Ok(Outcome::Accepted(candidate));
            }

            warn!("Segment {}: reply rejected on attempt {}/{}", index, attempt, self.max_attempts);
            last_error = TranslateError::Exhausted { segment: index, attempts: self.max_attempts };
            if candidate.chars().count() > best_effort.chars().count() {
                best_effort = candidate;
            }
        }

        Ok(Outcome::Exhausted { best_effort, error: last_error })
    }

    /// Translate every segment within one backend session.
    ///
    /// The parts are joined in order under `header`. The first segment that
    /// exhausts its attempts stops the document; what was gathered so far, its
    /// best effort included, is returned with the error.
    pub async fn translate_document<F>(
        &self,
        backend: &mut dyn TranslationBackend,
        instructions: &str,
        header: Option<&str>,
        segments: &[Segment],
        make_policy: F,
    ) -> Result<Outcome, TranslateError>
    where
        F: Fn(&Segment) -> Box<dyn AcceptPolicy>,
    {
        if segments.len() > self.max_segments {
            return Err(TranslateError::TooManySegments { needed: segments.len(), limit: self.max_segments });
        }

        backend.start_session(instructions).await?;

        let mut parts = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let policy = make_policy(segment);
            match self.translate_segment(backend, index, segment, policy.as_ref()).await? {
                Outcome::Accepted(text) => parts.push(text),
                Outcome::Exhausted { best_effort, error } => {
                    parts.push(best_effort);
                    return Ok(Outcome::Exhausted { best_effort: assemble(header, &parts), error });
                }
            }
        }

        Ok(Outcome::Accepted(assemble(header, &parts)))
    }
}

fn assemble(header: Option<&str>, parts: &[String]) -> String {
    let body = parts
        .iter()
        .map(|p| p.trim_matches('\n'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    match header {
        Some(h) => format!("{}\n\n{}\n", h, body),
        None => format!("{}\n", body),
    }
}

/// Translate one extracted subtitle track and write the result next to it.
///
/// Returns the stream record of the new track. A best-effort result is still
/// written, titled as unverified; the gate error is logged.
pub async fn translate_track(
    backend: &mut dyn TranslationBackend,
    cfg: &TranslationConfig,
    job_dir: &Path,
    source: &Stream,
) -> Result<Stream> {
    let gate = TranslationGate::new(cfg.max_segments);
    let target = cfg.target_language.as_str();
    let vtt_name = format!("sub_{}_mt.vtt", target);

    let styled_path = source
        .styled_location
        .as_deref()
        .map(|l| job_dir.join(l))
        .filter(|p| p.is_file());

    let (outcome, styled) = match styled_path {
        Some(path) => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read styled subtitle: {}", path.display()))?;
            let doc = StyledDocument::parse(&raw);
            let section = doc.dialogue_section();
            let segments = split_segments(&section, cfg.segment_lines, |l| l.starts_with("Dialogue:"));
            if segments.is_empty() {
                return Err(TranslateError::NoSource.into());
            }
            info!("🌐 Translating {} dialogue lines in {} segments", doc.spoken().count(), segments.len());

            let fields = doc.fields.clone();
            let outcome = gate
                .translate_document(backend, &instructions(target, true), None, &segments, |seg| {
                    Box::new(StyledDialoguePolicy::new(fields.clone(), seg.cues))
                })
                .await?;

            // Rebuild the styled file and derive the plain track from it; both are written later
            let rebuild = |section: &str| {
                let rebuilt = doc.rebuild(section);
                (StyledDocument::parse(&rebuilt).to_plain_cues(), rebuilt)
            };
            match outcome {
                Outcome::Accepted(section) => {
                    let (plain, styled) = rebuild(&section);
                    (Outcome::Accepted(plain), Some(styled))
                }
                Outcome::Exhausted { best_effort, error } => {
                    let (plain, styled) = rebuild(&best_effort);
                    (Outcome::Exhausted { best_effort: plain, error }, Some(styled))
                }
            }
        }
        None => {
            let location = source.location.as_deref().ok_or(TranslateError::NoSource)?;
            let path = job_dir.join(location);
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read subtitle: {}", path.display()))?;
            let clean = sanitize(&raw);
            let segments = split_segments(&clean, cfg.segment_lines, is_cue_marker);
            if segments.is_empty() {
                return Err(TranslateError::NoSource.into());
            }
            info!("🌐 Translating {} cues in {} segments", cue_count(&clean), segments.len());

            let outcome = gate
                .translate_document(backend, &instructions(target, false), Some("WEBVTT"), &segments, |seg| {
                    Box::new(CueRatioPolicy::new(seg.cues))
                })
                .await?;
            (outcome, None)
        }
    };

    let (text, verified) = match outcome {
        Outcome::Accepted(text) => (text, true),
        Outcome::Exhausted { best_effort, error } => {
            warn!("Translation of track {} not verified: {}", source.index, error);
            if cue_count(&best_effort) == 0 {
                return Err(error.into());
            }
            (best_effort, false)
        }
    };

    let styled_name = match styled {
        Some(rebuilt) => {
            let name = format!("sub_{}_mt.ass", target);
            let out = job_dir.join(&name);
            fs::write(&out, &rebuilt)
                .with_context(|| format!("Failed to write translated subtitle: {}", out.display()))?;
            Some(name)
        }
        None => None,
    };

    let out = job_dir.join(&vtt_name);
    fs::write(&out, &text).with_context(|| format!("Failed to write translated subtitle: {}", out.display()))?;

    Ok(Stream {
        index: source.index,
        kind: StreamKind::Subtitle,
        codec: "webvtt".to_string(),
        language: Some(target.to_string()),
        title: Some(if verified { "Machine translation" } else { "Machine translation (unverified)" }.to_string()),
        filename: None,
        mimetype: None,
        channels: None,
        location: Some(vtt_name),
        styled_location: styled_name,
    })
}
