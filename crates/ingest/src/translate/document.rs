use std::fs;
use std::path::Path;
use crate::ffprobe::StreamKind;
use crate::job::Stream;

/// A bounded chunk of a document sent in one backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    /// Structural markers (cue timings or dialogue lines) in `text`
    pub cues: usize,
}

/// Split `doc` into segments of roughly `max_lines` lines.
///
/// A segment only ever ends right before a marker line, so no cue is cut in
/// half; a single cue longer than `max_lines` stays whole.
pub fn split_segments(doc: &str, max_lines: usize, is_marker: impl Fn(&str) -> bool) -> Vec<Segment> {
    let max_lines = max_lines.max(1);
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut cues = 0;

    let mut flush = |current: &mut Vec<&str>, cues: &mut usize| {
        if current.iter().any(|l| !l.trim().is_empty()) {
            segments.push(Segment { text: current.join("\n"), cues: *cues });
        }
        current.clear();
        *cues = 0;
    };

    for line in doc.lines() {
        let marker = is_marker(line);
        if marker && current.len() >= max_lines {
            flush(&mut current, &mut cues);
        }
        if marker {
            cues += 1;
        }
        current.push(line);
    }
    flush(&mut current, &mut cues);

    segments
}

/// Task description every session starts with
pub fn instructions(target_language: &str, styled: bool) -> String {
    let (format, unit) = if styled {
        ("ASS subtitle dialogue lines", "Keep every line's fields before the text exactly as they are, translate only the text field, keep override tags in braces unchanged")
    } else {
        ("WebVTT subtitle cues", "Copy every timing line (the lines containing -->) exactly as it is, character for character")
    };
    format!(
        "You translate {format} into {language}.\n\
         Rules:\n\
         - {unit}.\n\
         - Translate every text line. Never skip, merge or split cues.\n\
         - Keep inline formatting tags where they are.\n\
         - Reply with the reformatted document only: no explanations, no notes, no code fences.\n\
         Each message contains the next part of the same document.",
        format = format,
        language = language_name(target_language),
        unit = unit,
    )
}

const LANGUAGES: &[(&str, &str, &str)] = &[
    ("eng", "en", "English"),
    ("jpn", "ja", "Japanese"),
    ("spa", "es", "Spanish"),
    ("fre", "fr", "French"),
    ("fra", "fr", "French"),
    ("ger", "de", "German"),
    ("deu", "de", "German"),
    ("ita", "it", "Italian"),
    ("por", "pt", "Portuguese"),
    ("rus", "ru", "Russian"),
    ("chi", "zh", "Chinese"),
    ("zho", "zh", "Chinese"),
    ("kor", "ko", "Korean"),
    ("dut", "nl", "Dutch"),
    ("nld", "nl", "Dutch"),
    ("pol", "pl", "Polish"),
    ("swe", "sv", "Swedish"),
];

fn canonical(code: &str) -> String {
    let code = code.trim().to_lowercase();
    LANGUAGES
        .iter()
        .find(|(long, short, _)| *long == code || *short == code)
        .map(|(_, short, _)| short.to_string())
        .unwrap_or(code)
}

/// Compare ISO 639-1 and 639-2 codes
pub fn same_language(a: &str, b: &str) -> bool {
    canonical(a) == canonical(b)
}

pub fn language_name(code: &str) -> String {
    let canon = canonical(code);
    LANGUAGES
        .iter()
        .find(|(_, short, _)| *short == canon)
        .map(|(_, _, name)| name.to_string())
        .unwrap_or_else(|| code.to_string())
}

/// Result of looking for a subtitle track to translate
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChoice<'a> {
    Translate(&'a Stream),
    /// A track in the target language already exists
    AlreadyPresent(&'a Stream),
    None,
}

/// Pick the track to translate: the largest track of each language, the
/// original language preferred, otherwise the largest overall.
pub fn choose_source<'a>(
    streams: &'a [Stream],
    job_dir: &Path,
    original_language: Option<&str>,
    target_language: &str,
) -> SourceChoice<'a> {
    let mut best: Vec<(&'a Stream, u64, String)> = Vec::new();

    for stream in streams.iter().filter(|s| s.kind == StreamKind::Subtitle) {
        let Some(location) = stream.location.as_deref() else { continue };
        if !location.ends_with(".vtt") {
            continue;
        }
        let size = fs::metadata(job_dir.join(location)).map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            continue;
        }
        let lang = canonical(stream.language.as_deref().unwrap_or("und"));
        match best.iter_mut().find(|(_, _, l)| *l == lang) {
            Some(entry) if entry.1 < size => *entry = (stream, size, lang),
            Some(_) => {}
            None => best.push((stream, size, lang)),
        }
    }

    if let Some((stream, _, _)) = best.iter().find(|(_, _, l)| same_language(l, target_language)) {
        return SourceChoice::AlreadyPresent(stream);
    }

    if let Some(original) = original_language {
        if let Some((stream, _, _)) = best.iter().find(|(_, _, l)| same_language(l, original)) {
            return SourceChoice::Translate(stream);
        }
    }

    best.iter()
        .max_by_key(|(_, size, _)| *size)
        .map(|(stream, _, _)| SourceChoice::Translate(stream))
        .unwrap_or(SourceChoice::None)
}
