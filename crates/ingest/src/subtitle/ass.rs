//! Advanced SubStation Alpha (ASS/SSA) handling: separating spoken dialogue
//! from typesetting, converting to WebVTT, and validating dialogue sections
//! returned by a translation backend.

use log::{debug, warn};

/// Displayed durations shorter than this are flashes, not dialogue
const MIN_DISPLAY_MS: u64 = 280;
/// Longer than this means a stuck or mistimed line
const MAX_DISPLAY_MS: u64 = 120_000;
/// Visible characters required on lines that carry animation tags
const MIN_ANIMATED_CHARS: usize = 4;
const MAX_ANIMATED_BLOCKS: usize = 3;

const DEFAULT_FIELDS: &[&str] = &[
    "layer", "start", "end", "style", "name", "marginl", "marginr", "marginv", "effect", "text",
];

/// One `Dialogue:` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialogue {
    /// Everything up to and including the comma before the text field
    pub prefix: String,
    /// Milliseconds
    pub start: u64,
    pub end: u64,
    pub text: String,
}

impl Dialogue {
    /// Parse a `Dialogue:` line against the event format field list
    pub fn parse(line: &str, fields: &[String]) -> Option<Self> {
        let body = line.trim_end().strip_prefix("Dialogue:")?;
        let text_idx = fields.iter().position(|f| f == "text")?;
        let start_idx = fields.iter().position(|f| f == "start")?;
        let end_idx = fields.iter().position(|f| f == "end")?;
        if text_idx != fields.len() - 1 {
            return None;
        }

        let parts: Vec<&str> = body.splitn(fields.len(), ',').collect();
        if parts.len() != fields.len() {
            return None;
        }

        let start = parse_time(parts[start_idx])?;
        let end = parse_time(parts[end_idx])?;
        let text = parts[text_idx].to_string();
        let prefix = format!("Dialogue:{},", parts[..text_idx].join(","));

        Some(Dialogue { prefix, start, end, text })
    }

    pub fn duration_ms(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Whether this line is spoken content rather than a sign, karaoke or drawing
    pub fn is_spoken(&self) -> bool {
        let blocks = override_blocks(&self.text);

        if blocks.iter().any(|b| has_drawing(b) || b.contains("\\clip") || b.contains("\\iclip")) {
            return false;
        }
        if self.duration_ms() < MIN_DISPLAY_MS {
            return false;
        }

        let visible = visible_text(&self.text);
        let chars = visible.chars().count();
        if chars < 2 {
            return false;
        }

        let tags: Vec<&&str> = blocks.iter().filter(|b| b.contains('\\')).collect();
        let animated = tags.iter().any(|b| b.contains("\\t(") || b.contains("\\move("));
        if animated {
            let words = visible.split_whitespace().count();
            if chars < MIN_ANIMATED_CHARS || tags.len() > words || tags.len() > MAX_ANIMATED_BLOCKS {
                return false;
            }
        }

        true
    }

    /// The line with comment-only override blocks removed
    pub fn to_line(&self) -> String {
        format!("{}{}", self.prefix, strip_comments(&self.text))
    }
}

/// `H:MM:SS.cc` to milliseconds
fn parse_time(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let (secs, frac) = parts[2].split_once('.').unwrap_or((parts[2], "0"));
    let secs: u64 = secs.parse().ok()?;
    if frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    // Scale the fraction to milliseconds whatever its precision
    let mut millis_str: String = frac.chars().take(3).collect();
    while millis_str.len() < 3 {
        millis_str.push('0');
    }
    let millis: u64 = millis_str.parse().ok()?;
    Some(((hours * 60 + minutes) * 60 + secs) * 1000 + millis)
}

/// Milliseconds as `hh:mm:ss.mmm`
pub fn format_vtt_time(ms: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        (ms / 60_000) % 60,
        (ms / 1000) % 60,
        ms % 1000
    )
}

/// Contents of every `{...}` block
fn override_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        match rest[open..].find('}') {
            Some(close) => {
                blocks.push(&rest[open + 1..open + close]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    blocks
}

/// `\p1`..`\p9` switches a line into vector drawing mode
fn has_drawing(block: &str) -> bool {
    block.match_indices("\\p").any(|(i, _)| {
        block[i + 2..]
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_digit() && c != '0')
    })
}

/// Drop `{...}` blocks that contain no tag; they are comments
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        match rest[open..].find('}') {
            Some(close) => {
                out.push_str(&rest[..open]);
                let block = &rest[open..open + close + 1];
                if block.contains('\\') {
                    out.push_str(block);
                }
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

fn strip_all_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        match rest[open..].find('}') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Text a viewer sees, on one line
pub fn visible_text(text: &str) -> String {
    strip_all_blocks(text)
        .replace("\\N", " ")
        .replace("\\n", " ")
        .replace("\\h", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_format(line: &str) -> Option<Vec<String>> {
    let rest = line.trim().strip_prefix("Format:")?;
    Some(rest.split(',').map(|f| f.trim().to_lowercase()).collect())
}

/// A parsed styled subtitle file
#[derive(Debug, Clone)]
pub struct StyledDocument {
    /// Lines before the first dialogue line, written back unchanged
    pub header: Vec<String>,
    /// Event format field names, lower-cased
    pub fields: Vec<String>,
    pub dialogues: Vec<Dialogue>,
    /// Non-dialogue lines after the first dialogue line
    pub footer: Vec<String>,
}

impl StyledDocument {
    pub fn parse(text: &str) -> Self {
        let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");
        let mut header = Vec::new();
        let mut footer = Vec::new();
        let mut dialogues = Vec::new();
        let mut fields: Vec<String> = DEFAULT_FIELDS.iter().map(|f| f.to_string()).collect();
        let mut in_events = false;
        let mut seen_dialogue = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') {
                in_events = trimmed.eq_ignore_ascii_case("[events]");
            }
            if in_events {
                if let Some(f) = parse_format(trimmed) {
                    fields = f;
                }
            }

            if in_events && trimmed.starts_with("Dialogue:") {
                seen_dialogue = true;
                match Dialogue::parse(trimmed, &fields) {
                    Some(d) => dialogues.push(d),
                    None => warn!("Dropping malformed dialogue line: {}", trimmed),
                }
            } else if seen_dialogue {
                footer.push(line.to_string());
            } else {
                header.push(line.to_string());
            }
        }

        // Trailing blank lines are re-added by rebuild
        while footer.last().map_or(false, |l| l.trim().is_empty()) {
            footer.pop();
        }

        StyledDocument { header, fields, dialogues, footer }
    }

    pub fn spoken(&self) -> impl Iterator<Item = &Dialogue> {
        self.dialogues.iter().filter(|d| d.is_spoken())
    }

    /// Spoken dialogue lines with comments removed, one per line
    pub fn dialogue_section(&self) -> String {
        self.spoken().map(Dialogue::to_line).collect::<Vec<_>>().join("\n")
    }

    /// Header, the given dialogue section, then footer
    pub fn rebuild(&self, dialogue_section: &str) -> String {
        let mut lines: Vec<&str> = self.header.iter().map(String::as_str).collect();
        lines.extend(dialogue_section.lines().filter(|l| !l.trim().is_empty()));
        lines.extend(self.footer.iter().map(String::as_str));
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Plain WebVTT containing only the spoken lines
    pub fn to_plain_cues(&self) -> String {
        let mut spoken: Vec<&Dialogue> = self.spoken().collect();
        spoken.sort_by_key(|d| (d.start, d.end));

        let mut out = String::from("WEBVTT\n");
        for d in spoken {
            let text = strip_all_blocks(&d.text)
                .replace("\\N", "\n")
                .replace("\\n", " ")
                .replace("\\h", " ");
            let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
            if lines.is_empty() {
                continue;
            }
            out.push_str(&format!(
                "\n{} --> {}\n{}\n",
                format_vtt_time(d.start),
                format_vtt_time(d.end),
                lines.join("\n")
            ));
        }
        out
    }
}

/// Keep only trimmed `Dialogue:` lines of a backend response
pub fn normalize_dialogue_section(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|l| l.starts_with("Dialogue:"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Check a (normalized) dialogue section before it replaces the original one
pub fn validate_dialogue_section(section: &str, fields: &[String]) -> bool {
    let mut valid = true;
    let mut count = 0;

    for line in section.lines().filter(|l| l.starts_with("Dialogue:")) {
        count += 1;
        match Dialogue::parse(line, fields) {
            Some(d) if d.duration_ms() > MAX_DISPLAY_MS => {
                warn!("Dialogue displayed for {} ms, longer than allowed: {}", d.duration_ms(), line);
                valid = false;
            }
            Some(_) => {}
            None => {
                warn!("Dialogue line is malformed: {}", line);
                valid = false;
            }
        }
    }

    if count == 0 {
        warn!("No dialogue lines survived normalization");
        valid = false;
    }

    debug!("Validated {} dialogue lines: {}", count, if valid { "ok" } else { "rejected" });
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}[Script Info]
Title: Sample
ScriptType: v4.00+

[V4+ Styles]
Format: Name, Fontname, Fontsize
Style: Default,Arial,20

[Events]
Format: Layer, Start, End, Style, Name, MarginL, MarginR, MarginV, Effect, Text
Dialogue: 0,0:00:01.00,0:00:03.50,Default,,0,0,0,,{note to self}Hello there.\\NHow are you?
Dialogue: 0,0:00:04.00,0:00:04.10,Default,,0,0,0,,Blink
Dialogue: 0,0:00:05.00,0:00:09.00,Sign,,0,0,0,,{\\p1}m 0 0 l 100 0 100 100
Dialogue: 0,0:00:05.00,0:00:09.00,Sign,,0,0,0,,{\\clip(0,0,10,10)}STORE
Dialogue: 0,0:00:06.00,0:00:08.00,Default,,0,0,0,,{\\pos(10,10)\\i1}Fine, thanks.
Dialogue: 0,0:00:10.00,0:00:12.00,Sign,,0,0,0,,{\\move(0,0,10,10)}{\\t(\\frz10)}{\\fad(1,1)}{\\b1}OPEN
Dialogue: 0,0:00:12.00,0:00:14.00,Default,,0,0,0,,{\\fad(200,200)\\t(\\alpha&HFF&)}See you tomorrow
Comment: 0,0:00:15.00,0:00:16.00,Default,,0,0,0,,unused

[Fonts]
";

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("0:00:01.50"), Some(1500));
        assert_eq!(parse_time("1:02:03.04"), Some(3_723_040));
        assert_eq!(parse_time("0:00:01"), Some(1000));
        assert_eq!(parse_time("bogus"), None);
    }

    #[test]
    fn test_spoken_filter() {
        let doc = StyledDocument::parse(SAMPLE);
        assert_eq!(doc.dialogues.len(), 7);
        let spoken: Vec<String> = doc.spoken().map(|d| visible_text(&d.text)).collect();
        assert_eq!(spoken, vec!["Hello there. How are you?", "Fine, thanks.", "See you tomorrow"]);
    }

    #[test]
    fn test_pos_is_not_drawing() {
        assert!(!has_drawing("\\pos(10,10)"));
        assert!(!has_drawing("\\p0"));
        assert!(has_drawing("\\an7\\p1"));
    }

    #[test]
    fn test_comment_blocks_removed() {
        assert_eq!(strip_comments("{note}Hi {\\i1}there{\\i0}"), "Hi {\\i1}there{\\i0}");
    }

    #[test]
    fn test_dialogue_section_and_rebuild() {
        let doc = StyledDocument::parse(SAMPLE);
        let section = doc.dialogue_section();
        let lines: Vec<&str> = section.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Dialogue: 0,0:00:01.00,0:00:03.50,Default,,0,0,0,,Hello there.\\NHow are you?");

        let rebuilt = doc.rebuild(&section);
        assert!(rebuilt.starts_with("[Script Info]"));
        assert!(rebuilt.contains("Format: Layer, Start, End"));
        assert!(rebuilt.contains("Comment: 0,0:00:15.00"));
        assert!(rebuilt.trim_end().ends_with("[Fonts]"));
        assert!(!rebuilt.contains("STORE"));
    }

    #[test]
    fn test_plain_cues() {
        let doc = StyledDocument::parse(SAMPLE);
        let vtt = doc.to_plain_cues();
        assert!(vtt.starts_with("WEBVTT\n\n00:00:01.000 --> 00:00:03.500\nHello there.\nHow are you?\n"));
        assert!(vtt.contains("00:00:06.000 --> 00:00:08.000\nFine, thanks.\n"));
        assert_eq!(crate::subtitle::sanitize::cue_count(&vtt), 3);
    }

    #[test]
    fn test_validate_dialogue_section() {
        let doc = StyledDocument::parse(SAMPLE);
        let good = "Dialogue: 0,0:00:01.00,0:00:03.50,Default,,0,0,0,,Hola.";
        assert!(validate_dialogue_section(good, &doc.fields));

        let stuck = "Dialogue: 0,0:00:01.00,0:05:00.00,Default,,0,0,0,,Hola.";
        assert!(!validate_dialogue_section(stuck, &doc.fields));

        let broken = "Dialogue: 0,0:00:01.00";
        assert!(!validate_dialogue_section(broken, &doc.fields));

        assert!(!validate_dialogue_section("", &doc.fields));
    }

    #[test]
    fn test_normalize_response() {
        let raw = "```\nDialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,Hola\n\nSure!\n```";
        assert_eq!(normalize_dialogue_section(raw), "Dialogue: 0,0:00:01.00,0:00:02.00,Default,,0,0,0,,Hola");
    }
}
