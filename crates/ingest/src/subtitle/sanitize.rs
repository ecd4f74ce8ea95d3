//! Repairs for WebVTT documents, applied to text before it is sent to a
//! translation backend and to whatever comes back.
//!
//! Every transform here is idempotent. A *block* runs from one cue marker
//! line up to the next one; lines before the first marker are not part of
//! any block and are dropped by [`dedupe_blocks`].

/// Marks that end a sentence and carry no meaning at the end of a cue
const TERMINAL: &[char] = &['.', '。', '．', '｡'];

/// `[hh:]mm:ss.mmm` (a comma is accepted in place of the dot)
fn is_timestamp(s: &str) -> bool {
    let Some((clock, frac)) = s.trim().rsplit_once(|c: char| c == '.' || c == ',') else {
        return false;
    };
    if frac.is_empty() || !frac.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let parts: Vec<&str> = clock.split(':').collect();
    (parts.len() == 2 || parts.len() == 3)
        && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Whether `line` is a cue timing line such as `00:01.000 --> 00:02.500 align:start`
pub fn is_cue_marker(line: &str) -> bool {
    let Some((start, rest)) = line.split_once("-->") else {
        return false;
    };
    let end = rest.split_whitespace().next().unwrap_or("");
    is_timestamp(start) && is_timestamp(end)
}

/// Number of cue markers in a document
pub fn cue_count(text: &str) -> usize {
    text.lines().filter(|l| is_cue_marker(l)).count()
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn is_boilerplate(line: &str) -> bool {
    let t = line.trim();
    t.starts_with("WEBVTT") || t.starts_with("```")
}

/// Drop format headers, code fences and numeric cue identifiers, then
/// leading and trailing blank lines.
pub fn strip_boilerplate(text: &str) -> String {
    let text = normalize_newlines(text);
    let lines: Vec<&str> = text.split('\n').collect();

    let mut kept = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if is_boilerplate(line) {
            continue;
        }
        let t = line.trim();
        let is_identifier = !t.is_empty() && t.chars().all(|c| c.is_ascii_digit());
        if is_identifier && lines.get(i + 1).map_or(false, |next| is_cue_marker(next)) {
            continue;
        }
        kept.push(*line);
    }

    let first = kept.iter().position(|l| !l.trim().is_empty());
    let last = kept.iter().rposition(|l| !l.trim().is_empty());
    match (first, last) {
        (Some(first), Some(last)) => kept[first..=last].join("\n"),
        _ => String::new(),
    }
}

/// Splits a line into leading tags, visible core and trailing tags.
/// Outer whitespace is discarded; the core is trimmed.
fn split_tags(line: &str) -> (&str, &str, &str) {
    let s = line.trim();

    let mut lead_end = 0;
    loop {
        let rest = &s[lead_end..];
        let skipped = rest.len() - rest.trim_start().len();
        let rest = rest.trim_start();
        match (rest.starts_with('<'), rest.find('>')) {
            (true, Some(close)) => lead_end += skipped + close + 1,
            _ => break,
        }
    }

    let mut trail_start = s.len();
    loop {
        let rest = s[lead_end..trail_start].trim_end();
        match (rest.ends_with('>'), rest.rfind('<')) {
            (true, Some(open)) => trail_start = lead_end + open,
            _ => break,
        }
    }

    (&s[..lead_end], s[lead_end..trail_start].trim(), &s[trail_start..])
}

/// Text of a line with inline tags removed
pub fn visible_text(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('<') {
        match rest[open..].find('>') {
            Some(close) => {
                out.push_str(&rest[..open]);
                rest = &rest[open + close + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

fn trim_line(line: &str) -> String {
    let (lead, core, trail) = split_tags(line);
    format!("{}{}{}", lead, core, trail)
}

/// Trim whitespace around the visible text of every cue line, keeping tags in place
pub fn trim_cue_text(text: &str) -> String {
    text.split('\n')
        .map(|line| if is_cue_marker(line) { line.trim().to_string() } else { trim_line(line) })
        .collect::<Vec<_>>()
        .join("\n")
}

fn drop_lone_terminal(line: &str) -> String {
    let (lead, core, trail) = split_tags(line);
    let Some((idx, last)) = core.char_indices().next_back() else {
        return line.to_string();
    };
    if !TERMINAL.contains(&last) {
        return line.to_string();
    }
    let before = core[..idx].trim_end();
    match before.chars().next_back() {
        Some(prev) if !TERMINAL.contains(&prev) => format!("{}{}{}", lead, before, trail),
        _ => line.to_string(),
    }
}

fn collapse_line(line: &str) -> String {
    let mut current = trim_line(line);
    loop {
        let next = trim_line(&drop_lone_terminal(&current));
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Remove a single sentence-ending mark from the last line of every cue.
/// Doubled marks (`..`, `。。`) are kept.
pub fn collapse_terminal_punctuation(text: &str) -> String {
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();

    let mut last_text: Option<usize> = None;
    let mut targets = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if is_cue_marker(line) {
            targets.extend(last_text.take());
        } else if !visible_text(line).is_empty() {
            last_text = Some(i);
        }
    }
    targets.extend(last_text);

    for i in targets {
        lines[i] = collapse_line(&lines[i]);
    }
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Block {
    marker: String,
    lines: Vec<String>,
}

fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    for line in text.split('\n') {
        if is_cue_marker(line) {
            blocks.push(Block { marker: line.trim().to_string(), lines: Vec::new() });
        } else if let Some(block) = blocks.last_mut() {
            if !visible_text(line).is_empty() {
                block.lines.push(line.to_string());
            }
        }
    }
    blocks
}

fn render_blocks(blocks: &[Block]) -> String {
    blocks
        .iter()
        .map(|b| {
            let mut out = b.marker.clone();
            for line in &b.lines {
                out.push('\n');
                out.push_str(line);
            }
            out
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Drop blocks without text and collapse consecutive identical blocks.
/// Output blocks are separated by exactly one blank line.
pub fn dedupe_blocks(text: &str) -> String {
    let mut out: Vec<Block> = Vec::new();
    for block in parse_blocks(text) {
        if block.lines.is_empty() {
            continue;
        }
        if out.last() == Some(&block) {
            continue;
        }
        out.push(block);
    }
    render_blocks(&out)
}

/// All plain-cue repairs in order
pub fn sanitize(text: &str) -> String {
    let text = strip_boilerplate(text);
    let text = trim_cue_text(&text);
    let text = collapse_terminal_punctuation(&text);
    dedupe_blocks(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cue_marker_detection() {
        assert!(is_cue_marker("00:00:01.000 --> 00:00:02.500"));
        assert!(is_cue_marker("01:02.000 --> 01:03.000 align:start position:10%"));
        assert!(is_cue_marker("00:00:01,000 --> 00:00:02,000"));
        assert!(!is_cue_marker("He said --> go"));
        assert!(!is_cue_marker("00:00:01 --> 00:00:02"));
        assert!(!is_cue_marker("WEBVTT"));
    }

    #[test]
    fn test_strip_boilerplate() {
        let raw = "```vtt\nWEBVTT\n\n1\n00:00:01.000 --> 00:00:02.000\nHello\n```\n\n";
        assert_eq!(strip_boilerplate(raw), "00:00:01.000 --> 00:00:02.000\nHello");
    }

    #[test]
    fn test_trim_keeps_tags() {
        assert_eq!(trim_line("  <i>  Hello there  </i> "), "<i>Hello there</i>");
        assert_eq!(trim_line("<b><i> x </i></b>"), "<b><i>x</i></b>");
        assert_eq!(trim_line("plain "), "plain");
    }

    #[test]
    fn test_collapse_single_period() {
        let doc = "00:00:01.000 --> 00:00:02.000\nFirst line.\nI'm going home.\n\n00:00:03.000 --> 00:00:04.000\n<i>Wait.</i>";
        let out = collapse_terminal_punctuation(doc);
        assert_eq!(
            out,
            "00:00:01.000 --> 00:00:02.000\nFirst line.\nI'm going home\n\n00:00:03.000 --> 00:00:04.000\n<i>Wait</i>"
        );
    }

    #[test]
    fn test_collapse_keeps_doubled_and_other_marks() {
        assert_eq!(collapse_line("Well.."), "Well..");
        assert_eq!(collapse_line("Really?"), "Really?");
        assert_eq!(collapse_line("帰ろう。"), "帰ろう");
        assert_eq!(collapse_line("帰ろう。。"), "帰ろう。。");
        assert_eq!(collapse_line("Done .</i>"), "Done</i>");
        assert_eq!(collapse_line("."), ".");
    }

    #[test]
    fn test_duplicate_blocks_collapse() {
        let doc = "00:00:01.000 --> 00:00:02.000\nHello\n\n\n\n00:00:01.000 --> 00:00:02.000\n\nHello\n\n00:00:03.000 --> 00:00:04.000\n   \n\n00:00:05.000 --> 00:00:06.000\nBye";
        assert_eq!(
            dedupe_blocks(doc),
            "00:00:01.000 --> 00:00:02.000\nHello\n\n00:00:05.000 --> 00:00:06.000\nBye"
        );
    }

    #[test]
    fn test_non_adjacent_duplicates_survive() {
        let doc = "00:01.000 --> 00:02.000\nA\n\n00:02.000 --> 00:03.000\nB\n\n00:01.000 --> 00:02.000\nA";
        assert_eq!(cue_count(&dedupe_blocks(doc)), 3);
    }

    #[test]
    fn test_sanitize_full_response() {
        let raw = "Here you go:\n```\nWEBVTT\n\n00:00:01.000 --> 00:00:02.000\n  Hola.  \n\n00:00:02.000 --> 00:00:03.000\n<i> ¿Qué? </i>\n```";
        assert_eq!(
            sanitize(raw),
            "00:00:01.000 --> 00:00:02.000\nHola\n\n00:00:02.000 --> 00:00:03.000\n<i>¿Qué?</i>"
        );
    }

    fn text_line() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                Just("hi"),
                Just("word"),
                Just("."),
                Just("。"),
                Just(" "),
                Just("<i>"),
                Just("</i>"),
                Just("?"),
                Just("7"),
            ],
            0..6,
        )
        .prop_map(|parts| parts.concat())
    }

    fn marker() -> impl Strategy<Value = String> {
        (0u32..30).prop_map(|s| format!("00:00:{:02}.000 --> 00:00:{:02}.500", s, s))
    }

    fn document() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                3 => text_line(),
                2 => marker(),
                2 => Just(String::new()),
                1 => Just("WEBVTT".to_string()),
                1 => Just("```".to_string()),
                1 => Just("12".to_string()),
            ],
            0..40,
        )
        .prop_map(|lines| lines.join("\n"))
    }

    fn distinct_blocks() -> impl Strategy<Value = (String, usize)> {
        prop::collection::vec(prop::collection::vec("[a-z]{1,6}", 1..3), 1..15).prop_map(|blocks| {
            let n = blocks.len();
            let doc = blocks
                .iter()
                .enumerate()
                .map(|(i, lines)| format!("00:{:02}:00.000 --> 00:{:02}:01.000\n{}", i, i, lines.join("\n")))
                .collect::<Vec<_>>()
                .join("\n\n");
            (format!("WEBVTT\n\n{}\n", doc), n)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn test_sanitize_is_idempotent(doc in document()) {
            let once = sanitize(&doc);
            let twice = sanitize(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn test_sanitize_never_adds_cues(doc in document()) {
            prop_assert!(cue_count(&sanitize(&doc)) <= cue_count(&doc));
        }

        #[test]
        fn test_sanitize_keeps_every_distinct_cue((doc, n) in distinct_blocks()) {
            prop_assert_eq!(cue_count(&sanitize(&doc)), n);
        }
    }
}
