pub mod ass;
pub mod sanitize;

/// Codec names ffmpeg can read as styled (ASS/SSA) subtitles
pub fn is_styled_codec(codec: &str) -> bool {
    matches!(codec, "ass" | "ssa")
}

/// Text-based subtitle codecs; bitmap formats can only be copied
pub fn is_text_codec(codec: &str) -> bool {
    matches!(codec, "ass" | "ssa" | "subrip" | "srt" | "webvtt" | "mov_text" | "text" | "microdvd" | "subviewer")
}
