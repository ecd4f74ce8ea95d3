use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::transcode::Codec;

/// Configuration for the media ingest daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Library root directories to scan for media files
    pub library_roots: Vec<PathBuf>,
    /// Directory where one `<job-id>/` directory per job is written
    pub output_dir: PathBuf,
    /// Interval in seconds between library scans
    pub scan_interval_secs: u64,
    /// How long a job listing snapshot stays valid
    pub cache_ttl_secs: u64,
    /// Seconds between the two size checks that decide a file is no longer being copied
    pub stable_wait_secs: u64,
    /// Path to ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Run encoders with reduced scheduling priority
    pub low_priority: bool,
    /// Codecs produced for every job that is not in fast mode
    pub codecs: Vec<Codec>,
    /// Treat every job as fast (stream copy instead of transcode)
    pub fast_mode: bool,
    /// Path substrings that put a job into fast mode
    pub fast_keywords: Vec<String>,
    /// Path substrings that enable translation for a job
    pub translate_keywords: Vec<String>,
    /// Translate every job regardless of keywords
    pub translate_all: bool,
    pub extract_audio: bool,
    pub extract_attachments: bool,
    /// Generate storyboard sprites for the web player
    pub sprites: bool,
    pub storyboard: StoryboardConfig,
    /// Number of jobs processed at the same time
    pub max_concurrent_jobs: usize,
    /// Machine translation of subtitle tracks; disabled when absent
    pub translation: Option<TranslationConfig>,
}

/// Sprite sheet geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryboardConfig {
    /// Seconds covered by one sprite sheet
    pub chunk_secs: u64,
    /// Seconds between two thumbnails
    pub interval_secs: u64,
    /// Thumbnail height in pixels, width follows the source aspect ratio
    pub thumb_height: u32,
}

impl Default for StoryboardConfig {
    fn default() -> Self {
        Self {
            chunk_secs: 600,
            interval_secs: 10,
            thumb_height: 90,
        }
    }
}

/// Text-generation service used for subtitle translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Gemini,
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Gemini => "gemini-2.5-flash",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub provider: Provider,
    /// Defaults to the provider's model
    pub model: Option<String>,
    /// Overrides the provider's public API base URL
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key, defaults per provider
    pub api_key_env: Option<String>,
    /// Language the subtitles are translated into (ISO 639-2, e.g. "eng")
    pub target_language: String,
    /// Maximum number of document lines in one segment
    pub segment_lines: usize,
    /// Documents needing more segments than this are rejected
    pub max_segments: usize,
    /// Conversation turns kept when talking to the backend
    pub history_turns: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider: Provider::OpenAi,
            model: None,
            endpoint: None,
            api_key_env: None,
            target_language: "eng".to_string(),
            segment_lines: 400,
            max_segments: 30,
            history_turns: 4,
        }
    }
}

impl TranslationConfig {
    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or_else(|| self.provider.default_model())
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or_else(|| self.provider.default_api_key_env())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl IngestConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            library_roots: vec![PathBuf::from("/media")],
            output_dir: PathBuf::from("/var/lib/ingest"),
            scan_interval_secs: 300,
            cache_ttl_secs: 60,
            stable_wait_secs: 10,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            low_priority: true,
            codecs: vec![Codec::Av1, Codec::Hevc, Codec::H264],
            fast_mode: false,
            fast_keywords: Vec::new(),
            translate_keywords: Vec::new(),
            translate_all: false,
            extract_audio: true,
            extract_attachments: true,
            sprites: true,
            storyboard: StoryboardConfig::default(),
            max_concurrent_jobs: 1,
            translation: None,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(
            &path,
            r#"
output_dir = "/srv/out"
codecs = ["h264", "h264_compat"]

[translation]
provider = "gemini"
model = "gemini-2.5-flash"
api_key_env = "GEMINI_API_KEY"
"#,
        )
        .unwrap();

        let cfg = IngestConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(cfg.codecs, vec![Codec::H264, Codec::H264Compat]);
        assert_eq!(cfg.scan_interval_secs, 300);
        assert!(cfg.sprites);

        let translation = cfg.translation.unwrap();
        assert_eq!(translation.provider, Provider::Gemini);
        assert_eq!(translation.segment_lines, 400);
        assert_eq!(translation.target_language, "eng");
    }

    #[test]
    fn test_provider_sets_model_and_key_defaults() {
        let gemini: TranslationConfig = toml::from_str(r#"provider = "gemini""#).unwrap();
        assert_eq!(gemini.model(), "gemini-2.5-flash");
        assert_eq!(gemini.api_key_env(), "GEMINI_API_KEY");

        let openai = TranslationConfig::default();
        assert_eq!(openai.model(), "gpt-4o-mini");
        assert_eq!(openai.api_key_env(), "OPENAI_API_KEY");

        let custom: TranslationConfig =
            toml::from_str("provider = \"gemini\"\nmodel = \"gemini-2.5-pro\"").unwrap();
        assert_eq!(custom.model(), "gemini-2.5-pro");
        assert_eq!(custom.api_key_env(), "GEMINI_API_KEY");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = IngestConfig::load_config(Some(Path::new("/nonexistent/ingest.json"))).unwrap();
        assert_eq!(cfg.max_concurrent_jobs, 1);
        assert!(cfg.translation.is_none());
    }
}
