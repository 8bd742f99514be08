use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub narration: NarrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which pipeline the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    /// Browser capture piped into one long-running encoder, no narration.
    Capture,
    /// Static image plus scheduled narration, one bounded encode per segment.
    Segments,
    /// Browser capture piped into a fresh encoder per narration segment.
    CaptureNarrated,
}

impl StreamMode {
    pub fn uses_capture(self) -> bool {
        matches!(self, StreamMode::Capture | StreamMode::CaptureNarrated)
    }

    pub fn uses_narration(self) -> bool {
        matches!(self, StreamMode::Segments | StreamMode::CaptureNarrated)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_mode")]
    pub mode: StreamMode,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_image")]
    pub image: PathBuf,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate: String,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: String,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub background_audio: Option<PathBuf>,
    #[serde(default = "default_background_volume")]
    pub background_volume: f32,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Twitch,
    Custom,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub stream_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_load_retries")]
    pub load_retries: u32,
    #[serde(default = "default_load_attempt_timeout")]
    pub load_attempt_timeout_secs: u64,
    #[serde(default = "default_page_ready_timeout")]
    pub page_ready_timeout_secs: u64,
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed banner text; when set, rotation is bypassed.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default = "default_rotation_secs")]
    pub rotation_secs: u64,
    #[serde(default = "default_banner_height")]
    pub banner_height: u32,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_banner_background")]
    pub background: [u8; 4],
    #[serde(default = "default_banner_foreground")]
    pub foreground: [u8; 4],
    #[serde(default)]
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NarrationConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_audio_dir")]
    pub audio_dir: PathBuf,
    #[serde(default)]
    pub generate_command: Option<String>,
    #[serde(default)]
    pub synthesize_command: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            url: None,
            image: default_image(),
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            video_bitrate: default_video_bitrate(),
            buffer_size: default_buffer_size(),
            preset: default_preset(),
            audio_bitrate: default_audio_bitrate(),
            sample_rate: default_sample_rate(),
            background_audio: None,
            background_volume: default_background_volume(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            platform: default_platform(),
            base_url: None,
            stream_key: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            load_retries: default_load_retries(),
            load_attempt_timeout_secs: default_load_attempt_timeout(),
            page_ready_timeout_secs: default_page_ready_timeout(),
            capture_timeout_secs: default_capture_timeout(),
            max_consecutive_errors: default_max_consecutive_errors(),
            retry_delay_ms: default_retry_delay_ms(),
            chrome_path: None,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            text: None,
            messages: Vec::new(),
            rotation_secs: default_rotation_secs(),
            banner_height: default_banner_height(),
            font_size: default_font_size(),
            background: default_banner_background(),
            foreground: default_banner_foreground(),
            font_path: None,
        }
    }
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            topic: default_topic(),
            audio_dir: default_audio_dir(),
            generate_command: None,
            synthesize_command: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CaptureConfig {
    pub fn load_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.load_attempt_timeout_secs)
    }

    pub fn page_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.page_ready_timeout_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl NarrationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

impl BroadcastConfig {
    /// Environment variable consulted when no key is set in the file.
    pub fn key_env_var(&self) -> &'static str {
        match self.platform {
            Platform::Twitch => "TWITCH_STREAM_KEY",
            Platform::Youtube | Platform::Custom => "YOUTUBE_STREAM_KEY",
        }
    }

    pub fn resolve_key(&self) -> Option<String> {
        self.stream_key
            .clone()
            .or_else(|| std::env::var(self.key_env_var()).ok())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Checks everything that must hold before any process is started.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = self.broadcast.resolve_key().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "no stream key configured (set broadcast.stream_key or {})",
                self.broadcast.key_env_var()
            ))
        })?;
        if key.len() < MIN_STREAM_KEY_LEN {
            return Err(ConfigError::Invalid("stream key seems invalid (too short)".into()));
        }
        if self.broadcast.platform == Platform::Custom && self.broadcast.base_url.is_none() {
            return Err(ConfigError::Invalid(
                "broadcast.base_url is required for the custom platform".into(),
            ));
        }

        if self.stream.fps == 0 {
            return Err(ConfigError::Invalid("stream.fps must be non-zero".into()));
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(ConfigError::Invalid("stream width/height must be non-zero".into()));
        }
        if self.stream.width % 2 != 0 || self.stream.height % 2 != 0 {
            return Err(ConfigError::Invalid(
                "stream width/height must be even (required for yuv420p output)".into(),
            ));
        }

        let mode = self.stream.mode;
        if mode.uses_capture() && self.stream.url.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Invalid(format!("stream.url is required in {mode:?} mode")));
        }
        if mode == StreamMode::Segments {
            require_file("stream.image", &self.stream.image)?;
            match &self.encoder.background_audio {
                Some(path) => require_file("encoder.background_audio", path)?,
                None => {
                    return Err(ConfigError::Invalid(
                        "encoder.background_audio is required in Segments mode".into(),
                    ))
                }
            }
        } else if let Some(path) = &self.encoder.background_audio {
            require_file("encoder.background_audio", path)?;
        }

        if mode.uses_narration() {
            if self.narration.generate_command.is_none() {
                return Err(ConfigError::Invalid("narration.generate_command is required".into()));
            }
            if self.narration.synthesize_command.is_none() {
                return Err(ConfigError::Invalid(
                    "narration.synthesize_command is required".into(),
                ));
            }
            if self.narration.interval_minutes == 0 {
                return Err(ConfigError::Invalid(
                    "narration.interval_minutes must be non-zero".into(),
                ));
            }
        }

        let overlay = &self.overlay;
        if mode.uses_capture() && overlay.enabled && overlay.text.is_none() && overlay.messages.is_empty() {
            return Err(ConfigError::Invalid(
                "overlay is enabled but has neither text nor messages".into(),
            ));
        }
        if overlay.banner_height > self.stream.height {
            return Err(ConfigError::Invalid("overlay.banner_height exceeds frame height".into()));
        }

        Ok(())
    }
}

fn require_file(field: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{field} not found at {}", path.display())))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

const MIN_STREAM_KEY_LEN: usize = 10;

// Default value functions
fn default_mode() -> StreamMode {
    StreamMode::Capture
}
fn default_image() -> PathBuf {
    "screenshot.png".into()
}
fn default_fps() -> u32 {
    30
}
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_ffmpeg_path() -> String {
    ["/opt/homebrew/bin/ffmpeg", "/usr/bin/ffmpeg"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .unwrap_or("ffmpeg")
        .into()
}
fn default_video_bitrate() -> String {
    "3000k".into()
}
fn default_buffer_size() -> String {
    "6000k".into()
}
fn default_preset() -> String {
    "veryfast".into()
}
fn default_audio_bitrate() -> String {
    "128k".into()
}
fn default_sample_rate() -> u32 {
    44100
}
fn default_background_volume() -> f32 {
    0.04
}
fn default_stop_grace_secs() -> u64 {
    5
}
fn default_platform() -> Platform {
    Platform::Youtube
}
fn default_load_retries() -> u32 {
    3
}
fn default_load_attempt_timeout() -> u64 {
    20
}
fn default_page_ready_timeout() -> u64 {
    30
}
fn default_capture_timeout() -> u64 {
    5
}
fn default_max_consecutive_errors() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}
fn default_rotation_secs() -> u64 {
    180
}
fn default_banner_height() -> u32 {
    80
}
fn default_font_size() -> f32 {
    36.0
}
fn default_banner_background() -> [u8; 4] {
    [0, 0, 0, 180]
}
fn default_banner_foreground() -> [u8; 4] {
    [255, 255, 255, 255]
}
fn default_interval_minutes() -> u64 {
    30
}
fn default_topic() -> String {
    "Latest news from the last 24h about crypto and blockchain.".into()
}
fn default_audio_dir() -> PathBuf {
    "audio/tts".into()
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPTURE_CONFIG: &str = r#"
        [stream]
        mode = "capture"
        url = "https://example.com/dashboard"
        fps = 10

        [broadcast]
        platform = "twitch"
        stream_key = "live_0123456789abcdef"

        [overlay]
        messages = ["first", "second"]
    "#;

    #[test]
    fn parses_with_defaults() {
        let config = Config::parse(CAPTURE_CONFIG).unwrap();
        assert_eq!(config.stream.mode, StreamMode::Capture);
        assert_eq!(config.stream.fps, 10);
        assert_eq!(config.stream.width, 1920);
        assert_eq!(config.capture.load_retries, 3);
        assert_eq!(config.capture.max_consecutive_errors, 3);
        assert_eq!(config.overlay.rotation_secs, 180);
        assert_eq!(config.overlay.background, [0, 0, 0, 180]);
        assert!((config.encoder.background_volume - 0.04).abs() < f32::EPSILON);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn kebab_case_mode() {
        let config = Config::parse("[stream]\nmode = \"capture-narrated\"").unwrap();
        assert_eq!(config.stream.mode, StreamMode::CaptureNarrated);
        assert!(config.stream.mode.uses_capture());
        assert!(config.stream.mode.uses_narration());
    }

    #[test]
    fn short_stream_key_rejected() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.broadcast.stream_key = Some("abc".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn capture_mode_requires_url() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.stream.url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn odd_frame_size_rejected() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.stream.width = 1921;
        assert!(config.validate().is_err());
    }

    #[test]
    fn narrated_mode_requires_commands() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.stream.mode = StreamMode::CaptureNarrated;
        assert!(config.validate().is_err());

        config.narration.generate_command = Some("echo hi".into());
        config.narration.synthesize_command = Some("tts {text_file} {output}".into());
        config.validate().unwrap();
    }

    #[test]
    fn segments_mode_requires_existing_media() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.stream.mode = StreamMode::Segments;
        config.narration.generate_command = Some("echo hi".into());
        config.narration.synthesize_command = Some("tts {text_file} {output}".into());
        config.stream.image = "/nonexistent/screenshot.png".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stream.image"));
    }

    #[test]
    fn empty_overlay_rejected_in_capture_mode() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.overlay.messages.clear();
        assert!(config.validate().is_err());
        config.overlay.text = Some("LIVE".into());
        config.validate().unwrap();
    }

    #[test]
    fn custom_platform_requires_base() {
        let mut config = Config::parse(CAPTURE_CONFIG).unwrap();
        config.broadcast.platform = Platform::Custom;
        assert!(config.validate().is_err());
        config.broadcast.base_url = Some("rtmp://ingest.local/live".into());
        config.validate().unwrap();
    }
}
