use std::fmt;

use crate::config::{BroadcastConfig, ConfigError, Platform};

const YOUTUBE_BASE: &str = "rtmp://a.rtmp.youtube.com/live2";
const TWITCH_BASE: &str = "rtmp://live.twitch.tv/app";

/// Placeholder written in place of the stream key anywhere it would be logged.
pub const MASKED_KEY: &str = "STREAM_KEY_HIDDEN";

/// A stream-key-bearing ingest URL.
///
/// `Display` never reveals the key; use [`BroadcastEndpoint::url`] only when
/// handing the address to the encoder process itself.
#[derive(Clone)]
pub struct BroadcastEndpoint {
    base: String,
    key: String,
}

impl BroadcastEndpoint {
    pub fn new(base: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            key: key.into(),
        }
    }

    pub fn from_config(config: &BroadcastConfig) -> Result<Self, ConfigError> {
        let key = config.resolve_key().ok_or_else(|| {
            ConfigError::Invalid(format!("missing stream key ({})", config.key_env_var()))
        })?;
        let base = match config.platform {
            Platform::Youtube => YOUTUBE_BASE.to_string(),
            Platform::Twitch => TWITCH_BASE.to_string(),
            Platform::Custom => config.base_url.clone().ok_or_else(|| {
                ConfigError::Invalid("broadcast.base_url is required for custom platform".into())
            })?,
        };
        Ok(Self::new(base, key))
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.base, self.key)
    }

    /// Replace every occurrence of the stream key in `text`.
    pub fn mask(&self, text: &str) -> String {
        if self.key.is_empty() {
            return text.to_string();
        }
        text.replace(&self.key, MASKED_KEY)
    }
}

impl fmt::Display for BroadcastEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, MASKED_KEY)
    }
}

impl fmt::Debug for BroadcastEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastEndpoint")
            .field("base", &self.base)
            .field("key", &MASKED_KEY)
            .finish()
    }
}
