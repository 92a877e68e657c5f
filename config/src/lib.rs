// SPDX-License-Identifier: MPL-2.0

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    num::NonZeroU64,
    path::{Path, PathBuf},
    time::Duration,
};

pub const TEXTURE_KEY: &str = "texture";

/// Default pause between teardown progress messages.
pub const DEFAULT_SHUTDOWN_PROGRESS_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{} is missing, unable to bind the video output", TEXTURE_KEY)]
    MissingTexture,
    #[error("{} is not a numeric address: {value:?}", TEXTURE_KEY)]
    MalformedTexture { value: String },
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] ron::error::SpannedError),
}

/// Address of the externally owned texture object.
///
/// Never zero: a zero address is how the option spells "not set".
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TextureHandle(NonZeroU64);

impl TextureHandle {
    pub fn new(address: u64) -> Option<Self> {
        NonZeroU64::new(address).map(Self)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }

    /// Parse the option value, accepting decimal or `0x`-prefixed hexadecimal.
    ///
    /// # Errors
    ///
    /// Fails with [`ConfigError::MissingTexture`] for an empty or zero value and
    /// with [`ConfigError::MalformedTexture`] for anything that is not a number.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::MissingTexture);
        }

        let address = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        }
        .map_err(|_| ConfigError::MalformedTexture {
            value: value.to_owned(),
        })?;

        Self::new(address).ok_or(ConfigError::MissingTexture)
    }
}

impl fmt::Display for TextureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// Configuration of a video output bridge.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct BridgeConfig {
    /// numeric address of the texture used to render video
    #[setters(into)]
    pub texture: String,
    /// milliseconds between progress messages while teardown waits for the event loop
    #[serde(default = "default_shutdown_progress_ms")]
    pub shutdown_progress_ms: u64,
}

fn default_shutdown_progress_ms() -> u64 {
    DEFAULT_SHUTDOWN_PROGRESS_MS
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            texture: String::from("0"),
            shutdown_progress_ms: DEFAULT_SHUTDOWN_PROGRESS_MS,
        }
    }
}

impl BridgeConfig {
    /// Parse a config from RON text.
    ///
    /// # Errors
    ///
    /// Fails if the text is not a valid `BridgeConfig`.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Load a config file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_ron(&text)?;
        tracing::debug!(path = %path.display(), texture = %config.texture, "Loaded bridge config");
        Ok(config)
    }

    /// Resolve the texture option into a handle.
    ///
    /// # Errors
    ///
    /// Fails if the option is unset, zero, or not numeric.
    pub fn texture_handle(&self) -> Result<TextureHandle, ConfigError> {
        TextureHandle::parse(&self.texture)
    }

    #[must_use]
    pub fn shutdown_progress_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_progress_ms.max(1))
    }
}
