// SPDX-License-Identifier: MPL-2.0

use vout_bridge_config::{ConfigError, TextureHandle};

/// Errors raised while setting up or feeding a video output.
///
/// A dropped frame is not an error; see [`crate::Handoff::Dropped`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid video output configuration")]
    Config(#[from] ConfigError),

    /// The handle parsed but the registry knows no texture at that address.
    #[error("no texture registered at {0}")]
    TextureUnavailable(TextureHandle),

    #[error("invalid output dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("unable to allocate a {width}x{height} frame buffer")]
    Allocation { width: u32, height: u32 },

    #[error(
        "{}x{} frame of {len} bytes does not match the {}x{} output",
        got.0, got.1, expected.0, expected.1
    )]
    FrameSize {
        expected: (u32, u32),
        got: (u32, u32),
        len: usize,
    },
}

impl BridgeError {
    /// Whether the error comes from a missing, malformed or unusable
    /// configuration rather than from resource exhaustion or a bad frame.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::TextureUnavailable(_) | Self::InvalidDimensions { .. }
        )
    }
}
