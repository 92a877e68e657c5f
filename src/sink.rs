// SPDX-License-Identifier: MPL-2.0

//! Collaborators on the display side of the bridge.

use vout_bridge_config::TextureHandle;

use crate::format::ByteOrder;

/// Borrowed view of a complete frame, handed to a [`TextureSink`].
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Bytes per row; always `width * bytes_per_pixel`.
    pub stride: u32,
    pub byte_order: ByteOrder,
}

/// A texture that accepts decoded pixels.
///
/// Uploads always happen on the event loop thread, one at a time. The sink is
/// released by dropping it, after the last upload has returned.
pub trait TextureSink: Send {
    fn upload(&mut self, frame: FrameView<'_>) -> eyre::Result<()>;
}

/// Resolves a configured texture address into a sink.
///
/// The returned sink holds a reference to the external texture for as long as
/// the video output lives.
pub trait TextureRegistry {
    type Sink: TextureSink;

    fn acquire(&self, handle: TextureHandle) -> Option<Self::Sink>;
}
