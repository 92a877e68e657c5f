// SPDX-License-Identifier: MPL-2.0

//! A video output: one texture, one frame slot and the handoff between them.

use tracing::{debug, info, warn};
use vout_bridge_config::{BridgeConfig, TextureHandle};

use crate::{
    error::BridgeError,
    event_loop::EventLoopAdapter,
    format::{OutputFormat, row_pitch},
    handoff::{Handoff, HandoffController, HandoffProbe, HandoffState, HandoffStats},
    sink::{TextureRegistry, TextureSink},
    slot::FrameSlot,
};

/// Decoded frames in, texture uploads on the event loop out.
pub struct VideoOutput<S: TextureSink + 'static, E: EventLoopAdapter> {
    format: OutputFormat,
    texture: TextureHandle,
    controller: HandoffController<S, E>,
}

impl<S: TextureSink + 'static, E: EventLoopAdapter> VideoOutput<S, E> {
    /// Resolve the configured texture and set up a `width` x `height` output.
    ///
    /// The texture handle is checked before anything is acquired, and the
    /// texture is acquired before the frame buffer is allocated.
    ///
    /// # Errors
    ///
    /// - configuration errors ([`BridgeError::is_configuration`]) if the
    ///   handle is missing or malformed, unknown to `registry`, or a
    ///   dimension is zero or a row does not fit in `u32` bytes. Nothing is
    ///   allocated.
    /// - [`BridgeError::Allocation`] if the frame buffer cannot be reserved.
    ///   The texture is released before returning.
    pub fn open<R>(
        config: &BridgeConfig,
        width: u32,
        height: u32,
        registry: &R,
        event_loop: E,
    ) -> Result<Self, BridgeError>
    where
        R: TextureRegistry<Sink = S>,
    {
        let texture = config.texture_handle()?;

        if width == 0 || height == 0 || row_pitch(width).is_none() {
            return Err(BridgeError::InvalidDimensions { width, height });
        }

        let sink = registry
            .acquire(texture)
            .ok_or(BridgeError::TextureUnavailable(texture))?;

        let slot = match FrameSlot::allocate(width, height) {
            Ok(slot) => slot,
            Err(err) => {
                drop(sink);
                warn!(%texture, width, height, "Frame buffer allocation failed, texture released");
                return Err(err);
            }
        };

        let format = OutputFormat::packed_rgb(width, height);
        info!(
            %texture,
            width,
            height,
            fourcc = ?format.fourcc,
            bytes = slot.len(),
            "Opened video output"
        );

        Ok(Self {
            format,
            texture,
            controller: HandoffController::new(
                slot,
                sink,
                event_loop,
                config.shutdown_progress_interval(),
            ),
        })
    }

    /// The format frames must be delivered in.
    #[must_use]
    pub fn format(&self) -> &OutputFormat {
        &self.format
    }

    #[must_use]
    pub fn texture(&self) -> TextureHandle {
        self.texture
    }

    /// Offer a frame of the output's own size. See [`Self::produce`].
    pub fn display(&mut self, pixels: &[u8]) -> Result<Handoff, BridgeError> {
        self.controller
            .produce(pixels, self.format.width, self.format.height)
    }

    /// Offer a frame to the event loop without waiting for it.
    ///
    /// # Errors
    ///
    /// [`BridgeError::FrameSize`] if the frame does not match the output.
    pub fn produce(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Handoff, BridgeError> {
        self.controller.produce(pixels, width, height)
    }

    #[must_use]
    pub fn probe(&self) -> HandoffProbe {
        self.controller.probe()
    }

    #[must_use]
    pub fn stats(&self) -> HandoffStats {
        self.controller.stats()
    }

    #[must_use]
    pub fn state(&self) -> HandoffState {
        self.controller.state()
    }

    /// Wait for the event loop to let go of the frame buffer, then release
    /// it along with the texture.
    ///
    /// Must not be called from the event loop thread.
    pub fn shutdown(self) -> HandoffStats {
        let texture = self.texture;
        let stats = self.controller.shutdown();
        debug!(
            %texture,
            scheduled = stats.frames_scheduled,
            delivered = stats.frames_delivered,
            dropped = stats.frames_dropped,
            "Closed video output"
        );
        stats
    }
}

impl<S: TextureSink + 'static, E: EventLoopAdapter> std::fmt::Debug for VideoOutput<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoOutput")
            .field("format", &self.format)
            .field("texture", &self.texture)
            .field("controller", &self.controller)
            .finish()
    }
}
