// SPDX-License-Identifier: MPL-2.0

//! Single fixed-size frame buffer shared by the producer and the event loop.
//!
//! The slot itself does no synchronization. It is only reachable through the
//! handoff controller, whose state word decides which side may touch it.

use crate::{
    error::BridgeError,
    format::{ByteOrder, BYTES_PER_PIXEL, row_pitch},
    sink::{FrameView, TextureSink},
};

/// Size in bytes of a packed frame, or `None` if it does not fit in memory.
pub(crate) fn frame_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL as usize)
}

/// Reject a frame that does not exactly fill a `dims` sized slot.
pub(crate) fn validate_frame(
    dims: (u32, u32),
    pixels: &[u8],
    width: u32,
    height: u32,
) -> Result<(), BridgeError> {
    let matches = (width, height) == dims && frame_len(width, height) == Some(pixels.len());
    if matches {
        Ok(())
    } else {
        Err(BridgeError::FrameSize {
            expected: dims,
            got: (width, height),
            len: pixels.len(),
        })
    }
}

/// One frame of packed BGR pixels.
#[derive(Debug)]
pub struct FrameSlot {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl FrameSlot {
    /// Allocate a zeroed slot for `width` x `height` frames.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::Allocation`] if the buffer cannot be reserved
    /// or a row is longer than `u32::MAX` bytes.
    pub fn allocate(width: u32, height: u32) -> Result<Self, BridgeError> {
        let len = row_pitch(width)
            .and(frame_len(width, height))
            .ok_or(BridgeError::Allocation { width, height })?;

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| BridgeError::Allocation { width, height })?;
        data.resize(len, 0);

        Ok(Self {
            data,
            width,
            height,
        })
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Overwrite the slot in place with a new frame.
    ///
    /// # Errors
    ///
    /// Fails with [`BridgeError::FrameSize`] if the frame does not match the
    /// slot; the previous contents are kept.
    pub fn write(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<(), BridgeError> {
        validate_frame((self.width, self.height), pixels, width, height)?;
        self.data.copy_from_slice(pixels);
        Ok(())
    }

    #[must_use]
    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            data: &self.data,
            width: self.width,
            height: self.height,
            bytes_per_pixel: BYTES_PER_PIXEL,
            stride: self.width * BYTES_PER_PIXEL,
            byte_order: ByteOrder::Bgr,
        }
    }

    /// Copy the current contents into a texture.
    pub fn read_into<S: TextureSink + ?Sized>(&self, sink: &mut S) -> eyre::Result<()> {
        sink.upload(self.view())
    }
}
