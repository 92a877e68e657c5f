// SPDX-License-Identifier: MPL-2.0

//! Pixel format advertised upstream by the video output.
//!
//! The bridge only ever carries packed 24-bit RGB with the blue byte first in
//! memory (`DRM_FORMAT_RGB888`, little-endian `R:G:B` words). Nothing here
//! negotiates; it describes the single format the slot is laid out in.

use drm_fourcc::DrmFourcc;

/// Bytes per pixel of the packed RGB layout.
pub const BYTES_PER_PIXEL: u32 = 3;

/// Fixed-point factor for the display aspect ratio (`4:3` is `576000`).
pub const ASPECT_FACTOR: u64 = 432_000;

/// Red, green and blue masks of a 24-bit pixel word.
pub const RED_MASK: u32 = 0x00ff_0000;
pub const GREEN_MASK: u32 = 0x0000_ff00;
pub const BLUE_MASK: u32 = 0x0000_00ff;

/// Byte order of the three components within a pixel in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Rgb,
    Bgr,
}

/// Bytes in one packed row, or `None` if that does not fit in a `u32`.
#[must_use]
pub fn row_pitch(width: u32) -> Option<u32> {
    width.checked_mul(BYTES_PER_PIXEL)
}

/// Format surface handed to the upstream decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    pub fourcc: DrmFourcc,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub byte_order: ByteOrder,
    pub width: u32,
    pub height: u32,
    /// Number of image planes.
    pub planes: u32,
    /// Bytes between two horizontally adjacent pixels.
    pub pixel_pitch: u32,
    /// Bytes between two rows; rows are never padded.
    pub pitch: u32,
    /// `width / height` scaled by [`ASPECT_FACTOR`].
    pub aspect: u64,
}

impl OutputFormat {
    /// Describe a packed RGB frame of the given size.
    ///
    /// Callers validate that neither dimension is zero and that
    /// [`row_pitch`] of `width` exists.
    #[must_use]
    pub fn packed_rgb(width: u32, height: u32) -> Self {
        Self {
            fourcc: DrmFourcc::Rgb888,
            red_mask: RED_MASK,
            green_mask: GREEN_MASK,
            blue_mask: BLUE_MASK,
            byte_order: ByteOrder::Bgr,
            width,
            height,
            planes: 1,
            pixel_pitch: BYTES_PER_PIXEL,
            pitch: width * BYTES_PER_PIXEL,
            aspect: u64::from(width) * ASPECT_FACTOR / u64::from(height.max(1)),
        }
    }

    /// Size in bytes of one frame.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.pitch as usize * self.height as usize
    }
}

/// Copy `height` rows of `row_bytes` out of a source whose rows are `stride`
/// bytes apart into a tightly packed destination.
///
/// Returns `false` without copying if either buffer is too short.
pub fn pack_rows(src: &[u8], stride: usize, row_bytes: usize, height: usize, dest: &mut [u8]) -> bool {
    if stride < row_bytes || dest.len() < row_bytes * height {
        return false;
    }
    if height > 0 && src.len() < stride * (height - 1) + row_bytes {
        return false;
    }

    if stride == row_bytes {
        dest[..row_bytes * height].copy_from_slice(&src[..row_bytes * height]);
        return true;
    }

    for (row, dest_row) in dest.chunks_exact_mut(row_bytes).take(height).enumerate() {
        let start = row * stride;
        dest_row.copy_from_slice(&src[start..start + row_bytes]);
    }
    true
}
