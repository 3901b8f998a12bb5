//! Conversion between interleaved RGBA pixels and channel-first tensors.
//!
//! The mask polarity is inverted on the way in: the consumed model reads
//! 255 as "known pixel, keep" and 0 as "unknown pixel, repaint".

use ndarray::{Array3, ArrayView3};

use crate::error::{Error, Result};

use super::{PixelBuffer, MASK_REPAINT, RGBA_CHANNELS, RGB_CHANNELS};

/// Mask tensor value for pixels the model must keep.
pub const MASK_TENSOR_KEEP: u8 = 255;

/// Mask tensor value for pixels the model must repaint.
pub const MASK_TENSOR_REPAINT: u8 = 0;

/// Encode an image as a `(3, H, W)` tensor, dropping alpha.
#[must_use]
pub fn encode_image(pixels: &PixelBuffer) -> Array3<u8> {
    let (width, height) = (pixels.width() as usize, pixels.height() as usize);
    let bytes = pixels.as_bytes();

    Array3::from_shape_fn((RGB_CHANNELS, height, width), |(c, y, x)| {
        bytes[(y * width + x) * RGBA_CHANNELS + c]
    })
}

/// Encode a mask as a `(1, H, W)` tensor from its red channel.
///
/// A red value of exactly 255 becomes [`MASK_TENSOR_REPAINT`]; every other
/// value becomes [`MASK_TENSOR_KEEP`].
#[must_use]
pub fn encode_mask(pixels: &PixelBuffer) -> Array3<u8> {
    let (width, height) = (pixels.width() as usize, pixels.height() as usize);
    let bytes = pixels.as_bytes();

    Array3::from_shape_fn((1, height, width), |(_, y, x)| {
        if bytes[(y * width + x) * RGBA_CHANNELS] == MASK_REPAINT {
            MASK_TENSOR_REPAINT
        } else {
            MASK_TENSOR_KEEP
        }
    })
}

/// A tensor element that can be written back into an 8-bit channel.
pub trait ChannelValue: Copy {
    /// Clamp into `[0, 255]` and convert.
    fn to_channel(self) -> u8;
}

impl ChannelValue for u8 {
    #[inline]
    fn to_channel(self) -> u8 {
        self
    }
}

impl ChannelValue for f32 {
    #[inline]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn to_channel(self) -> u8 {
        // Safe: clamped to [0, 255] before casting; NaN casts to 0
        self.round().clamp(0.0, 255.0) as u8
    }
}

/// Decode a `(3, H, W)` tensor back into opaque RGBA pixels.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if the tensor is not `(3, height, width)`.
pub fn decode_output<T: ChannelValue>(
    tensor: ArrayView3<'_, T>,
    width: u32,
    height: u32,
) -> Result<PixelBuffer> {
    let (w, h) = (width as usize, height as usize);
    if tensor.dim() != (RGB_CHANNELS, h, w) {
        return Err(Error::ShapeMismatch {
            expected: format!("({RGB_CHANNELS}, {h}, {w})"),
            actual: format!("{:?}", tensor.shape()),
        });
    }

    let mut data = Vec::with_capacity(w * h * RGBA_CHANNELS);
    for y in 0..h {
        for x in 0..w {
            data.push(tensor[[0, y, x]].to_channel());
            data.push(tensor[[1, y, x]].to_channel());
            data.push(tensor[[2, y, x]].to_channel());
            data.push(u8::MAX);
        }
    }

    PixelBuffer::new(width, height, data)
}
