//! Pixel buffers, tensor conversion and letterbox geometry.

pub mod codec;
pub mod geometry;
mod load;
mod save;

pub use codec::{decode_output, encode_image, encode_mask, ChannelValue};
pub use geometry::{resize_with_pad, restore_size, GeometryContext, ResizeFilter};
pub use load::load_image;
pub use save::save_image;

use image::RgbaImage;

use crate::error::{Error, Result};

/// Number of interleaved channels in a [`PixelBuffer`].
pub const RGBA_CHANNELS: usize = 4;

/// Number of colour channels fed to the model.
pub const RGB_CHANNELS: usize = 3;

/// Red channel value that marks a mask pixel for repainting.
pub const MASK_REPAINT: u8 = 255;

/// Interleaved RGBA pixels with explicit dimensions.
///
/// Used for both the source image and the mask. A mask pixel whose red
/// channel is exactly [`MASK_REPAINT`] is repainted; anything else is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap raw RGBA bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBuffer`] if `data.len() != width * height * 4`.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(width, height);
        if data.len() != expected {
            return Err(Error::InvalidBuffer {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A buffer with every pixel set to `rgba`.
    #[must_use]
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        let data = rgba.iter().copied().cycle().take(pixels * RGBA_CHANNELS).collect();
        Self {
            width,
            height,
            data,
        }
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Raw interleaved RGBA bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// RGBA value at `(x, y)`, or `None` when out of bounds.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
        let px = &self.data[offset..offset + RGBA_CHANNELS];
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Set the RGBA value at `(x, y)`. Out-of-bounds writes are ignored.
    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * RGBA_CHANNELS;
        self.data[offset..offset + RGBA_CHANNELS].copy_from_slice(&rgba);
    }

    /// Borrowing conversion into an [`RgbaImage`].
    #[must_use]
    pub fn to_rgba_image(&self) -> RgbaImage {
        self.clone().into()
    }

    /// Ensure `other` has the same dimensions as `self`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] on any difference.
    pub fn ensure_same_size(&self, other: &Self) -> Result<()> {
        if self.dimensions() == other.dimensions() {
            return Ok(());
        }
        Err(Error::ShapeMismatch {
            expected: format!("{}x{}", self.width, self.height),
            actual: format!("{}x{}", other.width, other.height),
        })
    }
}

impl From<RgbaImage> for PixelBuffer {
    fn from(img: RgbaImage) -> Self {
        let (width, height) = img.dimensions();
        Self {
            width,
            height,
            data: img.into_raw(),
        }
    }
}

impl From<PixelBuffer> for RgbaImage {
    fn from(buffer: PixelBuffer) -> Self {
        // Length is guaranteed by the PixelBuffer constructors.
        Self::from_raw(buffer.width, buffer.height, buffer.data)
            .unwrap_or_else(|| Self::new(0, 0))
    }
}

const fn byte_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * RGBA_CHANNELS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_length() {
        let err = PixelBuffer::new(2, 2, vec![0; 15]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidBuffer {
                expected: 16,
                actual: 15,
                ..
            }
        ));
    }

    #[test]
    fn test_pixel_access() {
        let mut buf = PixelBuffer::filled(3, 2, [1, 2, 3, 4]);
        buf.set_pixel(2, 1, [9, 8, 7, 6]);

        assert_eq!(buf.pixel(0, 0), Some([1, 2, 3, 4]));
        assert_eq!(buf.pixel(2, 1), Some([9, 8, 7, 6]));
        assert_eq!(buf.pixel(3, 0), None);
        assert_eq!(buf.as_bytes()[20..24], [9, 8, 7, 6]);
    }

    #[test]
    fn test_same_size_check() {
        let a = PixelBuffer::filled(4, 4, [0; 4]);
        let b = PixelBuffer::filled(4, 5, [0; 4]);
        assert!(a.ensure_same_size(&a.clone()).is_ok());
        assert!(matches!(
            a.ensure_same_size(&b),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rgba_image_conversion() {
        let buf = PixelBuffer::filled(5, 3, [10, 20, 30, 40]);
        let img: RgbaImage = buf.clone().into();
        assert_eq!(img.dimensions(), (5, 3));
        assert_eq!(PixelBuffer::from(img), buf);
    }
}
