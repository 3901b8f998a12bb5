//! Reversible letterbox resize for fixed-resolution models.
//!
//! [`resize_with_pad`] and [`restore_size`] are a matched pair: the inverse
//! crops using the sizes recorded by the forward pass instead of recomputing
//! them, so rounding can never drift between the two directions.

use image::{imageops, imageops::FilterType, Rgba, RgbaImage};

use crate::error::{Error, Result};

use super::PixelBuffer;

/// Letterbox background colour.
const PAD_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

/// Interpolation used when scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResizeFilter {
    /// Bilinear; for photographic content.
    #[default]
    Smooth,
    /// Nearest neighbour; keeps mask sentinel values intact.
    Nearest,
}

impl ResizeFilter {
    const fn filter_type(self) -> FilterType {
        match self {
            Self::Smooth => FilterType::Triangle,
            Self::Nearest => FilterType::Nearest,
        }
    }
}

/// Everything [`restore_size`] needs to undo [`resize_with_pad`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryContext {
    pub scale: f64,
    pub pad_x: u32,
    pub pad_y: u32,
    pub new_width: u32,
    pub new_height: u32,
    pub original_width: u32,
    pub original_height: u32,
    pub target_size: u32,
}

impl GeometryContext {
    /// Compute the letterbox layout of a `width`x`height` image on a
    /// `target_size` square.
    ///
    /// Scaled sides are clamped to `1..=target_size` so extreme aspect ratios
    /// never collapse to an empty region.
    ///
    /// # Errors
    ///
    /// Returns an error if `target_size` is zero or the image is empty.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn new(width: u32, height: u32, target_size: u32) -> Result<Self> {
        if target_size == 0 {
            return Err(Error::InvalidParameter {
                name: "target_size".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if width == 0 || height == 0 {
            return Err(Error::UnsupportedDimensions {
                width,
                height,
                reason: "image is empty".to_string(),
            });
        }

        let target = f64::from(target_size);
        let scale = (target / f64::from(width)).min(target / f64::from(height));

        // Safe: clamped to [1, target_size] after rounding
        let new_width = (f64::from(width) * scale).round().clamp(1.0, target) as u32;
        let new_height = (f64::from(height) * scale).round().clamp(1.0, target) as u32;

        Ok(Self {
            scale,
            pad_x: (target_size - new_width) / 2,
            pad_y: (target_size - new_height) / 2,
            new_width,
            new_height,
            original_width: width,
            original_height: height,
            target_size,
        })
    }
}

/// Scale `image` uniformly to fit a `target_size` square and centre it on a
/// black canvas.
///
/// # Errors
///
/// Returns an error if `target_size` is zero or the image is empty.
pub fn resize_with_pad(
    image: &PixelBuffer,
    target_size: u32,
    filter: ResizeFilter,
) -> Result<(PixelBuffer, GeometryContext)> {
    let ctx = GeometryContext::new(image.width(), image.height(), target_size)?;

    let source = image.to_rgba_image();
    let scaled = imageops::resize(&source, ctx.new_width, ctx.new_height, filter.filter_type());

    let mut canvas = RgbaImage::from_pixel(target_size, target_size, PAD_COLOR);
    imageops::replace(
        &mut canvas,
        &scaled,
        i64::from(ctx.pad_x),
        i64::from(ctx.pad_y),
    );

    tracing::debug!(
        "Letterboxed {}x{} -> {}x{} at ({}, {}) on {target_size}px canvas",
        ctx.original_width,
        ctx.original_height,
        ctx.new_width,
        ctx.new_height,
        ctx.pad_x,
        ctx.pad_y
    );

    Ok((canvas.into(), ctx))
}

/// Crop the content region recorded in `ctx` out of `processed` and scale it
/// back to the original size.
///
/// # Errors
///
/// Returns [`Error::ShapeMismatch`] if `processed` is not the letterbox canvas
/// size recorded in `ctx`.
pub fn restore_size(
    processed: &PixelBuffer,
    ctx: &GeometryContext,
    filter: ResizeFilter,
) -> Result<PixelBuffer> {
    let canvas = (ctx.target_size, ctx.target_size);
    if processed.dimensions() != canvas {
        return Err(Error::ShapeMismatch {
            expected: format!("{}x{}", canvas.0, canvas.1),
            actual: format!("{}x{}", processed.width(), processed.height()),
        });
    }

    let source = processed.to_rgba_image();
    let content =
        imageops::crop_imm(&source, ctx.pad_x, ctx.pad_y, ctx.new_width, ctx.new_height).to_image();
    let restored = imageops::resize(
        &content,
        ctx.original_width,
        ctx.original_height,
        filter.filter_type(),
    );

    Ok(restored.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: [u8; 4], b: [u8; 4], tolerance: u8) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!(x.abs_diff(*y) <= tolerance, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_landscape_layout() {
        let ctx = GeometryContext::new(800, 600, 512).unwrap();

        assert!((ctx.scale - 0.64).abs() < 1e-9);
        assert_eq!((ctx.new_width, ctx.new_height), (512, 384));
        assert_eq!((ctx.pad_x, ctx.pad_y), (0, 64));
    }

    #[test]
    fn test_upscale_portrait_layout() {
        let ctx = GeometryContext::new(100, 200, 512).unwrap();

        assert!((ctx.scale - 2.56).abs() < 1e-9);
        assert_eq!((ctx.new_width, ctx.new_height), (256, 512));
        assert_eq!((ctx.pad_x, ctx.pad_y), (128, 0));
    }

    #[test]
    fn test_extreme_aspect_never_collapses() {
        let ctx = GeometryContext::new(1000, 1, 10).unwrap();

        assert_eq!((ctx.new_width, ctx.new_height), (10, 1));
        assert_eq!(ctx.pad_y, 4);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            GeometryContext::new(10, 10, 0),
            Err(Error::InvalidParameter { .. })
        ));
        assert!(matches!(
            GeometryContext::new(0, 10, 64),
            Err(Error::UnsupportedDimensions { .. })
        ));
    }

    #[test]
    fn test_padding_is_black() {
        let img = PixelBuffer::filled(40, 20, [200, 100, 50, 255]);

        let (padded, ctx) = resize_with_pad(&img, 16, ResizeFilter::Smooth).unwrap();

        assert_eq!(padded.dimensions(), (16, 16));
        assert_eq!((ctx.new_width, ctx.new_height, ctx.pad_y), (16, 8, 4));
        assert_eq!(padded.pixel(8, 0), Some([0, 0, 0, 255]));
        assert_eq!(padded.pixel(8, 15), Some([0, 0, 0, 255]));
        assert_close(padded.pixel(8, 8).unwrap(), [200, 100, 50, 255], 1);
    }

    #[test]
    fn test_round_trip_restores_dimensions() {
        for &(w, h, target) in &[(37, 23, 16), (5, 90, 64), (1, 1, 1), (300, 7, 3), (64, 64, 64)] {
            let img = PixelBuffer::filled(w, h, [12, 34, 56, 255]);

            let (padded, ctx) = resize_with_pad(&img, target, ResizeFilter::Smooth).unwrap();
            let restored = restore_size(&padded, &ctx, ResizeFilter::Smooth).unwrap();

            assert_eq!(restored.dimensions(), (w, h));
            for y in 0..h {
                for x in 0..w {
                    assert_close(restored.pixel(x, y).unwrap(), [12, 34, 56, 255], 1);
                }
            }
        }
    }

    #[test]
    fn test_nearest_preserves_mask_sentinel() {
        let mut mask = PixelBuffer::filled(30, 10, [0, 0, 0, 255]);
        for y in 0..10 {
            for x in 0..15 {
                mask.set_pixel(x, y, [255, 255, 255, 255]);
            }
        }

        let (padded, _) = resize_with_pad(&mask, 12, ResizeFilter::Nearest).unwrap();

        assert!(padded
            .as_bytes()
            .chunks_exact(4)
            .all(|px| px[0] == 0 || px[0] == 255));
        assert_eq!(padded.pixel(0, 6).map(|px| px[0]), Some(255));
        assert_eq!(padded.pixel(11, 6).map(|px| px[0]), Some(0));
    }

    #[test]
    fn test_restore_rejects_foreign_canvas() {
        let ctx = GeometryContext::new(8, 8, 4).unwrap();
        let wrong = PixelBuffer::filled(5, 4, [0; 4]);

        assert!(matches!(
            restore_size(&wrong, &ctx, ResizeFilter::Smooth),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
