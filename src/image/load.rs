//! Image loading utilities.

use std::path::Path;

use crate::error::{Error, Result};

use super::PixelBuffer;

/// Load an image file from disk as an RGBA [`PixelBuffer`].
///
/// Any format supported by the `image` crate features is accepted; the pixels
/// are converted to 8-bit RGBA. Masks are loaded the same way and only their
/// red channel is consulted later.
///
/// # Errors
///
/// Returns an error if the image cannot be loaded or decoded.
pub fn load_image<P: AsRef<Path>>(path: P) -> Result<PixelBuffer> {
    let path = path.as_ref();

    let img = image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })?;

    tracing::debug!("Loaded {} ({}x{})", path.display(), img.width(), img.height());

    Ok(img.to_rgba8().into())
}
