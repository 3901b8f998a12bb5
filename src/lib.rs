//! # lamafill
//!
//! On-device image inpainting with a LaMa ONNX model.
//!
//! The model is downloaded once from an ordered list of mirrors, kept in a
//! persistent cache and loaded into a single memoized ONNX Runtime session.
//! Images and masks are plain RGBA buffers; a mask pixel whose red channel is
//! 255 marks a region to repaint.
//!
//! ## Example
//!
//! ```no_run
//! use lamafill::{Config, Inpainter, NoProgress, PixelBuffer};
//!
//! # async fn run() -> lamafill::Result<()> {
//! let inpainter = Inpainter::new(Config::default())?;
//!
//! let image = lamafill::image::load_image("photo.png")?;
//! let mask = lamafill::image::load_image("mask.png")?;
//! let repaired: PixelBuffer = inpainter.inpaint(&image, &mask, &NoProgress).await?;
//!
//! lamafill::image::save_image(&repaired, "repaired.png", 95)?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod image;
pub mod model;
pub mod pipeline;

pub use error::{Error, Result};
pub use crate::image::PixelBuffer;
pub use pipeline::{Config, Inpainter, NoProgress, Progress, ProgressSink, Stage};
