//! Custom error types for lamafill.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::Stage;

/// Main error type for the lamafill library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to load an image file.
    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Failed to save an image file.
    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Pixel data does not match the declared dimensions.
    #[error("pixel buffer {width}x{height} needs {expected} bytes, got {actual}")]
    InvalidBuffer {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    /// Image dimensions are not supported.
    #[error("unsupported image dimensions {width}x{height}: {reason}")]
    UnsupportedDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    /// Reading or writing the model cache failed.
    #[error("model cache I/O failed for {key}: {source}")]
    Storage {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to create cache directory.
    #[error("failed to create cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single mirror could not deliver the model.
    #[error("mirror {url} failed: {reason}")]
    Network { url: String, reason: String },

    /// Every mirror failed to deliver the model.
    #[error("model download failed on all {} mirrors: {}", failures.len(), MirrorFailures(failures))]
    DownloadExhausted { failures: Vec<Error> },

    /// Failed to build the inference runtime from the model bytes.
    #[error("failed to initialise inference runtime: {reason}")]
    RuntimeInit { reason: String },

    /// Model inference failed.
    #[error("model inference failed: {reason}")]
    Inference { reason: String },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Shape mismatch in tensor or buffer operations.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// A pipeline step failed; carries the human-readable stage label.
    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap this error with the pipeline stage it occurred in.
    ///
    /// Errors that already carry a stage are returned unchanged.
    #[must_use]
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping any stage wrappers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The stage label attached to this error, if any.
    #[must_use]
    pub const fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

struct MirrorFailures<'a>(&'a [Error]);

impl fmt::Display for MirrorFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no mirrors configured");
        }
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

/// Result type alias for lamafill operations.
pub type Result<T> = std::result::Result<T, Error>;
