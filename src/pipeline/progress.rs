//! Stage and progress reporting contract shared by download and inference.

use std::fmt;

/// A named step of model acquisition or inpainting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Fetching the model from a mirror, or reading it from the cache.
    DownloadingModel,
    /// Building the inference runtime from the model bytes.
    LoadingModel,
    /// Validating and encoding the image and mask.
    PreparingImage,
    /// The forward pass.
    RunningModel,
    /// Decoding the output tensor back into pixels.
    ProcessingResult,
}

impl Stage {
    /// Human-readable label shown to users.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::DownloadingModel => "downloading model",
            Self::LoadingModel => "loading model",
            Self::PreparingImage => "preparing image",
            Self::RunningModel => "running model",
            Self::ProcessingResult => "processing result",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A progress update: the current stage plus byte counts when relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub stage: Stage,
    pub loaded_bytes: u64,
    /// Size hint, when the source provided one.
    pub total_bytes: Option<u64>,
}

impl Progress {
    /// Entering `stage`, no byte counts.
    #[must_use]
    pub const fn stage(stage: Stage) -> Self {
        Self {
            stage,
            loaded_bytes: 0,
            total_bytes: None,
        }
    }

    /// Download progress.
    #[must_use]
    pub const fn download(loaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            stage: Stage::DownloadingModel,
            loaded_bytes,
            total_bytes,
        }
    }

    /// A finished download of `size` bytes.
    #[must_use]
    pub const fn download_complete(size: u64) -> Self {
        Self::download(size, Some(size))
    }

    /// Completion percentage in `[0, 100]`, when a total is known.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some((self.loaded_bytes as f64 / total as f64 * 100.0).min(100.0)),
            None => None,
        }
    }
}

/// Receives progress updates.
///
/// Implemented for any `Fn(&Progress)` closure.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &Progress);
}

impl<F> ProgressSink for F
where
    F: Fn(&Progress) + Send + Sync,
{
    fn report(&self, progress: &Progress) {
        self(progress);
    }
}

/// Discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: &Progress) {}
}
