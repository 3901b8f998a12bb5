//! Inpainting pipeline: image + mask in, repaired image out.

use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;

use ndarray::{Array4, Axis};

use crate::error::{Error, Result};
use crate::image::{
    decode_output, encode_image, encode_mask, resize_with_pad, restore_size, GeometryContext,
    PixelBuffer, ResizeFilter,
};
use crate::model::{
    HttpTransport, InferenceBackend, ModelCache, ModelDownloader, OrtBackend, SessionSlot,
    SharedModel, TensorNames, Transport, DEFAULT_CACHE_KEY, DEFAULT_MIRRORS,
};

use super::progress::{Progress, ProgressSink, Stage};

/// Configuration for the inpainting pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Model URLs, tried in order.
    pub mirrors: Vec<String>,

    /// Key the model is cached under. Change it when the model changes.
    pub cache_key: String,

    /// Cache directory. `None` uses the platform cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Model input/output names for each role.
    pub tensor_names: TensorNames,

    /// Intra-op threads for the runtime. `None` lets it decide.
    pub intra_threads: Option<usize>,

    /// Letterbox inputs to this square size before inference. When `None`,
    /// inputs are letterboxed only if the model declares a fixed size.
    pub fixed_input_size: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mirrors: DEFAULT_MIRRORS.iter().map(ToString::to_string).collect(),
            cache_key: DEFAULT_CACHE_KEY.to_string(),
            cache_dir: None,
            tensor_names: TensorNames::default(),
            intra_threads: None,
            fixed_input_size: None,
        }
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is out of valid range.
    pub fn validate(&self) -> Result<()> {
        if self.mirrors.is_empty() {
            return Err(Error::InvalidParameter {
                name: "mirrors".to_string(),
                reason: "at least one mirror URL is required".to_string(),
            });
        }

        if let Some(url) = self
            .mirrors
            .iter()
            .find(|url| !(url.starts_with("https://") || url.starts_with("http://")))
        {
            return Err(Error::InvalidParameter {
                name: "mirrors".to_string(),
                reason: format!("{url:?} is not an http(s) URL"),
            });
        }

        if self.cache_key.trim().is_empty() {
            return Err(Error::InvalidParameter {
                name: "cache_key".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let names = &self.tensor_names;
        if names.image.is_empty() || names.mask.is_empty() || names.output.is_empty() {
            return Err(Error::InvalidParameter {
                name: "tensor_names".to_string(),
                reason: "image, mask and output names must be set".to_string(),
            });
        }
        if names.image == names.mask {
            return Err(Error::InvalidParameter {
                name: "tensor_names".to_string(),
                reason: "image and mask inputs must differ".to_string(),
            });
        }

        if self.intra_threads == Some(0) {
            return Err(Error::InvalidParameter {
                name: "intra_threads".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        if self.fixed_input_size == Some(0) {
            return Err(Error::InvalidParameter {
                name: "fixed_input_size".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Tensors ready for the model, plus what is needed to map the result back.
struct Prepared {
    image: Array4<u8>,
    mask: Array4<u8>,
    width: u32,
    height: u32,
    geometry: Option<GeometryContext>,
}

/// Owns the model lifecycle and runs inpainting requests.
///
/// The loaded model is memoized per `Inpainter`; share one instance (e.g. in
/// an `Arc`) between callers so they reuse a single download and runtime.
pub struct Inpainter {
    config: Config,
    downloader: ModelDownloader,
    backend: Arc<dyn InferenceBackend>,
    slot: SessionSlot,
}

impl Inpainter {
    /// Create a pipeline using ONNX Runtime, HTTP mirrors and the on-disk
    /// cache. Nothing is downloaded until the model is first needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        let cache = open_cache(config.cache_dir.as_ref());
        let backend = OrtBackend {
            intra_threads: config.intra_threads,
        };
        Self::with_parts(config, cache, Arc::new(HttpTransport::new()), Arc::new(backend))
    }

    /// Create a pipeline from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn with_parts(
        config: Config,
        cache: Option<ModelCache>,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self> {
        config.validate()?;

        tracing::info!("Initializing pipeline with config: {config:?}");

        let downloader = ModelDownloader::new(
            cache,
            config.cache_key.clone(),
            config.mirrors.clone(),
            transport,
        );

        Ok(Self {
            config,
            downloader,
            backend,
            slot: SessionSlot::new(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch the model bytes, from the cache when present.
    ///
    /// # Errors
    ///
    /// Returns an error tagged [`Stage::DownloadingModel`] if every mirror
    /// fails.
    pub async fn download_model(&self, progress: &dyn ProgressSink) -> Result<Vec<u8>> {
        self.downloader
            .download_model(progress)
            .await
            .map_err(|err| err.at_stage(Stage::DownloadingModel))
    }

    /// Return the loaded model, downloading and building it on first use.
    ///
    /// Concurrent first calls share one download and one runtime build. A
    /// blob the runtime rejects is evicted from the cache so the next call
    /// downloads it again.
    ///
    /// # Errors
    ///
    /// Returns an error tagged [`Stage::DownloadingModel`] or
    /// [`Stage::LoadingModel`].
    pub async fn session(&self, progress: &dyn ProgressSink) -> Result<SharedModel> {
        if let Some(model) = self.slot.get() {
            return Ok(model);
        }

        let generation = self.slot.generation();
        let current = || self.slot.generation() == generation;

        self.slot
            .get_or_try_init(|| async {
                let blob = self
                    .downloader
                    .download_model_if(progress, &current)
                    .await
                    .map_err(|err| err.at_stage(Stage::DownloadingModel))?;

                progress.report(&Progress::stage(Stage::LoadingModel));
                let backend = Arc::clone(&self.backend);
                let names = self.config.tensor_names.clone();

                let built = tokio::task::spawn_blocking(move || backend.build(&blob, &names))
                    .await
                    .map_err(Error::from)
                    .and_then(std::convert::identity);

                let model = match built {
                    Ok(model) => model,
                    Err(err) => {
                        if matches!(err, Error::RuntimeInit { .. }) && current() {
                            self.evict_cached_model().await;
                        }
                        return Err(err.at_stage(Stage::LoadingModel));
                    }
                };

                tracing::info!("Inference session ready");
                Ok(model)
            })
            .await
    }

    /// Repaint the pixels of `image` whose `mask` red channel is 255.
    ///
    /// `image` and `mask` are not modified; a new buffer of the same size is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error tagged with the stage that failed. Mismatched image
    /// and mask dimensions fail with [`Error::ShapeMismatch`] before any
    /// model is loaded.
    pub async fn inpaint(
        &self,
        image: &PixelBuffer,
        mask: &PixelBuffer,
        progress: &dyn ProgressSink,
    ) -> Result<PixelBuffer> {
        progress.report(&Progress::stage(Stage::PreparingImage));
        check_inputs(image, mask).map_err(|err| err.at_stage(Stage::PreparingImage))?;

        let model = self.session(progress).await?;

        let size = self.config.fixed_input_size.or_else(|| model.fixed_input_size());
        let prepared = prepare(image, mask, size).map_err(|err| err.at_stage(Stage::PreparingImage))?;
        tracing::debug!(
            "Prepared {}x{} tensors (letterboxed: {})",
            prepared.width,
            prepared.height,
            prepared.geometry.is_some()
        );

        progress.report(&Progress::stage(Stage::RunningModel));
        let Prepared {
            image: image_tensor,
            mask: mask_tensor,
            width,
            height,
            geometry,
        } = prepared;
        let output = tokio::task::spawn_blocking(move || model.run(image_tensor, mask_tensor))
            .await
            .map_err(Error::from)
            .and_then(std::convert::identity)
            .map_err(|err| err.at_stage(Stage::RunningModel))?;

        progress.report(&Progress::stage(Stage::ProcessingResult));
        finish(output, width, height, geometry.as_ref())
            .map_err(|err| err.at_stage(Stage::ProcessingResult))
    }

    /// Whether the model is in the persistent cache.
    pub async fn is_model_cached(&self) -> bool {
        self.downloader.is_cached().await
    }

    /// Remove the cached model and drop the loaded session.
    ///
    /// A first load already in flight still completes for its callers, but
    /// its download is not written back to the cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the cached file cannot be removed. The
    /// session is dropped either way.
    pub async fn clear_model_cache(&self) -> Result<()> {
        self.slot.reset();
        self.downloader.clear_cache().await?;
        tracing::info!("Cleared cached model {}", self.config.cache_key);
        Ok(())
    }

    async fn evict_cached_model(&self) {
        match self.downloader.clear_cache().await {
            Ok(()) => tracing::warn!(
                "Discarded cached model {}; it will be downloaded again",
                self.config.cache_key
            ),
            Err(err) => tracing::warn!("{err}; unusable model stays cached"),
        }
    }
}

fn open_cache(dir: Option<&PathBuf>) -> Option<ModelCache> {
    let cache = match dir {
        Some(dir) => ModelCache::at(dir),
        None => ModelCache::new(),
    };
    match cache {
        Ok(cache) => Some(cache),
        Err(err) => {
            tracing::warn!("{err}; continuing without a model cache");
            None
        }
    }
}

fn check_inputs(image: &PixelBuffer, mask: &PixelBuffer) -> Result<()> {
    image.ensure_same_size(mask)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::UnsupportedDimensions {
            width: image.width(),
            height: image.height(),
            reason: "image is empty".to_string(),
        });
    }
    Ok(())
}

fn prepare(image: &PixelBuffer, mask: &PixelBuffer, size: Option<u32>) -> Result<Prepared> {
    let (image, mask, geometry) = match size {
        Some(size) => {
            let (image, ctx) = resize_with_pad(image, size, ResizeFilter::Smooth)?;
            let (mask, _) = resize_with_pad(mask, size, ResizeFilter::Nearest)?;
            (Cow::Owned(image), Cow::Owned(mask), Some(ctx))
        }
        None => (Cow::Borrowed(image), Cow::Borrowed(mask), None),
    };

    Ok(Prepared {
        image: encode_image(&image).insert_axis(Axis(0)),
        mask: encode_mask(&mask).insert_axis(Axis(0)),
        width: image.width(),
        height: image.height(),
        geometry,
    })
}

fn finish(
    output: Array4<f32>,
    width: u32,
    height: u32,
    geometry: Option<&GeometryContext>,
) -> Result<PixelBuffer> {
    if output.len_of(Axis(0)) != 1 {
        return Err(Error::ShapeMismatch {
            expected: "batch of 1".to_string(),
            actual: format!("{:?}", output.shape()),
        });
    }

    let decoded = decode_output(output.index_axis(Axis(0), 0), width, height)?;

    match geometry {
        Some(ctx) => restore_size(&decoded, ctx, ResizeFilter::Smooth),
        None => Ok(decoded),
    }
}
