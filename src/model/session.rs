//! Inference runtime construction and the memoized session slot.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ndarray::Array4;
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};
use tokio::sync::OnceCell;

use crate::error::{Error, Result};

/// A loaded model ready to inpaint, shared between callers.
pub type SharedModel = Arc<dyn InpaintModel>;

/// Which declared model tensor plays which role.
///
/// Checked against the model once, when the runtime is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorNames {
    pub image: String,
    pub mask: String,
    pub output: String,
}

impl Default for TensorNames {
    fn default() -> Self {
        Self {
            image: "image".to_string(),
            mask: "mask".to_string(),
            output: "output".to_string(),
        }
    }
}

/// One forward pass of an inpainting network.
pub trait InpaintModel: Send + Sync {
    /// Run the model on a `(1, 3, H, W)` image and a `(1, 1, H, W)` mask,
    /// returning the `(1, 3, H, W)` result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Inference`] if the forward pass fails.
    fn run(&self, image: Array4<u8>, mask: Array4<u8>) -> Result<Array4<f32>>;

    /// Square input side the model is fixed to, if it declares one.
    fn fixed_input_size(&self) -> Option<u32> {
        None
    }
}

/// Builds an [`InpaintModel`] from serialized model bytes.
pub trait InferenceBackend: Send + Sync {
    /// # Errors
    ///
    /// Returns [`Error::RuntimeInit`] if the bytes are not a usable model or
    /// its declared interface does not match `names`.
    fn build(&self, model: &[u8], names: &TensorNames) -> Result<SharedModel>;
}

/// ONNX Runtime backend on the CPU execution provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrtBackend {
    /// Intra-op thread count; `None` lets the runtime decide.
    pub intra_threads: Option<usize>,
}

impl InferenceBackend for OrtBackend {
    fn build(&self, model: &[u8], names: &TensorNames) -> Result<SharedModel> {
        tracing::info!("Building ONNX Runtime session ({} bytes)", model.len());

        let mut builder = Session::builder()
            .map_err(runtime_init)?
            .with_execution_providers([CPUExecutionProvider::default().build()])
            .map_err(runtime_init)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(runtime_init)?;

        if let Some(threads) = self.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(runtime_init)?;
        }

        let session = builder.commit_from_memory(model).map_err(runtime_init)?;

        let (image_kind, fixed_size) = input_layout(&session, &names.image)?;
        let (mask_kind, _) = input_layout(&session, &names.mask)?;
        let output_index = session
            .outputs
            .iter()
            .position(|o| o.name == names.output)
            .ok_or_else(|| Error::RuntimeInit {
                reason: format!(
                    "model has no output named {:?} (declared: {:?})",
                    names.output,
                    session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
                ),
            })?;

        tracing::debug!(
            "Session ready: image={image_kind:?} mask={mask_kind:?} output #{output_index} fixed={fixed_size:?}"
        );

        Ok(Arc::new(OrtModel {
            session: Mutex::new(session),
            names: names.clone(),
            image_kind,
            mask_kind,
            output_index,
            fixed_size,
        }))
    }
}

/// Element type a model input is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    U8,
    /// Receives the same 0-255 values, widened.
    F32,
}

impl ElementKind {
    fn to_value(self, array: Array4<u8>) -> Result<DynValue> {
        match self {
            Self::U8 => Tensor::from_array(array).map(|t| t.into_dyn()),
            Self::F32 => Tensor::from_array(array.mapv(f32::from)).map(|t| t.into_dyn()),
        }
        .map_err(inference)
    }
}

/// Element type and fixed square size of a declared input.
fn input_layout(session: &Session, name: &str) -> Result<(ElementKind, Option<u32>)> {
    let input = session
        .inputs
        .iter()
        .find(|i| i.name == name)
        .ok_or_else(|| Error::RuntimeInit {
            reason: format!(
                "model has no input named {name:?} (declared: {:?})",
                session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>()
            ),
        })?;

    let ValueType::Tensor { ty, shape, .. } = &input.input_type else {
        return Err(Error::RuntimeInit {
            reason: format!("input {name:?} is not a tensor: {:?}", input.input_type),
        });
    };

    let kind = match ty {
        TensorElementType::Uint8 => ElementKind::U8,
        TensorElementType::Float32 => ElementKind::F32,
        other => {
            return Err(Error::RuntimeInit {
                reason: format!("input {name:?} has unsupported element type {other:?}"),
            })
        }
    };

    let dims: Vec<i64> = shape.iter().copied().collect();
    Ok((kind, fixed_square(name, &dims)?))
}

/// Fixed spatial size of an NCHW input; dynamic axes are `<= 0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn fixed_square(name: &str, dims: &[i64]) -> Result<Option<u32>> {
    let [_, _, height, width] = dims else {
        return Err(Error::RuntimeInit {
            reason: format!("input {name:?} must be NCHW, declared {dims:?}"),
        });
    };
    match (*height, *width) {
        (h, w) if h > 0 && w > 0 && h == w => Ok(Some(h as u32)),
        (h, w) if h > 0 && w > 0 => Err(Error::RuntimeInit {
            reason: format!("input {name:?} has non-square fixed size {w}x{h}"),
        }),
        _ => Ok(None),
    }
}

struct OrtModel {
    // `Session::run` needs exclusive access.
    session: Mutex<Session>,
    names: TensorNames,
    image_kind: ElementKind,
    mask_kind: ElementKind,
    output_index: usize,
    fixed_size: Option<u32>,
}

impl InpaintModel for OrtModel {
    fn run(&self, image: Array4<u8>, mask: Array4<u8>) -> Result<Array4<f32>> {
        let image_value = self.image_kind.to_value(image)?;
        let mask_value = self.mask_kind.to_value(mask)?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        let outputs = session
            .run(ort::inputs![
                self.names.image.as_str() => image_value,
                self.names.mask.as_str() => mask_value,
            ])
            .map_err(inference)?;

        let output = outputs
            .values()
            .nth(self.output_index)
            .ok_or_else(|| Error::ShapeMismatch {
                expected: format!("output {:?}", self.names.output),
                actual: "no output".to_string(),
            })?;

        extract_array4(&output)
    }

    fn fixed_input_size(&self) -> Option<u32> {
        self.fixed_size
    }
}

/// Extract a 4D array from an ONNX value, widening u8 outputs.
#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn extract_array4(value: &ort::value::ValueRef<'_>) -> Result<Array4<f32>> {
    let (dims, data): (Vec<usize>, Vec<f32>) = match value.try_extract_tensor::<f32>() {
        // Safe: tensor dimensions are always non-negative and within bounds
        Ok((shape, data)) => (shape.iter().map(|&x| x as usize).collect(), data.to_vec()),
        Err(_) => {
            let (shape, data) = value.try_extract_tensor::<u8>().map_err(inference)?;
            (
                shape.iter().map(|&x| x as usize).collect(),
                data.iter().copied().map(f32::from).collect(),
            )
        }
    };

    if dims.len() != 4 {
        return Err(Error::ShapeMismatch {
            expected: "4D tensor".to_string(),
            actual: format!("{}D tensor", dims.len()),
        });
    }

    Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), data).map_err(|_| {
        Error::ShapeMismatch {
            expected: format!("{dims:?}"),
            actual: "reshape failed".to_string(),
        }
    })
}

fn runtime_init(err: impl Display) -> Error {
    Error::RuntimeInit {
        reason: err.to_string(),
    }
}

fn inference(err: impl Display) -> Error {
    Error::Inference {
        reason: err.to_string(),
    }
}

/// Holds at most one [`SharedModel`] and memoizes its construction.
///
/// Concurrent callers of [`SessionSlot::get_or_try_init`] wait on a single
/// in-flight initialisation. A failed initialisation leaves the slot empty so
/// a later call can retry. [`SessionSlot::reset`] drops the held model;
/// callers already waiting on the old cell still receive its result.
#[derive(Default)]
pub struct SessionSlot {
    cell: Mutex<Arc<OnceCell<SharedModel>>>,
    generation: AtomicU64,
}

impl SessionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The held model, if initialised.
    #[must_use]
    pub fn get(&self) -> Option<SharedModel> {
        self.current().get().cloned()
    }

    /// Return the held model or run `init` to create it.
    ///
    /// # Errors
    ///
    /// Returns whatever error `init` produced.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<SharedModel>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedModel>>,
    {
        let cell = self.current();
        cell.get_or_try_init(init).await.cloned()
    }

    /// Forget the held model.
    pub fn reset(&self) {
        let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
        *cell = Arc::new(OnceCell::new());
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of resets so far. An initialisation that started under an
    /// older generation has been superseded.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn current(&self) -> Arc<OnceCell<SharedModel>> {
        Arc::clone(&self.cell.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
