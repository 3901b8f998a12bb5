//! Model acquisition: persistent cache, mirror download and runtime sessions.

mod cache;
mod download;
mod session;

pub use cache::ModelCache;
pub use download::{Body, HttpTransport, ModelDownloader, Transport};
pub use session::{
    InferenceBackend, InpaintModel, OrtBackend, SessionSlot, SharedModel, TensorNames,
};

/// Cache key of the current model version.
pub const DEFAULT_CACHE_KEY: &str = "lama_fp32.onnx";

/// Mirrors hosting the LaMa ONNX export, tried in order.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://huggingface.co/Carve/LaMa-ONNX/resolve/main/lama_fp32.onnx",
    "https://hf-mirror.com/Carve/LaMa-ONNX/resolve/main/lama_fp32.onnx",
];
