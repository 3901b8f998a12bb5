//! Inpainting pipeline and its progress reporting.

mod inpaint;
mod progress;

pub use inpaint::{Config, Inpainter};
pub use progress::{NoProgress, Progress, ProgressSink, Stage};
