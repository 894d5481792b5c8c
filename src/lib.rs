//! NIA: DnCNN denoising of microscopy image stacks through ONNX Runtime.
//!
//! A run normalizes every plane of a stack by one global factor, feeds each
//! (frame, slice, channel) plane through the network as a `(1, H, W, 1)`
//! tensor, and writes the result back at the stack's native bit depth.

pub mod app;
pub mod cli;
pub mod io;
pub mod logger;
pub mod model;
pub mod ops;
pub mod settings;
pub mod stack;

pub use model::ModelSource;
pub use ops::pipeline::{
    CancelToken, RunError, RunEvent, RunHandle, RunRequest, RunSummary, TraversalOptions,
    run_denoise, spawn_run,
};
pub use stack::{ImageStack, PixelFormat, PlaneData, StackCoord, StackDims};
