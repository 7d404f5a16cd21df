//! On-device inference.
//!
//! - **accelerator**: closed accelerator choice and device capability set
//! - **model**: backend and model traits, the built-in dense backend
//! - **pipeline**: active model handle and request execution
//! - **training**: background training runs with cooperative cancellation

pub mod accelerator;
pub mod model;
pub mod pipeline;
pub mod training;

pub use accelerator::{Accelerator, AcceleratorSet};
pub use model::{DenseBackend, InferenceBackend, Model};
pub use pipeline::{DeviceInfo, InferencePipeline, InferenceResult, ModelConfig, ModelHandle};
pub use training::{Trainer, TrainingConfig, TrainingOutcome, TrainingState};
