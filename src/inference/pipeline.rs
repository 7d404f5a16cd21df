//! Inference request pipeline
//!
//! Holds the active model handle and turns numeric requests into single
//! model runs. Reloading swaps the whole handle; calls already in flight
//! keep the handle they started with.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::accelerator::{Accelerator, AcceleratorSet};
use super::model::{decode, encode, InferenceBackend, Model, VALUE_SIZE};
use crate::config::InferenceConfig;
use crate::error::{BridgeError, Result};

/// What to load
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub path: PathBuf,
    /// Declared input shape; empty means "whatever the model says"
    pub input_shape: Vec<usize>,
    /// Declared output shape; empty means "whatever the model says"
    pub output_shape: Vec<usize>,
    pub accelerator: Accelerator,
}

impl ModelConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            input_shape: Vec::new(),
            output_shape: Vec::new(),
            accelerator: Accelerator::Auto,
        }
    }

    pub fn with_shapes(mut self, input: Vec<usize>, output: Vec<usize>) -> Self {
        self.input_shape = input;
        self.output_shape = output;
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = accelerator;
        self
    }
}

fn shape_width(shape: &[usize]) -> Option<usize> {
    (!shape.is_empty()).then(|| shape.iter().product())
}

/// A loaded model. Never mutated; reload replaces it.
pub struct ModelHandle {
    pub path: PathBuf,
    pub accelerator: Accelerator,
    pub input_width: usize,
    pub output_width: usize,
    model: Box<dyn Model>,
}

impl ModelHandle {
    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("path", &self.path)
            .field("accelerator", &self.accelerator)
            .field("input_width", &self.input_width)
            .field("output_width", &self.output_width)
            .finish_non_exhaustive()
    }
}

/// Outputs of one inference call
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub outputs: Vec<f32>,
    /// Wall-clock time of the model run
    pub latency: Duration,
}

impl InferenceResult {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Capabilities of this device
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub accelerators: Vec<Accelerator>,
    pub has_npu: bool,
    pub supported_operations: Vec<String>,
}

/// Runs inference requests against the active model
pub struct InferencePipeline {
    backend: Arc<dyn InferenceBackend>,
    available: AcceleratorSet,
    model_dir: Option<PathBuf>,
    timeout: Duration,
    current: RwLock<Option<Arc<ModelHandle>>>,
}

impl InferencePipeline {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: &InferenceConfig) -> Self {
        Self {
            available: (config.available() & backend.accelerators()) | AcceleratorSet::CPU,
            backend,
            model_dir: config.model_dir.clone(),
            timeout: config.timeout(),
            current: RwLock::new(None),
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.model_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Load a model, replacing any active one.
    ///
    /// On failure the previously loaded model stays active.
    pub fn load(&self, config: &ModelConfig) -> Result<Arc<ModelHandle>> {
        let accelerator = config.accelerator.resolve(self.available)?;
        let path = self.resolve_path(&config.path);
        if !path.is_file() {
            return Err(BridgeError::ModelNotFound(path));
        }

        let model = self.backend.load(&path, accelerator)?;
        let (input_width, output_width) = (model.input_width(), model.output_width());

        if let Some(declared) = shape_width(&config.input_shape) {
            if declared != input_width {
                return Err(BridgeError::ShapeMismatch {
                    what: "declared input",
                    expected: input_width,
                    actual: declared,
                });
            }
        }
        if let Some(declared) = shape_width(&config.output_shape) {
            if declared != output_width {
                return Err(BridgeError::ShapeMismatch {
                    what: "declared output",
                    expected: output_width,
                    actual: declared,
                });
            }
        }

        let handle = Arc::new(ModelHandle {
            path,
            accelerator,
            input_width,
            output_width,
            model,
        });
        let previous = self.current.write().replace(handle.clone());

        info!(
            "Loaded model {} on {} ({} -> {}){}",
            handle.path.display(),
            accelerator,
            input_width,
            output_width,
            if previous.is_some() { ", replacing previous" } else { "" }
        );
        Ok(handle)
    }

    /// Drop the active model. Returns whether one was loaded.
    pub fn unload(&self) -> bool {
        let previous = self.current.write().take();
        if let Some(handle) = &previous {
            info!("Unloaded model {}", handle.path.display());
        }
        previous.is_some()
    }

    /// The active model, if any
    pub fn handle(&self) -> Option<Arc<ModelHandle>> {
        self.current.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            accelerators: self.available.to_list(),
            has_npu: self.available.contains(AcceleratorSet::NPU),
            supported_operations: self
                .backend
                .supported_operations()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Run the active model once on `inputs`
    pub fn infer(&self, inputs: &[f32]) -> Result<InferenceResult> {
        let handle = self.handle().ok_or(BridgeError::NotLoaded)?;
        run_with_timeout(handle, inputs, self.timeout)
    }
}

/// Run a model on a worker thread, giving up after `timeout`.
///
/// A run that times out cannot be interrupted; its thread is left to
/// finish in the background and its result is discarded.
pub(crate) fn run_with_timeout(
    handle: Arc<ModelHandle>,
    inputs: &[f32],
    timeout: Duration,
) -> Result<InferenceResult> {
    if inputs.len() != handle.input_width {
        return Err(BridgeError::ShapeMismatch {
            what: "input",
            expected: handle.input_width,
            actual: inputs.len(),
        });
    }

    let input = encode(inputs);
    let mut output = vec![0u8; handle.output_width * VALUE_SIZE];
    let expected = output.len();

    let (tx, rx) = mpsc::sync_channel(1);
    let worker = handle.clone();
    thread::Builder::new()
        .name("inference".to_string())
        .spawn(move || {
            let start = Instant::now();
            let result = worker.model.run(&input, &mut output);
            let latency = start.elapsed();
            let _ = tx.send(result.map(|written| (written, output, latency)));
        })
        .map_err(|e| BridgeError::Resource(format!("inference worker: {}", e)))?;

    let (written, output, latency) = match rx.recv_timeout(timeout) {
        Ok(result) => result?,
        Err(RecvTimeoutError::Timeout) => {
            warn!("Inference on {} timed out", handle.path.display());
            return Err(BridgeError::Timeout {
                ms: timeout.as_millis() as u64,
            });
        }
        Err(RecvTimeoutError::Disconnected) => {
            return Err(BridgeError::Resource(
                "inference worker exited without a result".to_string(),
            ));
        }
    };

    if written != expected {
        return Err(BridgeError::ShapeMismatch {
            what: "output buffer",
            expected,
            actual: written,
        });
    }

    debug!("Inference took {:?}", latency);
    Ok(InferenceResult {
        outputs: decode(&output),
        latency,
    })
}
