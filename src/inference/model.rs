//! Inference backend seam and the built-in dense-layer backend
//!
//! Models exchange flat buffers of native-endian `f32` values. The
//! [`DenseBackend`] loads a single fully connected layer from a TOML
//! artifact:
//!
//! ```toml
//! input_width = 3
//! output_width = 2
//! weights = [[0.5, -1.0, 2.0], [1.0, 1.0, 1.0]]  # output_width rows
//! bias = [0.0, 0.5]
//! activation = "relu"                            # none | relu | sigmoid
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::accelerator::{Accelerator, AcceleratorSet};
use crate::error::{BridgeError, Result};

/// Size of one encoded value
pub const VALUE_SIZE: usize = std::mem::size_of::<f32>();

/// Loads model artifacts
pub trait InferenceBackend: Send + Sync {
    fn load(&self, path: &Path, accelerator: Accelerator) -> Result<Box<dyn Model>>;

    /// Accelerators this backend can run models on
    fn accelerators(&self) -> AcceleratorSet {
        AcceleratorSet::all()
    }

    /// Operation names this backend can execute
    fn supported_operations(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// A loaded, immutable model
pub trait Model: Send + Sync {
    /// Number of input values
    fn input_width(&self) -> usize;

    /// Number of output values
    fn output_width(&self) -> usize;

    /// Run once. Returns the number of bytes written to `output`.
    fn run(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

/// Encode values as native-endian f32 bytes
pub fn encode(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Decode native-endian f32 bytes; a trailing partial value is ignored
pub fn decode(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(VALUE_SIZE)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    None,
    Relu,
    Sigmoid,
}

impl Activation {
    fn apply(self, x: f32) -> f32 {
        match self {
            Activation::None => x,
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Single fully connected layer
#[derive(Debug, Clone, Deserialize)]
pub struct DenseModel {
    input_width: usize,
    output_width: usize,
    weights: Vec<Vec<f32>>,
    #[serde(default)]
    bias: Vec<f32>,
    #[serde(default)]
    activation: Activation,
}

impl DenseModel {
    pub fn parse(content: &str) -> Result<Self> {
        let model: DenseModel = toml::from_str(content)
            .map_err(|e| BridgeError::Resource(format!("invalid model artifact: {}", e)))?;
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: String| -> Result<()> {
            Err(BridgeError::Resource(format!("invalid model artifact: {}", msg)))
        };

        if self.input_width == 0 || self.output_width == 0 {
            return invalid("widths must be non-zero".to_string());
        }
        if self.weights.len() != self.output_width {
            return invalid(format!(
                "{} weight rows for output width {}",
                self.weights.len(),
                self.output_width
            ));
        }
        if let Some(row) = self.weights.iter().find(|row| row.len() != self.input_width) {
            return invalid(format!(
                "weight row of {} for input width {}",
                row.len(),
                self.input_width
            ));
        }
        if !self.bias.is_empty() && self.bias.len() != self.output_width {
            return invalid(format!(
                "{} bias values for output width {}",
                self.bias.len(),
                self.output_width
            ));
        }
        Ok(())
    }

    fn forward(&self, input: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let sum: f32 = row.iter().zip(input).map(|(w, x)| w * x).sum();
                self.activation
                    .apply(sum + self.bias.get(i).copied().unwrap_or(0.0))
            })
            .collect()
    }
}

impl Model for DenseModel {
    fn input_width(&self) -> usize {
        self.input_width
    }

    fn output_width(&self) -> usize {
        self.output_width
    }

    fn run(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let expected = self.input_width * VALUE_SIZE;
        if input.len() != expected {
            return Err(BridgeError::ShapeMismatch {
                what: "input buffer",
                expected,
                actual: input.len(),
            });
        }

        let result = encode(&self.forward(&decode(input)));
        if output.len() < result.len() {
            return Err(BridgeError::ShapeMismatch {
                what: "output buffer",
                expected: result.len(),
                actual: output.len(),
            });
        }
        output[..result.len()].copy_from_slice(&result);
        Ok(result.len())
    }
}

/// CPU backend for [`DenseModel`] artifacts
#[derive(Debug, Default, Clone, Copy)]
pub struct DenseBackend;

impl DenseBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InferenceBackend for DenseBackend {
    fn load(&self, path: &Path, accelerator: Accelerator) -> Result<Box<dyn Model>> {
        if accelerator != Accelerator::Cpu {
            return Err(BridgeError::Resource(format!(
                "dense backend cannot run on {}",
                accelerator
            )));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| BridgeError::Resource(format!("{}: {}", path.display(), e)))?;
        Ok(Box::new(DenseModel::parse(&content)?))
    }

    fn accelerators(&self) -> AcceleratorSet {
        AcceleratorSet::CPU
    }

    fn supported_operations(&self) -> Vec<&'static str> {
        vec!["FULLY_CONNECTED"]
    }
}
