//! Model abstraction layer for roadseg.
//!
//! The training core never knows which network it is driving. It talks to a
//! [`SegmentationModel`]: a differentiable function from a `(N, C, H, W)` batch
//! to a `(N, 1, H, W)` map, with an enumerable set of [`Parameter`]s and a
//! serializable [`ModelState`].

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Represents an error raised by a model collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The input batch does not have the layout the model was built for.
    #[error("Invalid model input: {0}")]
    InvalidInput(String),

    /// `backward` was called without a preceding training-phase `forward`.
    #[error("backward called without a cached training forward pass")]
    NoForwardCache,

    /// A parameter named by the model is absent from the restored state.
    #[error("Missing tensor in model state: {0}")]
    MissingTensor(String),

    /// A restored tensor has a different element count than the live parameter.
    #[error("Tensor '{name}' has {actual} elements, expected {expected}")]
    StateMismatch {
        /// Parameter name.
        name: String,
        /// Element count of the live parameter.
        expected: usize,
        /// Element count found in the state.
        actual: usize,
    },

    /// The architecture identifier is not registered.
    #[error("Unknown architecture: {0}")]
    UnknownArchitecture(String),

    /// Architecture options are invalid (e.g. zero input channels).
    #[error("Invalid model configuration: {0}")]
    InvalidConfig(String),
}

/// Whether a forward pass should retain what `backward` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Gradients will follow; cache activations.
    Train,
    /// Inference only; nothing is cached.
    Eval,
}

/// What the values produced by `forward` mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Unbounded scores; a sigmoid maps them to probabilities.
    Logits,
    /// Values already in `[0, 1]`.
    Probabilities,
}

/// A named, flat trainable tensor with its accumulated gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Stable name used as the key in [`ModelState`].
    pub name: String,
    /// Current values.
    pub value: Vec<f32>,
    /// Gradient accumulated since the last `zero_grad`.
    pub grad: Vec<f32>,
    /// Frozen parameters are skipped by optimizers.
    pub requires_grad: bool,
}

impl Parameter {
    /// Creates a trainable parameter with a zeroed gradient.
    pub fn new(name: impl Into<String>, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self { name: name.into(), value, grad, requires_grad: true }
    }

    /// Marks this parameter as frozen.
    #[must_use]
    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    /// Number of scalar elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// True if the parameter holds no elements.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Resets the accumulated gradient to zero.
    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// Full parameter state of a model, keyed by parameter name.
///
/// Serialized as a map of base64-encoded little-endian `f32` blobs so a save
/// and restore reproduces every value bit for bit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelState {
    #[serde(with = "tensor_blobs")]
    tensors: BTreeMap<String, Vec<f32>>,
}

impl ModelState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tensor.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f32>) {
        self.tensors.insert(name.into(), values);
    }

    /// Looks up a tensor by name.
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        self.tensors.get(name).map(Vec::as_slice)
    }

    /// Number of tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True if no tensors are stored.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Iterates tensors in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

mod tensor_blobs {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        tensors: &BTreeMap<String, Vec<f32>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&str, String> = tensors
            .iter()
            .map(|(name, values)| {
                let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.as_str(), STANDARD.encode(bytes))
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Vec<f32>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(name, blob)| {
                let bytes = STANDARD.decode(blob.as_bytes()).map_err(D::Error::custom)?;
                if bytes.len() % 4 != 0 {
                    return Err(D::Error::custom(format!(
                        "tensor '{name}' blob has {} bytes, not a multiple of 4",
                        bytes.len()
                    )));
                }
                let values = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok((name, values))
            })
            .collect()
    }
}

/// A trainable pixel-wise segmentation network.
///
/// Implementations must be `Send` so a model can be built on one thread and
/// driven by the training control thread.
pub trait SegmentationModel: Send {
    /// Registered architecture identifier (persisted in checkpoints).
    fn architecture(&self) -> &str;

    /// Meaning of the values returned by [`SegmentationModel::forward`].
    fn output_kind(&self) -> OutputKind;

    /// Runs the network on a `(N, C, H, W)` batch and returns `(N, 1, H, W)`.
    ///
    /// # Errors
    /// Returns a `ModelError` if the input layout is not supported.
    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>, ModelError>;

    /// Accumulates parameter gradients given `dLoss/dOutput` for the most
    /// recent training-phase forward pass.
    ///
    /// # Errors
    /// Returns `ModelError::NoForwardCache` if no training forward preceded it.
    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<(), ModelError>;

    /// All parameters, trainable or not.
    fn parameters(&self) -> &[Parameter];

    /// Mutable access for optimizers.
    fn parameters_mut(&mut self) -> &mut [Parameter];

    /// Clears every accumulated gradient.
    fn zero_grad(&mut self) {
        self.parameters_mut().iter_mut().for_each(Parameter::zero_grad);
    }

    /// Snapshot of every parameter value.
    fn state(&self) -> ModelState {
        let mut state = ModelState::new();
        for p in self.parameters() {
            state.insert(p.name.clone(), p.value.clone());
        }
        state
    }

    /// Restores parameter values from a snapshot.
    ///
    /// # Errors
    /// Fails if a parameter is missing from `state` or has a different size.
    fn load_state(&mut self, state: &ModelState) -> Result<(), ModelError> {
        for p in self.parameters_mut() {
            let values = state
                .get(&p.name)
                .ok_or_else(|| ModelError::MissingTensor(p.name.clone()))?;
            if values.len() != p.value.len() {
                return Err(ModelError::StateMismatch {
                    name: p.name.clone(),
                    expected: p.value.len(),
                    actual: values.len(),
                });
            }
            p.value.copy_from_slice(values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        params: Vec<Parameter>,
    }

    impl SegmentationModel for Fixed {
        fn architecture(&self) -> &str {
            "fixed"
        }

        fn output_kind(&self) -> OutputKind {
            OutputKind::Logits
        }

        fn forward(&mut self, input: &Array4<f32>, _phase: Phase) -> Result<Array4<f32>, ModelError> {
            let (n, _, h, w) = input.dim();
            Ok(Array4::zeros((n, 1, h, w)))
        }

        fn backward(&mut self, _grad_output: &Array4<f32>) -> Result<(), ModelError> {
            Ok(())
        }

        fn parameters(&self) -> &[Parameter] {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut [Parameter] {
            &mut self.params
        }
    }

    #[test]
    fn test_state_serializes_bit_exact() {
        let mut state = ModelState::new();
        state.insert("w", vec![0.1, -3.25e-7, f32::MAX, 1.0 / 3.0]);
        let json = serde_json::to_string(&state).unwrap();
        let back: ModelState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
        let bits: Vec<u32> = back.get("w").unwrap().iter().map(|v| v.to_bits()).collect();
        let orig: Vec<u32> = state.get("w").unwrap().iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits, orig);
    }

    #[test]
    fn test_state_rejects_truncated_blob() {
        let err = serde_json::from_str::<ModelState>(r#"{"w":"AAA="}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_load_state_restores_and_validates() {
        let mut model = Fixed { params: vec![Parameter::new("w", vec![0.0; 3])] };
        let mut state = ModelState::new();
        state.insert("w", vec![1.0, 2.0, 3.0]);
        model.load_state(&state).unwrap();
        assert_eq!(model.parameters()[0].value, vec![1.0, 2.0, 3.0]);

        let mut short = ModelState::new();
        short.insert("w", vec![1.0]);
        assert!(matches!(model.load_state(&short), Err(ModelError::StateMismatch { .. })));
        assert!(matches!(
            model.load_state(&ModelState::new()),
            Err(ModelError::MissingTensor(_))
        ));
    }

    #[test]
    fn test_zero_grad_clears_all_parameters() {
        let mut p = Parameter::new("b", vec![1.0, 2.0]);
        p.grad = vec![5.0, 6.0];
        let mut model = Fixed { params: vec![p, Parameter::new("c", vec![0.0]).frozen()] };
        model.zero_grad();
        assert!(model.parameters().iter().all(|p| p.grad.iter().all(|g| *g == 0.0)));
        assert!(!model.parameters()[1].requires_grad);
    }
}
