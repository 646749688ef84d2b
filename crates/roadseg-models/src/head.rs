//! Output activation shared by the built-in architectures.

use ndarray::{Array4, Zip};
use roadseg_abstraction::{ModelError, OutputKind, Phase};

/// Applies the configured output activation and remembers what the backward
/// pass needs to chain through it.
#[derive(Debug, Clone)]
pub struct OutputHead {
    kind: OutputKind,
    activated: Option<Array4<f32>>,
}

impl OutputHead {
    pub fn new(kind: OutputKind) -> Self {
        Self { kind, activated: None }
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    /// Turns pre-activations into the model output.
    pub fn finish(&mut self, mut z: Array4<f32>, phase: Phase) -> Array4<f32> {
        if self.kind == OutputKind::Probabilities {
            z.mapv_inplace(sigmoid);
            if phase == Phase::Train {
                self.activated = Some(z.clone());
            }
        }
        z
    }

    /// Converts `dLoss/dOutput` into `dLoss/dPreActivation`.
    pub fn chain(&self, grad_output: &Array4<f32>) -> Result<Array4<f32>, ModelError> {
        match self.kind {
            OutputKind::Logits => Ok(grad_output.clone()),
            OutputKind::Probabilities => {
                let y = self.activated.as_ref().ok_or(ModelError::NoForwardCache)?;
                if y.dim() != grad_output.dim() {
                    return Err(ModelError::InvalidInput(format!(
                        "gradient shape {:?} does not match output shape {:?}",
                        grad_output.dim(),
                        y.dim()
                    )));
                }
                let mut g = grad_output.clone();
                Zip::from(&mut g).and(y).for_each(|g, &y| *g *= y * (1.0 - y));
                Ok(g)
            }
        }
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
