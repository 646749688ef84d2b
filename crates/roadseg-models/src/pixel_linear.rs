use crate::factory::ModelOptions;
use crate::head::OutputHead;
use ndarray::{Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roadseg_abstraction::{ModelError, OutputKind, Parameter, Phase, SegmentationModel};

const WEIGHT: usize = 0;
const BIAS: usize = 1;

/// Per-pixel logistic layer: a 1x1 convolution from `C` channels to one map.
#[derive(Debug, Clone)]
pub struct PixelLinear {
    in_channels: usize,
    params: Vec<Parameter>,
    head: OutputHead,
    input: Option<Array4<f32>>,
}

impl PixelLinear {
    pub const ID: &'static str = "pixel_linear";

    pub fn new(options: &ModelOptions) -> Result<Self, ModelError> {
        if options.in_channels == 0 {
            return Err(ModelError::InvalidConfig("in_channels must be >= 1".to_string()));
        }
        let bound = 1.0 / (options.in_channels as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let weight = (0..options.in_channels).map(|_| rng.gen_range(-bound..bound)).collect();

        Ok(Self {
            in_channels: options.in_channels,
            params: vec![Parameter::new("weight", weight), Parameter::new("bias", vec![0.0])],
            head: OutputHead::new(options.output),
            input: None,
        })
    }

    fn check_input(&self, input: &Array4<f32>) -> Result<(), ModelError> {
        let channels = input.len_of(Axis(1));
        if channels != self.in_channels {
            return Err(ModelError::InvalidInput(format!(
                "{} expects {} channels, got {channels}",
                Self::ID,
                self.in_channels
            )));
        }
        Ok(())
    }
}

impl SegmentationModel for PixelLinear {
    fn architecture(&self) -> &str {
        Self::ID
    }

    fn output_kind(&self) -> OutputKind {
        self.head.kind()
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>, ModelError> {
        self.check_input(input)?;
        let (n, _, h, w) = input.dim();
        let weight = &self.params[WEIGHT].value;
        let bias = self.params[BIAS].value[0];

        let mut z = Array4::from_elem((n, 1, h, w), bias);
        for (c, &wc) in weight.iter().enumerate() {
            let plane = input.index_axis(Axis(1), c);
            z.index_axis_mut(Axis(1), 0).scaled_add(wc, &plane);
        }

        self.input = (phase == Phase::Train).then(|| input.clone());
        Ok(self.head.finish(z, phase))
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<(), ModelError> {
        let input = self.input.as_ref().ok_or(ModelError::NoForwardCache)?;
        let g = self.head.chain(grad_output)?;
        let g0 = g.index_axis(Axis(1), 0);

        for c in 0..self.in_channels {
            let plane = input.index_axis(Axis(1), c);
            self.params[WEIGHT].grad[c] += (&plane * &g0).sum();
        }
        self.params[BIAS].grad[0] += g0.sum();
        Ok(())
    }

    fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(output: OutputKind) -> ModelOptions {
        ModelOptions { in_channels: 2, output, seed: 7 }
    }

    #[test]
    fn test_forward_is_weighted_channel_sum() {
        let mut model = PixelLinear::new(&options(OutputKind::Logits)).unwrap();
        model.params[WEIGHT].value = vec![2.0, -1.0];
        model.params[BIAS].value = vec![0.5];

        let mut x = Array4::zeros((1, 2, 1, 2));
        x[[0, 0, 0, 0]] = 1.0;
        x[[0, 1, 0, 1]] = 3.0;
        let y = model.forward(&x, Phase::Eval).unwrap();
        assert_eq!(y.dim(), (1, 1, 1, 2));
        assert!((y[[0, 0, 0, 0]] - 2.5).abs() < 1e-6);
        assert!((y[[0, 0, 0, 1]] + 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let mut model = PixelLinear::new(&options(OutputKind::Probabilities)).unwrap();
        let x = Array4::from_shape_fn((2, 2, 2, 2), |(n, c, h, w)| {
            (n as f32 + 1.0) * 0.3 - c as f32 * 0.2 + h as f32 * 0.1 - w as f32 * 0.05
        });
        // L = sum(y) so dL/dy = 1.
        let y = model.forward(&x, Phase::Train).unwrap();
        model.backward(&Array4::ones(y.dim())).unwrap();
        let analytic = model.params[WEIGHT].grad[0];

        let eps = 1e-3;
        let mut plus = model.clone();
        plus.params[WEIGHT].value[0] += eps;
        let mut minus = model.clone();
        minus.params[WEIGHT].value[0] -= eps;
        let numeric = (plus.forward(&x, Phase::Eval).unwrap().sum()
            - minus.forward(&x, Phase::Eval).unwrap().sum())
            / (2.0 * eps);
        assert!((analytic - numeric).abs() < 1e-2, "{analytic} vs {numeric}");
    }

    #[test]
    fn test_rejects_wrong_channel_count_and_missing_cache() {
        let mut model = PixelLinear::new(&options(OutputKind::Logits)).unwrap();
        let x = Array4::zeros((1, 3, 2, 2));
        assert!(matches!(model.forward(&x, Phase::Eval), Err(ModelError::InvalidInput(_))));
        assert_eq!(model.backward(&Array4::zeros((1, 1, 2, 2))), Err(ModelError::NoForwardCache));
    }
}
