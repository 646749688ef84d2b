use crate::factory::ModelOptions;
use crate::head::OutputHead;
use ndarray::{s, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roadseg_abstraction::{ModelError, OutputKind, Parameter, Phase, SegmentationModel};

const WEIGHT: usize = 0;
const BIAS: usize = 1;
const K: usize = 3;

/// Single 3x3 convolution (zero padding, stride 1) from `C` channels to one map.
///
/// Weights are laid out `[c][ky][kx]`.
#[derive(Debug, Clone)]
pub struct LocalConv3 {
    in_channels: usize,
    params: Vec<Parameter>,
    head: OutputHead,
    input: Option<Array4<f32>>,
}

impl LocalConv3 {
    pub const ID: &'static str = "local_conv3";

    pub fn new(options: &ModelOptions) -> Result<Self, ModelError> {
        if options.in_channels == 0 {
            return Err(ModelError::InvalidConfig("in_channels must be >= 1".to_string()));
        }
        let fan_in = options.in_channels * K * K;
        let bound = 1.0 / (fan_in as f32).sqrt();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let weight = (0..fan_in).map(|_| rng.gen_range(-bound..bound)).collect();

        Ok(Self {
            in_channels: options.in_channels,
            params: vec![Parameter::new("weight", weight), Parameter::new("bias", vec![0.0])],
            head: OutputHead::new(options.output),
            input: None,
        })
    }

    fn weight_index(c: usize, ky: usize, kx: usize) -> usize {
        (c * K + ky) * K + kx
    }
}

/// Overlapping window of a `len`-long axis shifted by `k - 1` (in -1..=1).
///
/// Returns `(dst_start, src_start, count)`.
fn shifted_range(len: usize, k: usize) -> (usize, usize, usize) {
    match k {
        0 => (1, 0, len.saturating_sub(1)),
        1 => (0, 0, len),
        _ => (0, 1, len.saturating_sub(1)),
    }
}

impl SegmentationModel for LocalConv3 {
    fn architecture(&self) -> &str {
        Self::ID
    }

    fn output_kind(&self) -> OutputKind {
        self.head.kind()
    }

    fn forward(&mut self, input: &Array4<f32>, phase: Phase) -> Result<Array4<f32>, ModelError> {
        let (n, channels, h, w) = input.dim();
        if channels != self.in_channels {
            return Err(ModelError::InvalidInput(format!(
                "{} expects {} channels, got {channels}",
                Self::ID,
                self.in_channels
            )));
        }

        let weight = &self.params[WEIGHT].value;
        let mut z = Array4::from_elem((n, 1, h, w), self.params[BIAS].value[0]);
        for c in 0..channels {
            for ky in 0..K {
                let (dy, sy, ny) = shifted_range(h, ky);
                for kx in 0..K {
                    let (dx, sx, nx) = shifted_range(w, kx);
                    if ny == 0 || nx == 0 {
                        continue;
                    }
                    let wk = weight[Self::weight_index(c, ky, kx)];
                    let src = input.slice(s![.., c, sy..sy + ny, sx..sx + nx]);
                    z.slice_mut(s![.., 0, dy..dy + ny, dx..dx + nx]).scaled_add(wk, &src);
                }
            }
        }

        self.input = (phase == Phase::Train).then(|| input.clone());
        Ok(self.head.finish(z, phase))
    }

    fn backward(&mut self, grad_output: &Array4<f32>) -> Result<(), ModelError> {
        let input = self.input.as_ref().ok_or(ModelError::NoForwardCache)?;
        let g = self.head.chain(grad_output)?;
        let (_, channels, h, w) = input.dim();

        for c in 0..channels {
            for ky in 0..K {
                let (dy, sy, ny) = shifted_range(h, ky);
                for kx in 0..K {
                    let (dx, sx, nx) = shifted_range(w, kx);
                    if ny == 0 || nx == 0 {
                        continue;
                    }
                    let src = input.slice(s![.., c, sy..sy + ny, sx..sx + nx]);
                    let dst = g.slice(s![.., 0, dy..dy + ny, dx..dx + nx]);
                    self.params[WEIGHT].grad[Self::weight_index(c, ky, kx)] += (&src * &dst).sum();
                }
            }
        }
        self.params[BIAS].grad[0] += g.index_axis(Axis(1), 0).sum();
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

    #[test]
    fn test_centre_tap_only_acts_as_identity() {
        let options = ModelOptions { in_channels: 1, output: OutputKind::Logits, seed: 1 };
        let mut model = LocalConv3::new(&options).unwrap();
        model.params[WEIGHT].value = vec![0.0; 9];
        model.params[WEIGHT].value[LocalConv3::weight_index(0, 1, 1)] = 1.0;

        let x = Array4::from_shape_fn((1, 1, 3, 3), |(_, _, h, w)| (h * 3 + w) as f32);
        let y = model.forward(&x, Phase::Eval).unwrap();
        assert_eq!(y, x);
    }

    #[test]
    fn test_left_tap_reads_left_neighbour_with_zero_padding() {
        let options = ModelOptions { in_channels: 1, output: OutputKind::Logits, seed: 1 };
        let mut model = LocalConv3::new(&options).unwrap();
        model.params[WEIGHT].value = vec![0.0; 9];
        model.params[WEIGHT].value[LocalConv3::weight_index(0, 1, 0)] = 1.0;

        let x = Array4::from_shape_fn((1, 1, 1, 3), |(_, _, _, w)| (w + 1) as f32);
        let y = model.forward(&x, Phase::Eval).unwrap();
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let options = ModelOptions { in_channels: 2, output: OutputKind::Logits, seed: 3 };
        let mut model = LocalConv3::new(&options).unwrap();
        let x = Array4::from_shape_fn((1, 2, 4, 4), |(_, c, h, w)| {
            ((c * 16 + h * 4 + w) as f32 * 0.37).sin()
        });
        let y = model.forward(&x, Phase::Train).unwrap();
        // L = sum(y^2) / 2 so dL/dy = y.
        model.backward(&y).unwrap();

        let idx = LocalConv3::weight_index(1, 0, 2);
        let analytic = model.params[WEIGHT].grad[idx];
        let loss = |m: &mut LocalConv3| {
            let y = m.forward(&x, Phase::Eval).unwrap();
            y.mapv(|v| v * v).sum() / 2.0
        };
        let eps = 1e-2;
        let mut plus = model.clone();
        plus.params[WEIGHT].value[idx] += eps;
        let mut minus = model.clone();
        minus.params[WEIGHT].value[idx] -= eps;
        let numeric = (loss(&mut plus) - loss(&mut minus)) / (2.0 * eps);
        assert!((analytic - numeric).abs() < 1e-2, "{analytic} vs {numeric}");
    }
}
