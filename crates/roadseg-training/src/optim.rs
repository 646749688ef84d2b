use crate::error::{TrainingError, TrainingResult};
use roadseg_abstraction::Parameter;

/// Updates trainable parameters from their accumulated gradients.
pub trait Optimizer: Send {
    fn name(&self) -> &'static str;

    /// Applies one update. Frozen parameters are left untouched.
    fn step(&mut self, params: &mut [Parameter]);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// Builds an optimizer from its name; any name starting with `adam` or
/// `rmsprop` is accepted.
pub fn build_optimizer(name: &str, lr: f64) -> TrainingResult<Box<dyn Optimizer>> {
    if name.starts_with("adam") {
        Ok(Box::new(Adam::new(lr)))
    } else if name.starts_with("rmsprop") {
        Ok(Box::new(RmsProp::new(lr)))
    } else {
        Err(TrainingError::Configuration(format!(
            "unsupported optimizer '{name}' (expected adam* or rmsprop*)"
        )))
    }
}

fn ensure_slot(slots: &mut Vec<Vec<f32>>, idx: usize, len: usize) {
    if idx >= slots.len() {
        slots.resize(idx + 1, Vec::new());
    }
    if slots[idx].len() != len {
        slots[idx] = vec![0.0; len];
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    beta1: f32,
    beta2: f32,
    eps: f32,
    t: i32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    #[must_use]
    pub fn new(lr: f64) -> Self {
        Self { lr, beta1: 0.9, beta2: 0.999, eps: 1e-8, t: 0, m: Vec::new(), v: Vec::new() }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn step(&mut self, params: &mut [Parameter]) {
        self.t = self.t.saturating_add(1);
        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);
        let lr = self.lr as f32;

        for (idx, param) in params.iter_mut().enumerate() {
            if !param.requires_grad {
                continue;
            }
            ensure_slot(&mut self.m, idx, param.len());
            ensure_slot(&mut self.v, idx, param.len());
            let (m, v) = (&mut self.m[idx], &mut self.v[idx]);

            for i in 0..param.len() {
                let g = param.grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m[i] / bias1;
                let v_hat = v[i] / bias2;
                param.value[i] -= lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[derive(Debug, Clone)]
pub struct RmsProp {
    lr: f64,
    alpha: f32,
    eps: f32,
    square_avg: Vec<Vec<f32>>,
}

impl RmsProp {
    #[must_use]
    pub fn new(lr: f64) -> Self {
        Self { lr, alpha: 0.99, eps: 1e-8, square_avg: Vec::new() }
    }
}

impl Optimizer for RmsProp {
    fn name(&self) -> &'static str {
        "rmsprop"
    }

    fn step(&mut self, params: &mut [Parameter]) {
        let lr = self.lr as f32;
        for (idx, param) in params.iter_mut().enumerate() {
            if !param.requires_grad {
                continue;
            }
            ensure_slot(&mut self.square_avg, idx, param.len());
            let avg = &mut self.square_avg[idx];
            for i in 0..param.len() {
                let g = param.grad[i];
                avg[i] = self.alpha * avg[i] + (1.0 - self.alpha) * g * g;
                param.value[i] -= lr * g / (avg[i].sqrt() + self.eps);
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> Vec<Parameter> {
        let mut w = Parameter::new("w", vec![1.0, -1.0]);
        w.grad = vec![0.5, -2.0];
        let mut frozen = Parameter::new("f", vec![3.0]).frozen();
        frozen.grad = vec![1.0];
        vec![w, frozen]
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let mut params = params();
        let mut adam = Adam::new(0.1);
        adam.step(&mut params);
        // bias-corrected first step is lr * sign(g)
        assert!((params[0].value[0] - 0.9).abs() < 1e-4);
        assert!((params[0].value[1] + 0.9).abs() < 1e-4);
        assert_eq!(params[1].value, vec![3.0]);
    }

    #[test]
    fn test_rmsprop_step() {
        let mut params = params();
        let mut opt = RmsProp::new(0.01);
        opt.step(&mut params);
        // g / sqrt(0.01 g^2) = 10 sign(g)
        assert!((params[0].value[0] - 0.9).abs() < 1e-4);
        assert_eq!(params[1].value, vec![3.0]);
    }

    #[test]
    fn test_build_optimizer_by_prefix() {
        assert_eq!(build_optimizer("adam_amsgrad", 1e-3).unwrap().name(), "adam");
        assert_eq!(build_optimizer("rmsprop", 1e-3).unwrap().name(), "rmsprop");
        assert!(matches!(build_optimizer("sgd", 1e-3), Err(TrainingError::Configuration(_))));
    }

    #[test]
    fn test_learning_rate_can_be_changed() {
        let mut opt = build_optimizer("adam", 1e-3).unwrap();
        opt.set_learning_rate(1e-4);
        assert!((opt.learning_rate() - 1e-4).abs() < f64::EPSILON);
    }
}
