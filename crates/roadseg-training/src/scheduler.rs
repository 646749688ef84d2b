use crate::optim::Optimizer;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Adjusts the optimizer learning rate once per epoch from a monitored value.
pub trait LrScheduler: Send {
    /// Feeds the epoch's monitored value; returns the learning rate now in use.
    fn step(&mut self, metric: f64, optimizer: &mut dyn Optimizer) -> f64;
}

/// Cuts the learning rate by `factor` once the monitored loss has failed to
/// improve by a relative `threshold` for more than `patience` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLrOnPlateau {
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub min_lr: f64,
    best: f64,
    bad_epochs: usize,
}

impl Default for ReduceLrOnPlateau {
    fn default() -> Self {
        Self::new(0.1, 4, 1e-3, 1e-5)
    }
}

impl ReduceLrOnPlateau {
    #[must_use]
    pub fn new(factor: f64, patience: usize, threshold: f64, min_lr: f64) -> Self {
        Self { factor, patience, threshold, min_lr, best: f64::INFINITY, bad_epochs: 0 }
    }

    #[must_use]
    pub fn best(&self) -> f64 {
        self.best
    }

    fn is_improvement(&self, metric: f64) -> bool {
        metric < self.best * (1.0 - self.threshold)
    }
}

impl LrScheduler for ReduceLrOnPlateau {
    fn step(&mut self, metric: f64, optimizer: &mut dyn Optimizer) -> f64 {
        if self.is_improvement(metric) {
            self.best = metric;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        let lr = optimizer.learning_rate();
        if self.bad_epochs > self.patience {
            self.bad_epochs = 0;
            let reduced = (lr * self.factor).max(self.min_lr);
            if lr - reduced > 1e-8 {
                info!(from = lr, to = reduced, "Reducing learning rate");
                optimizer.set_learning_rate(reduced);
                return reduced;
            }
        }
        lr
    }
}
