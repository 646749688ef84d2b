//! Segmentation losses and overlap (Dice) scores.
//!
//! All functions take `(N, ...)` batches and treat each sample as one flat
//! vector. Losses return their value together with `dLoss/dOutput` so the
//! model can run its backward pass.

use crate::error::{TrainingError, TrainingResult};
use ndarray::{Array4, ArrayView1, Zip};
use roadseg_abstraction::OutputKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Laplace smoothing of the soft overlap score. Fixed at 1.
const SMOOTH: f32 = 1.0;

/// Floor for the log-overlap term.
pub const LOG_EPS: f32 = 1e-15;

/// Lower bound of `ln` inside binary cross-entropy on probabilities.
const LOG_FLOOR: f32 = -100.0;

fn check_shapes(pred: &Array4<f32>, target: &Array4<f32>) -> TrainingResult<()> {
    let (pn, ..) = pred.dim();
    let (tn, ..) = target.dim();
    if pn != tn {
        return Err(TrainingError::ShapeMismatch(format!(
            "prediction batch has {pn} samples, target batch has {tn}"
        )));
    }
    if pred.len() != target.len() {
        return Err(TrainingError::ShapeMismatch(format!(
            "prediction {:?} and target {:?} differ in size",
            pred.dim(),
            target.dim()
        )));
    }
    Ok(())
}

/// One view per sample, empty when the batch has no pixels.
fn flat(a: &Array4<f32>) -> Vec<ArrayView1<'_, f32>> {
    let n = a.dim().0;
    let per_sample = a.len() / n.max(1);
    a.as_slice()
        .map(|s| {
            (0..n).map(|i| ArrayView1::from(&s[i * per_sample..(i + 1) * per_sample])).collect()
        })
        .unwrap_or_default()
}

/// Per-sample sums `(Σ p·t·w², Σ p·w, Σ t·w)`.
fn overlap_terms(p: ArrayView1<f32>, t: ArrayView1<f32>, w: Option<ArrayView1<f32>>) -> (f32, f32, f32) {
    let mut inter = 0.0;
    let mut sp = 0.0;
    let mut st = 0.0;
    for i in 0..p.len() {
        let wi = w.map_or(1.0, |w| w[i]);
        inter += p[i] * t[i] * wi * wi;
        sp += p[i] * wi;
        st += t[i] * wi;
    }
    (inter, sp, st)
}

fn standard(a: &Array4<f32>) -> Array4<f32> {
    a.as_standard_layout().into_owned()
}

/// Soft overlap score, averaged over the batch and clamped to `[0, 1]`.
///
/// `2 (Σ p·t·w² + 1) / (Σ p·w + Σ t·w + 1)` per sample.
pub fn overlap(
    pred: &Array4<f32>,
    target: &Array4<f32>,
    weight: Option<&Array4<f32>>,
) -> TrainingResult<f32> {
    check_shapes(pred, target)?;
    if let Some(w) = weight {
        check_shapes(pred, w)?;
    }
    let n = pred.dim().0;
    if pred.is_empty() {
        return Ok(0.0);
    }
    let (pred, target) = (standard(pred), standard(target));
    let weight = weight.map(standard);
    let ps = flat(&pred);
    let ts = flat(&target);
    let ws = weight.as_ref().map(flat);

    let total: f32 = (0..n)
        .map(|s| {
            let (inter, sp, st) = overlap_terms(ps[s], ts[s], ws.as_ref().map(|w| w[s]));
            2.0 * (inter + SMOOTH) / (sp + st + SMOOTH)
        })
        .sum();
    Ok((total / n as f32).clamp(0.0, 1.0))
}

/// Overlap score of predictions rounded to `{0, 1}`. Reporting only.
pub fn overlap_thresholded(pred: &Array4<f32>, target: &Array4<f32>) -> TrainingResult<f32> {
    let rounded = pred.mapv(f32::round_ties_even);
    overlap(&rounded, target, None)
}

/// `d overlap / d pred` for unweighted inputs.
fn overlap_grad(pred: &Array4<f32>, target: &Array4<f32>) -> (f32, Array4<f32>) {
    let n = pred.dim().0;
    let ps = flat(pred);
    let ts = flat(target);
    let mut grad = Array4::<f32>::zeros(pred.dim());
    let per_sample = pred.len() / n.max(1);
    let mut total = 0.0;

    if let Some(g) = grad.as_slice_mut() {
        for s in 0..n {
            let (inter, sp, st) = overlap_terms(ps[s], ts[s], None);
            let num = inter + SMOOTH;
            let den = sp + st + SMOOTH;
            total += 2.0 * num / den;
            let out = &mut g[s * per_sample..(s + 1) * per_sample];
            for (j, o) in out.iter_mut().enumerate() {
                *o = 2.0 * (ts[s][j] * den - num) / (den * den) / n as f32;
            }
        }
    }

    let mean = total / n as f32;
    // clamp passes gradient only inside its range
    if !(0.0..=1.0).contains(&mean) {
        grad.fill(0.0);
    }
    (mean.clamp(0.0, 1.0), grad)
}

/// Which training loss to optimise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LossKind {
    /// `BCEWithLogits(x, t) + w · (1 - overlap(σ(x), t))` on logits.
    BceDice { dice_weight: f32 },
    /// `BCE(p, t) + 1 - ln(2 Σ p·t / (Σ p + Σ t + eps))` on probabilities.
    LogDice,
}

impl LossKind {
    pub const NAMES: [&'static str; 2] = ["bce-dice", "log-dice"];

    /// The model output this loss consumes.
    #[must_use]
    pub fn output_kind(self) -> OutputKind {
        match self {
            Self::BceDice { .. } => OutputKind::Logits,
            Self::LogDice => OutputKind::Probabilities,
        }
    }

    /// Parses a loss name; `dice_weight` is used by `bce-dice`.
    pub fn parse(name: &str, dice_weight: f32) -> TrainingResult<Self> {
        match name {
            "bce-dice" => Ok(Self::BceDice { dice_weight }),
            "log-dice" => Ok(Self::LogDice),
            other => Err(TrainingError::Configuration(format!(
                "unknown loss '{other}' (known: {})",
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl FromStr for LossKind {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, 1.0)
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BceDice { .. } => f.write_str("bce-dice"),
            Self::LogDice => f.write_str("log-dice"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub value: f32,
    /// `dLoss/dOutput`, same shape as the output.
    pub grad: Array4<f32>,
}

/// Cross-entropy plus an overlap term, in one of two formulations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompositeLoss {
    kind: LossKind,
}

impl CompositeLoss {
    #[must_use]
    pub fn new(kind: LossKind) -> Self {
        Self { kind }
    }

    #[must_use]
    pub fn kind(&self) -> LossKind {
        self.kind
    }

    /// Maps raw model output to probabilities.
    #[must_use]
    pub fn probabilities(&self, output: &Array4<f32>) -> Array4<f32> {
        probabilities(output, self.kind.output_kind())
    }

    pub fn compute(&self, output: &Array4<f32>, target: &Array4<f32>) -> TrainingResult<LossOutput> {
        check_shapes(output, target)?;
        if output.is_empty() {
            return Err(TrainingError::ShapeMismatch("empty batch".to_string()));
        }
        let output = standard(output);
        let target = standard(target).into_shape_with_order(output.dim()).map_err(|e| {
            TrainingError::ShapeMismatch(format!("target cannot take output shape: {e}"))
        })?;
        match self.kind {
            LossKind::BceDice { dice_weight } => Ok(bce_dice(&output, &target, dice_weight)),
            LossKind::LogDice => Ok(log_dice(&output, &target)),
        }
    }
}

/// Applies a sigmoid when `kind` says the values are logits.
#[must_use]
pub fn probabilities(output: &Array4<f32>, kind: OutputKind) -> Array4<f32> {
    match kind {
        OutputKind::Logits => output.mapv(sigmoid),
        OutputKind::Probabilities => output.clone(),
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn bce_dice(logits: &Array4<f32>, target: &Array4<f32>, dice_weight: f32) -> LossOutput {
    let count = logits.len() as f32;
    let p = logits.mapv(sigmoid);

    let bce = Zip::from(logits)
        .and(target)
        .fold(0.0, |acc, &x, &t| acc + x.max(0.0) - x * t + (-x.abs()).exp().ln_1p())
        / count;
    let mut grad = Array4::<f32>::zeros(logits.dim());
    Zip::from(&mut grad).and(&p).and(target).for_each(|g, &p, &t| *g = (p - t) / count);

    let mut value = bce;
    if dice_weight != 0.0 {
        let (score, d_score) = overlap_grad(&p, target);
        value += dice_weight * (1.0 - score);
        Zip::from(&mut grad)
            .and(&d_score)
            .and(&p)
            .for_each(|g, &d, &p| *g -= dice_weight * d * p * (1.0 - p));
    }
    LossOutput { value, grad }
}

fn log_dice(probs: &Array4<f32>, target: &Array4<f32>) -> LossOutput {
    let count = probs.len() as f32;

    let mut bce = 0.0;
    let mut grad = Array4::<f32>::zeros(probs.dim());
    Zip::from(&mut grad).and(probs).and(target).for_each(|g, &p, &t| {
        let lp = p.ln();
        let lq = (1.0 - p).ln();
        bce -= t * lp.max(LOG_FLOOR) + (1.0 - t) * lq.max(LOG_FLOOR);
        let pos = if t > 0.0 && lp > LOG_FLOOR { -t / p } else { 0.0 };
        let neg = if t < 1.0 && lq > LOG_FLOOR { (1.0 - t) / (1.0 - p) } else { 0.0 };
        *g = (pos + neg) / count;
    });
    bce /= count;

    let hit = target.mapv(|t| if t == 1.0 { 1.0 } else { 0.0 });
    let inter = (probs * &hit).sum();
    let union = probs.sum() + hit.sum() + LOG_EPS;
    let ratio = 2.0 * inter / union;

    let value = if ratio > LOG_EPS {
        Zip::from(&mut grad).and(&hit).for_each(|g, &h| *g += 1.0 / union - h / inter);
        bce + 1.0 - ratio.ln()
    } else {
        bce + 1.0 - LOG_EPS.ln()
    };
    LossOutput { value, grad }
}
