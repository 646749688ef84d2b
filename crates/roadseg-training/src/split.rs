//! Seeded, site-stratified train/validation partition.

use crate::error::{TrainingError, TrainingResult};
use crate::selector::SelectedSample;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use tracing::debug;

/// Indices of a partition, each side in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub valid: Vec<usize>,
}

/// Partitions `0..labels.len()` so every label is represented on both sides
/// in proportion to its size.
///
/// The result depends only on `labels`, `test_fraction` and `seed`.
pub fn stratified_split(
    labels: &[usize],
    test_fraction: f64,
    seed: u64,
) -> TrainingResult<SplitIndices> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(TrainingError::Configuration(format!(
            "test fraction must be in (0, 1), got {test_fraction}"
        )));
    }

    let mut strata: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, &label) in labels.iter().enumerate() {
        strata.entry(label).or_default().push(idx);
    }
    if let Some((label, members)) = strata.iter().find(|(_, m)| m.len() < 2) {
        return Err(TrainingError::InsufficientSamples(format!(
            "site {label} has {} sample(s); a stratified split needs at least 2",
            members.len()
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut split = SplitIndices { train: Vec::new(), valid: Vec::new() };
    for members in strata.values_mut() {
        members.shuffle(&mut rng);
        let n = members.len();
        let n_valid = ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1);
        split.valid.extend_from_slice(&members[..n_valid]);
        split.train.extend_from_slice(&members[n_valid..]);
    }
    split.train.sort_unstable();
    split.valid.sort_unstable();

    debug!(train = split.train.len(), valid = split.valid.len(), seed, "Built stratified split");
    Ok(split)
}

/// Splits selected samples into `(train, valid)` stratified by site.
pub fn split_samples(
    samples: &[SelectedSample],
    test_fraction: f64,
    seed: u64,
) -> TrainingResult<(Vec<SelectedSample>, Vec<SelectedSample>)> {
    let labels: Vec<usize> = samples.iter().map(|s| s.site_id).collect();
    let indices = stratified_split(&labels, test_fraction, seed)?;
    let pick = |idx: &[usize]| idx.iter().map(|&i| samples[i].clone()).collect::<Vec<_>>();
    Ok((pick(&indices.train), pick(&indices.valid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> Vec<usize> {
        let mut labels = vec![0; 12];
        labels.extend(vec![1; 8]);
        labels.extend(vec![2; 4]);
        labels
    }

    #[test]
    fn test_same_seed_same_split() {
        let a = stratified_split(&labels(), 0.25, 42).unwrap();
        let b = stratified_split(&labels(), 0.25, 42).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_split_is_a_stratified_partition() {
        let labels = labels();
        let split = stratified_split(&labels, 0.25, 7).unwrap();
        let mut all: Vec<usize> = split.train.iter().chain(&split.valid).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..labels.len()).collect::<Vec<_>>());

        let count = |idx: &[usize], label| idx.iter().filter(|&&i| labels[i] == label).count();
        assert_eq!(count(&split.valid, 0), 3);
        assert_eq!(count(&split.valid, 1), 2);
        assert_eq!(count(&split.valid, 2), 1);
    }

    #[test]
    fn test_different_seeds_usually_differ() {
        let a = stratified_split(&labels(), 0.25, 1).unwrap();
        let b = stratified_split(&labels(), 0.25, 2).unwrap();
        let c = stratified_split(&labels(), 0.25, 3).unwrap();
        assert!(a != b || b != c);
    }

    #[test]
    fn test_singleton_stratum_is_rejected() {
        let err = stratified_split(&[0, 0, 1], 0.5, 1).unwrap_err();
        assert!(matches!(err, TrainingError::InsufficientSamples(_)));
    }

    #[test]
    fn test_fraction_out_of_range() {
        assert!(matches!(
            stratified_split(&[0, 0], 1.0, 1),
            Err(TrainingError::Configuration(_))
        ));
    }
}
