//! Seeded sampling helpers: stratified draws, shuffles and k-fold splits
//!
//! Stratification never fails. When it is infeasible the helpers return
//! [`Sample::Random`] so callers can see which branch was taken.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{Result, RunnerError};

use super::CvSplit;

/// Outcome of a draw, tagged with how it was produced
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Stratified(Vec<usize>),
    Random(Vec<usize>),
}

impl Sample {
    pub fn into_positions(self) -> Vec<usize> {
        match self {
            Sample::Stratified(p) | Sample::Random(p) => p,
        }
    }

    pub fn is_stratified(&self) -> bool {
        matches!(self, Sample::Stratified(_))
    }
}

pub fn rng_for(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Group positions by label, in a deterministic class order
fn group_by_label(labels: &[f64]) -> BTreeMap<u64, Vec<usize>> {
    let mut groups: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (pos, &label) in labels.iter().enumerate() {
        // -0.0 and 0.0 are the same class
        let key = if label == 0.0 { 0.0f64.to_bits() } else { label.to_bits() };
        groups.entry(key).or_default().push(pos);
    }
    groups
}

/// Draw `n_take` of `labels.len()` positions, stratified when possible
///
/// Stratification needs at least two members per class and room for every
/// class on both sides of the draw, mirroring a stratified shuffle split.
pub fn draw(labels: Option<&[f64]>, n: usize, n_take: usize, rng: &mut ChaCha8Rng) -> Sample {
    let n_take = n_take.min(n);
    if let Some(labels) = labels {
        if let Some(positions) = stratified_draw(labels, n_take, rng) {
            return Sample::Stratified(positions);
        }
    }
    let mut all: Vec<usize> = (0..n).collect();
    all.shuffle(rng);
    all.truncate(n_take);
    Sample::Random(all)
}

fn stratified_draw(labels: &[f64], n_take: usize, rng: &mut ChaCha8Rng) -> Option<Vec<usize>> {
    let n = labels.len();
    let groups = group_by_label(labels);
    let n_classes = groups.len();
    if n_classes < 2 || groups.values().any(|g| g.len() < 2) {
        return None;
    }
    if n_take < n_classes || n - n_take < n_classes {
        return None;
    }

    // Largest remainder allocation keeps the total exact.
    let mut alloc: Vec<(usize, f64)> = groups
        .values()
        .map(|g| {
            let share = n_take as f64 * g.len() as f64 / n as f64;
            (share.floor() as usize, share - share.floor())
        })
        .collect();
    let mut assigned: usize = alloc.iter().map(|(a, _)| a).sum();
    let mut order: Vec<usize> = (0..alloc.len()).collect();
    order.sort_by(|&a, &b| {
        alloc[b]
            .1
            .partial_cmp(&alloc[a].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let sizes: Vec<usize> = groups.values().map(Vec::len).collect();
    let mut cursor = 0;
    while assigned < n_take && cursor < order.len() * 2 {
        let class = order[cursor % order.len()];
        if alloc[class].0 < sizes[class] {
            alloc[class].0 += 1;
            assigned += 1;
        }
        cursor += 1;
    }

    let mut picked = Vec::with_capacity(n_take);
    for (members, (count, _)) in groups.values().zip(alloc.iter()) {
        let mut members = members.clone();
        members.shuffle(rng);
        picked.extend_from_slice(&members[..*count]);
    }
    picked.shuffle(rng);
    Some(picked)
}

/// A full permutation whose every prefix is approximately stratified
///
/// Each member gets the key `(rank_within_class + u) / class_size` with `u`
/// uniform in `[0, 1)`, and the permutation sorts by key. Any prefix of
/// length `m` then holds each class within one sample of its share.
pub fn stratified_permutation(labels: Option<&[f64]>, n: usize, rng: &mut ChaCha8Rng) -> Sample {
    let groups = match labels {
        Some(labels) => group_by_label(labels),
        None => BTreeMap::new(),
    };
    if groups.len() < 2 {
        let mut all: Vec<usize> = (0..n).collect();
        all.shuffle(rng);
        return Sample::Random(all);
    }
    let mut keyed: Vec<(f64, usize)> = Vec::with_capacity(n);
    for members in groups.values() {
        let mut members = members.clone();
        members.shuffle(rng);
        let size = members.len() as f64;
        for (rank, pos) in members.into_iter().enumerate() {
            let u: f64 = rng.gen();
            keyed.push(((rank as f64 + u) / size, pos));
        }
    }
    keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    Sample::Stratified(keyed.into_iter().map(|(_, p)| p).collect())
}

/// Shuffled k-fold over `ids`
pub fn k_fold(ids: &[usize], n_splits: usize, seed: u64) -> Result<Vec<CvSplit>> {
    if n_splits < 2 {
        return Err(RunnerError::invalid_option(
            "n_cross_validations",
            n_splits,
            "must be at least 2",
        ));
    }
    let n_samples = ids.len();
    if n_samples < n_splits {
        return Err(RunnerError::DataError(format!(
            "n_samples ({}) must be >= n_splits ({})",
            n_samples, n_splits
        )));
    }

    let mut order: Vec<usize> = ids.to_vec();
    order.shuffle(&mut rng_for(seed));

    let mut splits = Vec::with_capacity(n_splits);
    let mut current = 0;
    for fold in 0..n_splits {
        let base = n_samples / n_splits;
        let size = if fold < n_samples % n_splits { base + 1 } else { base };
        let test = order[current..current + size].to_vec();
        let train = order[..current]
            .iter()
            .chain(order[current + size..].iter())
            .copied()
            .collect();
        splits.push(CvSplit { train, test });
        current += size;
    }
    Ok(splits)
}

/// Stratified k-fold: members of each class are dealt round-robin to folds
pub fn stratified_k_fold(ids: &[usize], labels: &[f64], n_splits: usize, seed: u64) -> Result<Vec<CvSplit>> {
    if n_splits < 2 {
        return Err(RunnerError::invalid_option(
            "n_cross_validations",
            n_splits,
            "must be at least 2",
        ));
    }
    if ids.len() != labels.len() {
        return Err(RunnerError::ShapeError {
            expected: format!("{} labels", ids.len()),
            actual: format!("{} labels", labels.len()),
        });
    }
    let mut rng = rng_for(seed);
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); n_splits];
    let mut dealt = 0;
    for members in group_by_label(labels).into_values() {
        let mut members = members;
        members.shuffle(&mut rng);
        for pos in members {
            folds[dealt % n_splits].push(ids[pos]);
            dealt += 1;
        }
    }
    if folds.iter().any(Vec::is_empty) {
        return Err(RunnerError::DataError(format!(
            "cannot build {} folds from {} samples",
            n_splits,
            ids.len()
        )));
    }
    Ok((0..n_splits)
        .map(|k| CvSplit {
            test: folds[k].clone(),
            train: folds
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != k)
                .flat_map(|(_, f)| f.iter().copied())
                .collect(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n0: usize, n1: usize) -> Vec<f64> {
        let mut l = vec![0.0; n0];
        l.extend(vec![1.0; n1]);
        l
    }

    #[test]
    fn test_stratified_draw_preserves_proportions() {
        let l = labels(60, 40);
        let sample = draw(Some(&l), 100, 25, &mut rng_for(3));
        assert!(sample.is_stratified());
        let picked = sample.into_positions();
        assert_eq!(picked.len(), 25);
        let ones = picked.iter().filter(|&&p| l[p] == 1.0).count();
        assert!((ones as i64 - 10).abs() <= 1, "ones = {}", ones);
    }

    #[test]
    fn test_singleton_class_falls_back_to_random() {
        let mut l = labels(20, 0);
        l.push(7.0);
        let sample = draw(Some(&l), 21, 10, &mut rng_for(1));
        assert!(!sample.is_stratified());
        assert_eq!(sample.into_positions().len(), 10);
    }

    #[test]
    fn test_permutation_prefixes_are_stratified() {
        let l = labels(700, 300);
        let perm = stratified_permutation(Some(&l), 1000, &mut rng_for(7)).into_positions();
        let mut sorted = perm.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..1000).collect::<Vec<_>>());
        for m in [100, 250, 500] {
            let ones = perm[..m].iter().filter(|&&p| l[p] == 1.0).count() as f64;
            let expected = m as f64 * 0.3;
            assert!((ones - expected).abs() <= 2.0, "prefix {} has {} ones", m, ones);
        }
    }

    #[test]
    fn test_k_fold_partitions_ids() {
        let ids: Vec<usize> = (10..20).collect();
        let splits = k_fold(&ids, 3, 0).unwrap();
        assert_eq!(splits.len(), 3);
        let mut tests: Vec<usize> = splits.iter().flat_map(|s| s.test.clone()).collect();
        tests.sort_unstable();
        assert_eq!(tests, ids);
        for s in &splits {
            assert_eq!(s.train.len() + s.test.len(), 10);
        }
    }

    #[test]
    fn test_stratified_k_fold_spreads_classes() {
        let ids: Vec<usize> = (0..20).collect();
        let l = labels(10, 10);
        let splits = stratified_k_fold(&ids, &l, 5, 1).unwrap();
        for s in &splits {
            let ones = s.test.iter().filter(|&&i| l[i] == 1.0).count();
            assert_eq!(ones, 2);
        }
    }
}
