//! Softmax normalization and categorical sampling over a restricted support.

use ndarray::{Array1, ArrayView1};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Error, Result};

/// Convert raw scores into a categorical distribution.
///
/// Fails if any score is not finite.
pub fn normalize(scores: ArrayView1<'_, f32>) -> Result<Array1<f32>> {
    if let Some((class, value)) = scores.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(Error::ModelContractViolation(format!(
            "non-finite score {value} for class {class}"
        )));
    }
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs = scores.mapv(|v| (v - max).exp());
    let sum = probs.sum();
    probs /= sum;
    Ok(probs)
}

/// Draw one id from `support` using `distribution` as per-class weights.
///
/// Weights outside `support` are ignored; the remaining mass is renormalized
/// by the weighted draw itself.
pub fn sample<R: Rng + ?Sized>(
    distribution: ArrayView1<'_, f32>,
    support: &[usize],
    rng: &mut R,
) -> Result<usize> {
    let weights = support
        .iter()
        .map(|&id| {
            distribution.get(id).copied().ok_or_else(|| {
                Error::ModelContractViolation(format!(
                    "distribution has {} classes, id {id} out of range",
                    distribution.len()
                ))
            })
        })
        .collect::<Result<Vec<f32>>>()?;
    let index = WeightedIndex::new(&weights).map_err(|err| {
        Error::ModelContractViolation(format!("cannot sample from generation alphabet: {err}"))
    })?;
    Ok(support[index.sample(rng)])
}
