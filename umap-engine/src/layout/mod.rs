pub mod optimize_layout_euclidean;
pub mod optimize_layout_generic;

use ndarray::Array1;
use ndarray::ArrayView1;
use serde::Deserialize;
use serde::Serialize;

/// Per-edge sampling schedule, advanced in place by every epoch.
///
/// An edge fires in epoch `n` when `epoch_of_next_sample <= n`, and then draws
/// as many negative samples as its negative schedule has fallen behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSchedule {
  pub epochs_per_sample: Array1<f64>,
  pub epochs_per_negative_sample: Array1<f64>,
  pub epoch_of_next_sample: Array1<f64>,
  pub epoch_of_next_negative_sample: Array1<f64>,
}

impl EdgeSchedule {
  pub fn new(epochs_per_sample: Array1<f64>, negative_sample_rate: f64) -> Self {
    let epochs_per_negative_sample = epochs_per_sample.mapv(|eps| eps / negative_sample_rate);
    Self {
      epoch_of_next_sample: epochs_per_sample.clone(),
      epoch_of_next_negative_sample: epochs_per_negative_sample.clone(),
      epochs_per_negative_sample,
      epochs_per_sample,
    }
  }

  pub fn len(&self) -> usize {
    self.epochs_per_sample.len()
  }

  pub fn is_empty(&self) -> bool {
    self.epochs_per_sample.is_empty()
  }
}

/// Inputs shared by every edge of one epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochParams {
  pub a: f32,
  pub b: f32,
  pub gamma: f32,
  pub alpha: f32,
  pub epoch: usize,
  /// Seeds this epoch's generators.
  pub seed: u64,
  pub parallel: bool,
}

/// Edge list of the graph being optimized: `head[i] -> tail[i]`.
#[derive(Debug, Clone, Copy)]
pub struct Edges<'a> {
  pub head: ArrayView1<'a, u32>,
  pub tail: ArrayView1<'a, u32>,
}

/// Attractive gradient coefficient on the squared distance.
#[inline(always)]
pub(crate) fn attractive_coeff(dist_squared: f32, a: f32, b: f32) -> f32 {
  if dist_squared > 0.0 {
    let dist_pow_b = f32::powf(dist_squared, b);
    let gc = -2.0 * a * b * dist_pow_b / dist_squared;
    gc / (a * dist_pow_b + 1.0)
  } else {
    0.0
  }
}

/// Repulsive gradient coefficient on the squared distance.
#[inline(always)]
pub(crate) fn repulsive_coeff(dist_squared: f32, a: f32, b: f32, gamma: f32) -> f32 {
  if dist_squared > 0.0 {
    let dist_pow_b = f32::powf(dist_squared, b);
    2.0 * gamma * b / ((0.001 + dist_squared) * (a * dist_pow_b + 1.0))
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  #[test]
  fn schedule_starts_one_period_in() {
    let schedule = EdgeSchedule::new(array![1.0, 2.0], 5.0);
    assert_eq!(schedule.epoch_of_next_sample.to_vec(), vec![1.0, 2.0]);
    assert_eq!(schedule.epochs_per_negative_sample.to_vec(), vec![0.2, 0.4]);
    assert_eq!(schedule.epoch_of_next_negative_sample.to_vec(), vec![0.2, 0.4]);
  }

  #[test]
  fn gradients_attract_and_repel() {
    assert!(attractive_coeff(1.0, 1.577, 0.895) < 0.0);
    assert!(repulsive_coeff(1.0, 1.577, 0.895, 1.0) > 0.0);
    assert_eq!(attractive_coeff(0.0, 1.0, 1.0), 0.0);
    assert_eq!(repulsive_coeff(0.0, 1.0, 1.0, 1.0), 0.0);
  }
}
