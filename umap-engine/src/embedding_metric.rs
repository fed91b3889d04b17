use ndarray::Array1;
use ndarray::ArrayView1;
use std::fmt::Debug;

/// Metric type determines which optimization path to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MetricType {
  /// Euclidean-like metrics with fast squared distance.
  Euclidean,
  /// Generic metrics requiring gradient computation.
  Generic,
}

/// A distance metric for the low-dimensional embedding space.
///
/// Unlike [`crate::Metric`], which only compares input rows, an embedding
/// metric also provides its gradient so the layout optimizer can move points.
/// Thread-safety (Send + Sync) is required for parallel optimization.
pub trait EmbeddingMetric: Debug + Send + Sync {
  /// Returns the type of this metric for optimization path selection.
  fn metric_type(&self) -> MetricType {
    MetricType::Generic
  }

  /// Compute the distance between two points and its gradient.
  ///
  /// Returns `(distance, gradient)` where `gradient` is ∂distance/∂a.
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> (f32, Array1<f32>);
}

/// Euclidean (L2) distance in the embedding space.
///
/// Selects the specialized squared-distance layout path.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanEmbedding;

impl EmbeddingMetric for EuclideanEmbedding {
  fn metric_type(&self) -> MetricType {
    MetricType::Euclidean
  }

  /// Returns (distance, gradient) where gradient = (x - y) / (distance + ε).
  fn distance(&self, x: ArrayView1<f32>, y: ArrayView1<f32>) -> (f32, Array1<f32>) {
    let dist = rdist(&x, &y).sqrt();
    let denom = dist + 1e-6;
    let grad = x
      .iter()
      .zip(y.iter())
      .map(|(a, b)| (a - b) / denom)
      .collect();
    (dist, grad)
  }
}

/// L1 distance in the embedding space, with a subgradient.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManhattanEmbedding;

impl EmbeddingMetric for ManhattanEmbedding {
  fn distance(&self, x: ArrayView1<f32>, y: ArrayView1<f32>) -> (f32, Array1<f32>) {
    let dist = x.iter().zip(y.iter()).map(|(a, b)| (a - b).abs()).sum();
    let grad = x
      .iter()
      .zip(y.iter())
      .map(|(a, b)| {
        let diff = a - b;
        // signum(0.0) is 1.0; tied coordinates get no push.
        if diff == 0.0 { 0.0 } else { diff.signum() }
      })
      .collect();
    (dist, grad)
  }
}

/// Squared Euclidean distance (rdist), avoids the sqrt.
#[inline(always)]
pub fn rdist(x: &ArrayView1<f32>, y: &ArrayView1<f32>) -> f32 {
  x.iter()
    .zip(y.iter())
    .map(|(a, b)| {
      let diff = a - b;
      diff * diff
    })
    .sum()
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use ndarray::array;

  #[test]
  fn euclidean_gradient_points_away_from_other() {
    let a = array![3.0f32, 0.0];
    let b = array![0.0f32, 4.0];
    let (d, grad) = EuclideanEmbedding.distance(a.view(), b.view());
    assert_relative_eq!(d, 5.0);
    assert_relative_eq!(grad[0], 0.6, epsilon = 1e-5);
    assert_relative_eq!(grad[1], -0.8, epsilon = 1e-5);
    assert_eq!(EuclideanEmbedding.metric_type(), MetricType::Euclidean);
    assert_eq!(ManhattanEmbedding.metric_type(), MetricType::Generic);
  }

  #[test]
  fn manhattan_gradient_is_zero_on_tied_coordinates() {
    let a = array![1.0f32, 2.0, -1.0];
    let b = array![1.0f32, 0.0, 3.0];
    let (d, grad) = ManhattanEmbedding.distance(a.view(), b.view());
    assert_relative_eq!(d, 6.0);
    assert_eq!(grad.to_vec(), vec![0.0, 1.0, -1.0]);
  }
}
