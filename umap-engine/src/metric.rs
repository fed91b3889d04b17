use crate::error::Result;
use crate::error::UmapError;
use ndarray::ArrayView1;
use std::fmt::Debug;
use std::sync::Arc;

/// A distance function over the input (high-dimensional) space.
///
/// Used to build the k-nearest neighbor graph. Implementations must be pure
/// and thread-safe: distances are evaluated concurrently from worker threads.
pub trait Metric: Debug + Send + Sync {
  /// Distance between two equal-length vectors. Must be non-negative and symmetric.
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32;

  /// Whether random projection trees should split with cosine-style hyperplanes.
  fn is_angular(&self) -> bool {
    false
  }

  /// Whether the instance matrix rows already are distances.
  ///
  /// A precomputed metric is never evaluated; the k-NN graph is read straight
  /// from the input matrix and the fitted model can't transform new points.
  fn is_precomputed(&self) -> bool {
    false
  }

  /// Distance beyond which two points are treated as unrelated.
  fn disconnection_threshold(&self) -> f32 {
    f32::INFINITY
  }

  fn name(&self) -> &'static str;
}

/// Look up a built-in metric by name.
///
/// Accepts the usual aliases (`l2`, `l1`, `taxicab`, `linfinity`, ...).
/// `minkowski` uses p = 2; build [`Minkowski`] directly for other exponents.
pub fn metric_by_name(name: &str) -> Result<Arc<dyn Metric>> {
  let metric: Arc<dyn Metric> = match name.to_ascii_lowercase().as_str() {
    "euclidean" | "l2" => Arc::new(Euclidean),
    "reduced_euclidean" | "sqeuclidean" => Arc::new(ReducedEuclidean),
    "cosine" => Arc::new(Cosine),
    "correlation" => Arc::new(Correlation),
    "manhattan" | "taxicab" | "l1" => Arc::new(Manhattan),
    "chebyshev" | "linfinity" | "linfty" | "linf" => Arc::new(Chebyshev),
    "minkowski" => Arc::new(Minkowski { p: 2.0 }),
    "canberra" => Arc::new(Canberra),
    "braycurtis" => Arc::new(BrayCurtis),
    "hamming" => Arc::new(Hamming),
    "jaccard" => Arc::new(Jaccard),
    "categorical" => Arc::new(Categorical::default()),
    "precomputed" => Arc::new(Precomputed),
    _ => return Err(UmapError::UnknownMetric(name.to_string())),
  };
  Ok(metric)
}

#[inline]
fn squared_euclidean(a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> f32 {
  a.iter()
    .zip(b.iter())
    .map(|(x, y)| {
      let diff = x - y;
      diff * diff
    })
    .sum()
}

/// Standard L2 distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Euclidean;

impl Metric for Euclidean {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    squared_euclidean(&a, &b).sqrt()
  }

  fn name(&self) -> &'static str {
    "euclidean"
  }
}

/// Squared L2 distance. Preserves neighbor order while skipping the sqrt.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReducedEuclidean;

impl Metric for ReducedEuclidean {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    squared_euclidean(&a, &b)
  }

  fn name(&self) -> &'static str {
    "reduced_euclidean"
  }
}

/// `1 - cos(a, b)`. Two zero vectors are identical; one zero vector is maximally far.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cosine;

impl Metric for Cosine {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (&x, &y) in a.iter().zip(b.iter()) {
      dot += x * y;
      norm_a += x * x;
      norm_b += y * y;
    }
    if norm_a == 0.0 && norm_b == 0.0 {
      0.0
    } else if norm_a == 0.0 || norm_b == 0.0 {
      1.0
    } else {
      (1.0 - dot / (norm_a * norm_b).sqrt()).max(0.0)
    }
  }

  fn is_angular(&self) -> bool {
    true
  }

  fn name(&self) -> &'static str {
    "cosine"
  }
}

/// Cosine distance between mean-centered vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct Correlation;

impl Metric for Correlation {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let n = a.len().max(1) as f32;
    let mu_a = a.sum() / n;
    let mu_b = b.sum() / n;
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (&x, &y) in a.iter().zip(b.iter()) {
      let sx = x - mu_a;
      let sy = y - mu_b;
      dot += sx * sy;
      norm_a += sx * sx;
      norm_b += sy * sy;
    }
    if norm_a == 0.0 && norm_b == 0.0 {
      0.0
    } else if dot == 0.0 {
      1.0
    } else {
      (1.0 - dot / (norm_a * norm_b).sqrt()).max(0.0)
    }
  }

  fn is_angular(&self) -> bool {
    true
  }

  fn name(&self) -> &'static str {
    "correlation"
  }
}

/// L1 distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Manhattan;

impl Metric for Manhattan {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum()
  }

  fn name(&self) -> &'static str {
    "manhattan"
  }
}

/// L-infinity distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Chebyshev;

impl Metric for Chebyshev {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
      .zip(b.iter())
      .map(|(x, y)| (x - y).abs())
      .fold(0.0, f32::max)
  }

  fn name(&self) -> &'static str {
    "chebyshev"
  }
}

/// Lp distance for an arbitrary exponent `p >= 1`.
#[derive(Debug, Clone, Copy)]
pub struct Minkowski {
  pub p: f32,
}

impl Metric for Minkowski {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let sum: f32 = a
      .iter()
      .zip(b.iter())
      .map(|(x, y)| (x - y).abs().powf(self.p))
      .sum();
    sum.powf(1.0 / self.p)
  }

  fn name(&self) -> &'static str {
    "minkowski"
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Canberra;

impl Metric for Canberra {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    a.iter()
      .zip(b.iter())
      .map(|(x, y)| {
        let denom = x.abs() + y.abs();
        if denom > 0.0 { (x - y).abs() / denom } else { 0.0 }
      })
      .sum()
  }

  fn name(&self) -> &'static str {
    "canberra"
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BrayCurtis;

impl Metric for BrayCurtis {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let mut numerator = 0.0f32;
    let mut denominator = 0.0f32;
    for (&x, &y) in a.iter().zip(b.iter()) {
      numerator += (x - y).abs();
      denominator += (x + y).abs();
    }
    if denominator > 0.0 {
      numerator / denominator
    } else {
      0.0
    }
  }

  fn name(&self) -> &'static str {
    "braycurtis"
  }
}

/// Fraction of coordinates that differ.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hamming;

impl Metric for Hamming {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    if a.is_empty() {
      return 0.0;
    }
    let mismatches = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
    mismatches as f32 / a.len() as f32
  }

  fn name(&self) -> &'static str {
    "hamming"
  }
}

/// Jaccard distance over the non-zero coordinates of each vector.
#[derive(Debug, Clone, Copy, Default)]
pub struct Jaccard;

impl Metric for Jaccard {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let mut num_non_zero = 0usize;
    let mut num_equal = 0usize;
    for (&x, &y) in a.iter().zip(b.iter()) {
      let x_true = x != 0.0;
      let y_true = y != 0.0;
      if x_true || y_true {
        num_non_zero += 1;
      }
      if x_true && y_true {
        num_equal += 1;
      }
    }
    if num_non_zero == 0 {
      0.0
    } else {
      (num_non_zero - num_equal) as f32 / num_non_zero as f32
    }
  }

  fn name(&self) -> &'static str {
    "jaccard"
  }
}

/// Label mismatch: the fraction of coordinates that differ by at least `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct Categorical {
  pub threshold: f32,
}

impl Default for Categorical {
  fn default() -> Self {
    Self { threshold: 0.5 }
  }
}

impl Metric for Categorical {
  fn distance(&self, a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    if a.is_empty() {
      return 0.0;
    }
    let mismatches = a
      .iter()
      .zip(b.iter())
      .filter(|&(x, y)| (x - y).abs() >= self.threshold)
      .count();
    mismatches as f32 / a.len() as f32
  }

  fn name(&self) -> &'static str {
    "categorical"
  }
}

/// Marker metric: the input matrix is a square matrix of pairwise distances.
#[derive(Debug, Clone, Copy, Default)]
pub struct Precomputed;

impl Metric for Precomputed {
  /// Never called by the pipeline; kept total so the trait stays object safe.
  fn distance(&self, _a: ArrayView1<f32>, _b: ArrayView1<f32>) -> f32 {
    0.0
  }

  fn is_precomputed(&self) -> bool {
    true
  }

  fn name(&self) -> &'static str {
    "precomputed"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use ndarray::array;

  #[test]
  fn factory_resolves_aliases() {
    assert_eq!(metric_by_name("l2").unwrap().name(), "euclidean");
    assert_eq!(metric_by_name("TAXICAB").unwrap().name(), "manhattan");
    assert!(metric_by_name("cosine").unwrap().is_angular());
    assert!(metric_by_name("precomputed").unwrap().is_precomputed());
    assert_eq!(
      metric_by_name("wasserstein").unwrap_err(),
      UmapError::UnknownMetric("wasserstein".into())
    );
  }

  #[test]
  fn basic_distances() {
    let a = array![0.0f32, 3.0, 1.0];
    let b = array![4.0f32, 0.0, 1.0];
    assert_relative_eq!(Euclidean.distance(a.view(), b.view()), 5.0);
    assert_relative_eq!(ReducedEuclidean.distance(a.view(), b.view()), 25.0);
    assert_relative_eq!(Manhattan.distance(a.view(), b.view()), 7.0);
    assert_relative_eq!(Chebyshev.distance(a.view(), b.view()), 4.0);
    assert_relative_eq!(
      Minkowski { p: 2.0 }.distance(a.view(), b.view()),
      5.0,
      epsilon = 1e-5
    );
    assert_relative_eq!(Hamming.distance(a.view(), b.view()), 2.0 / 3.0);
  }

  #[test]
  fn cosine_handles_zero_vectors() {
    let zero = array![0.0f32, 0.0];
    let x = array![1.0f32, 0.0];
    let y = array![0.0f32, 2.0];
    assert_eq!(Cosine.distance(zero.view(), zero.view()), 0.0);
    assert_eq!(Cosine.distance(zero.view(), x.view()), 1.0);
    assert_relative_eq!(Cosine.distance(x.view(), y.view()), 1.0);
    assert_relative_eq!(Cosine.distance(x.view(), x.view()), 0.0);
  }

  #[test]
  fn categorical_uses_threshold() {
    let a = array![1.0f32];
    let b = array![1.2f32];
    assert_eq!(Categorical::default().distance(a.view(), b.view()), 0.0);
    assert_eq!(
      Categorical { threshold: 0.1 }.distance(a.view(), b.view()),
      1.0
    );
  }

  #[test]
  fn categorical_counts_mismatching_fraction() {
    let a = array![0.0f32, 1.0, 2.0, 3.0];
    let b = array![0.0f32, 1.0, 5.0, 7.0];
    assert_relative_eq!(Categorical::default().distance(a.view(), b.view()), 0.5);
    assert_eq!(Categorical::default().distance(a.view(), a.view()), 0.0);
  }
}
