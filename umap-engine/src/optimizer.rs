use crate::config::UmapConfig;
use crate::embedding_metric::EmbeddingMetric;
use crate::embedding_metric::MetricType;
use crate::layout::EdgeSchedule;
use crate::layout::Edges;
use crate::layout::EpochParams;
use crate::layout::optimize_layout_euclidean::optimize_layout_euclidean_single_epoch;
use crate::layout::optimize_layout_generic::optimize_layout_generic_single_epoch;
use crate::manifold::LearnedManifold;
use crate::sparse::SparseMat;
use crate::sparse::filter_values;
use crate::sparse::max_value;
use crate::umap::make_epochs_per_sample::make_epochs_per_sample;
use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView2;
use serde::Deserialize;
use serde::Serialize;

/// Active optimization state for UMAP embedding.
///
/// This contains all the state needed to run and resume stochastic gradient
/// descent optimization. It's large and mutable, meant to be used during
/// training and then converted into the embedding when done.
///
/// The optimizer can be serialized mid-training to enable fault-tolerant
/// training with checkpoints. Each epoch derives its generators from the seed
/// and the epoch number, so a restored optimizer continues exactly where the
/// original would have.
#[derive(Debug, Serialize, Deserialize)]
pub struct Optimizer {
  manifold: LearnedManifold,

  // Edge list of the filtered graph
  head: Array1<u32>,
  tail: Array1<u32>,

  schedule: EdgeSchedule,

  embedding: Array2<f32>,

  // Fixed embedding the heads are placed against; `None` while fitting
  reference: Option<Array2<f32>>,

  current_epoch: usize,
  total_epochs: usize,

  gamma: f32,
  initial_alpha: f32,
  seed: u64,
  parallel: bool,

  metric_type: MetricType,
}

impl Optimizer {
  /// Create an optimizer that embeds the manifold's own vertices.
  ///
  /// This performs preprocessing:
  /// - Filters weak edges from the graph
  /// - Extracts head/tail edge lists
  /// - Computes epoch sampling schedules
  /// - Normalizes the initial embedding to [0, 10]
  ///
  /// # Arguments
  ///
  /// * `manifold` - The learned manifold structure
  /// * `init` - Initial embedding (will be normalized)
  /// * `total_epochs` - Total number of epochs to run
  /// * `config` - Learning rate, negative sampling, repulsion and threading
  /// * `metric_type` - Which layout path the embedding metric takes
  /// * `seed` - Seed for negative sampling
  pub fn new(
    manifold: LearnedManifold,
    init: Array2<f32>,
    total_epochs: usize,
    config: &UmapConfig,
    metric_type: MetricType,
    seed: u64,
  ) -> Self {
    let embedding = rescale_columns(init);
    Self::build(
      manifold,
      embedding,
      None,
      total_epochs,
      config.optimization.learning_rate,
      config,
      metric_type,
      seed,
    )
  }

  /// Create an optimizer that places new points against a fixed embedding.
  ///
  /// `manifold.graph` is the (new points × training points) membership graph
  /// and `init` the starting coordinates of the new points, used as is. The
  /// reference embedding never moves, and the learning rate starts at a
  /// quarter of the configured one.
  pub fn with_reference(
    manifold: LearnedManifold,
    init: Array2<f32>,
    reference: Array2<f32>,
    total_epochs: usize,
    config: &UmapConfig,
    metric_type: MetricType,
    seed: u64,
  ) -> Self {
    Self::build(
      manifold,
      init,
      Some(reference),
      total_epochs,
      config.optimization.learning_rate / 4.0,
      config,
      metric_type,
      seed,
    )
  }

  #[allow(clippy::too_many_arguments)]
  fn build(
    manifold: LearnedManifold,
    embedding: Array2<f32>,
    reference: Option<Array2<f32>>,
    total_epochs: usize,
    initial_alpha: f32,
    config: &UmapConfig,
    metric_type: MetricType,
    seed: u64,
  ) -> Self {
    let graph = weak_edges_removed(&manifold.graph, total_epochs);
    let epochs_per_sample = make_epochs_per_sample(ndarray::aview1(graph.data()), total_epochs);

    let mut head = Vec::with_capacity(graph.nnz());
    let mut tail = Vec::with_capacity(graph.nnz());
    for (row_idx, row) in graph.outer_iterator().enumerate() {
      for &col_idx in row.indices() {
        head.push(row_idx as u32);
        tail.push(col_idx);
      }
    }

    let schedule = EdgeSchedule::new(
      epochs_per_sample,
      config.optimization.negative_sample_rate as f64,
    );

    Self {
      manifold,
      head: Array1::from(head),
      tail: Array1::from(tail),
      schedule,
      embedding,
      reference,
      current_epoch: 0,
      total_epochs,
      gamma: config.optimization.repulsion_strength,
      initial_alpha,
      seed,
      parallel: config.n_threads != Some(1),
      metric_type,
    }
  }

  /// Run n more epochs of stochastic gradient descent on the current rayon pool.
  ///
  /// # Panics
  ///
  /// Panics if this would exceed total_epochs. Check remaining_epochs() first.
  pub fn step_epochs(&mut self, n: usize, output_metric: &dyn EmbeddingMetric) {
    assert!(
      self.current_epoch + n <= self.total_epochs,
      "Cannot step {} epochs: would exceed total_epochs {} (current: {})",
      n,
      self.total_epochs,
      self.current_epoch
    );

    let start_epoch = self.current_epoch;
    let end_epoch = self.current_epoch + n;
    let (a, b) = self.manifold.curve_params();
    let edges = Edges {
      head: self.head.view(),
      tail: self.tail.view(),
    };

    for epoch in start_epoch..end_epoch {
      let params = EpochParams {
        a,
        b,
        gamma: self.gamma,
        alpha: self.initial_alpha * (1.0 - (epoch as f32 / self.total_epochs as f32)),
        epoch,
        seed: self.seed.wrapping_add(epoch as u64),
        parallel: self.parallel,
      };
      let reference = self.reference.as_ref().map(|r| r.view());

      match self.metric_type {
        MetricType::Euclidean => optimize_layout_euclidean_single_epoch(
          &mut self.embedding.view_mut(),
          reference,
          edges,
          &mut self.schedule,
          &params,
        ),
        MetricType::Generic => optimize_layout_generic_single_epoch(
          &mut self.embedding.view_mut(),
          reference,
          edges,
          &mut self.schedule,
          &params,
          output_metric,
        ),
      }
    }

    self.current_epoch = end_epoch;
  }

  /// Get the current epoch number.
  pub fn current_epoch(&self) -> usize {
    self.current_epoch
  }

  /// Get the total epochs this optimizer is configured for.
  pub fn total_epochs(&self) -> usize {
    self.total_epochs
  }

  /// Get the number of remaining epochs.
  pub fn remaining_epochs(&self) -> usize {
    self.total_epochs - self.current_epoch
  }

  /// Number of edges that survived filtering.
  pub fn n_edges(&self) -> usize {
    self.head.len()
  }

  /// Get a view of the current embedding.
  pub fn embedding(&self) -> ArrayView2<'_, f32> {
    self.embedding.view()
  }

  /// Get a reference to the learned manifold.
  pub fn manifold(&self) -> &LearnedManifold {
    &self.manifold
  }

  /// Consume the optimizer, dropping the scheduling state.
  pub fn into_parts(self) -> (LearnedManifold, Array2<f32>) {
    (self.manifold, self.embedding)
  }
}

/// Drop edges too weak to be sampled even once in `total_epochs`.
fn weak_edges_removed(graph: &SparseMat, total_epochs: usize) -> SparseMat {
  let Some(max_val) = max_value(graph) else {
    return graph.clone();
  };
  let threshold = max_val / total_epochs as f32;
  filter_values(graph, |v| v >= threshold)
}

/// Map every column linearly onto [0, 10]. Constant columns are left alone.
fn rescale_columns(mut embedding: Array2<f32>) -> Array2<f32> {
  for mut col in embedding.columns_mut() {
    let (min, max) = col
      .iter()
      .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if range > 0.0 {
      col.mapv_inplace(|v| 10.0 * (v - min) / range);
    }
  }
  embedding
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::embedding_metric::EuclideanEmbedding;
  use crate::sparse::CooMatrix;
  use approx::assert_relative_eq;
  use ndarray::array;

  fn ring_manifold(n: usize) -> LearnedManifold {
    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut vals = Vec::new();
    for i in 0..n {
      let j = (i + 1) % n;
      rows.extend([i as u32, j as u32]);
      cols.extend([j as u32, i as u32]);
      vals.extend([1.0, 1.0]);
    }
    // One edge too weak to survive filtering.
    rows.extend([0, 2]);
    cols.extend([2, 0]);
    vals.extend([1e-4, 1e-4]);
    LearnedManifold {
      graph: CooMatrix::from_triplets_with((n, n), rows, cols, vals, f32::max).to_csr(),
      sigmas: Array1::ones(n),
      rhos: Array1::zeros(n),
      n_vertices: n,
      a: 1.577,
      b: 0.895,
    }
  }

  fn init(n: usize) -> Array2<f32> {
    Array2::from_shape_fn((n, 2), |(i, d)| ((i * 7 + d * 3) % 11) as f32 - 5.0)
  }

  fn sequential_config() -> UmapConfig {
    UmapConfig {
      n_threads: Some(1),
      ..Default::default()
    }
  }

  #[test]
  fn new_filters_weak_edges_and_rescales() {
    let optimizer = Optimizer::new(
      ring_manifold(6),
      init(6),
      50,
      &sequential_config(),
      MetricType::Euclidean,
      1,
    );
    assert_eq!(optimizer.n_edges(), 12);
    for col in optimizer.embedding().columns() {
      let min = col.iter().copied().fold(f32::INFINITY, f32::min);
      let max = col.iter().copied().fold(f32::NEG_INFINITY, f32::max);
      assert_relative_eq!(min, 0.0);
      assert_relative_eq!(max, 10.0);
    }
  }

  #[test]
  fn stepping_in_pieces_matches_one_run() {
    let config = sequential_config();
    let mut whole = Optimizer::new(ring_manifold(8), init(8), 30, &config, MetricType::Euclidean, 9);
    whole.step_epochs(30, &EuclideanEmbedding);

    let mut pieces = Optimizer::new(ring_manifold(8), init(8), 30, &config, MetricType::Euclidean, 9);
    pieces.step_epochs(10, &EuclideanEmbedding);
    pieces.step_epochs(20, &EuclideanEmbedding);

    assert_eq!(whole.embedding(), pieces.embedding());
    assert_eq!(pieces.remaining_epochs(), 0);
  }

  #[test]
  fn checkpoint_resumes_identically() {
    let config = sequential_config();
    let mut original = Optimizer::new(ring_manifold(8), init(8), 40, &config, MetricType::Euclidean, 5);
    original.step_epochs(15, &EuclideanEmbedding);

    let bytes = bincode::serialize(&original).unwrap();
    let mut restored: Optimizer = bincode::deserialize(&bytes).unwrap();
    assert_eq!(restored.current_epoch(), 15);

    original.step_epochs(25, &EuclideanEmbedding);
    restored.step_epochs(25, &EuclideanEmbedding);
    assert_eq!(original.embedding(), restored.embedding());
  }

  #[test]
  #[should_panic(expected = "Cannot step")]
  fn overstepping_panics() {
    let mut optimizer = Optimizer::new(
      ring_manifold(4),
      init(4),
      20,
      &sequential_config(),
      MetricType::Euclidean,
      1,
    );
    optimizer.step_epochs(21, &EuclideanEmbedding);
  }

  #[test]
  fn reference_embedding_is_left_untouched() {
    let reference = array![[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let graph = CooMatrix::new((1, 3), vec![0, 0], vec![1, 2], vec![0.5, 0.5]).to_csr();
    let manifold = LearnedManifold {
      graph,
      sigmas: Array1::ones(1),
      rhos: Array1::zeros(1),
      n_vertices: 3,
      a: 1.577,
      b: 0.895,
    };
    let mut optimizer = Optimizer::with_reference(
      manifold,
      array![[4.0f32, 4.0]],
      reference.clone(),
      30,
      &sequential_config(),
      MetricType::Euclidean,
      2,
    );
    optimizer.step_epochs(30, &EuclideanEmbedding);
    let placed = optimizer.embedding();
    assert!(placed[(0, 0)] < 4.0 && placed[(0, 1)] < 4.0);
    assert_eq!(optimizer.reference.as_ref(), Some(&reference));
  }
}
