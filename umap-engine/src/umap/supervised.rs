//! Blending a target vector into the data graph.

use crate::config::NnDescentParams;
use crate::config::SupervisedParams;
use crate::knn::NearestNeighbors;
use crate::metric::Euclidean;
use crate::sparse::CooMatrix;
use crate::sparse::SparseMat;
use crate::umap::fuzzy_simplicial_set::FuzzySimplicialSet;
use dashmap::DashSet;
use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;
use std::time::Instant;
use tracing::info;
use typed_builder::TypedBuilder;

/// Per-sample target used to supervise the embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Target {
  /// Class labels. Negative labels mark samples of unknown class.
  Categorical(Vec<i64>),
  /// Real-valued target, compared by Euclidean distance.
  Continuous(Vec<f32>),
}

impl Target {
  pub fn len(&self) -> usize {
    match self {
      Target::Categorical(labels) => labels.len(),
      Target::Continuous(values) => values.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Penalty distance between samples of different classes for a given target weight.
pub fn far_dist(target_weight: f32) -> f32 {
  if target_weight < 1.0 {
    2.5 * (1.0 / (1.0 - target_weight))
  } else {
    1.0e12
  }
}

/// Down-weight edges between samples whose labels differ or are unknown, then
/// restore local connectivity.
pub fn categorical_simplicial_set_intersection(
  graph: &CooMatrix,
  target: &[i64],
  unknown_dist: f32,
  far_dist: f32,
) -> CooMatrix {
  let mut result = graph.clone();
  let unknown_factor = (-unknown_dist).exp();
  let far_factor = (-far_dist).exp();
  result.map_entries_in_place(|i, j, v| {
    if target[i] < 0 || target[j] < 0 {
      v * unknown_factor
    } else if target[i] != target[j] {
      v * far_factor
    } else {
      v
    }
  });
  result.eliminate_zeros();
  reset_local_connectivity(&result)
}

/// Weighted intersection of two fuzzy graphs over the union of their patterns.
///
/// Entries missing from one side count as half that side's smallest stored
/// value. `weight` near 0 favors `left`, near 1 favors `right`.
pub fn general_simplicial_set_intersection(
  left: &CooMatrix,
  right: &CooMatrix,
  weight: f32,
) -> CooMatrix {
  let half_min = |m: &CooMatrix| {
    let min = m
      .data()
      .iter()
      .copied()
      .filter(|&v| v > 0.0)
      .fold(f32::INFINITY, f32::min);
    if min.is_finite() { (min / 2.0).max(1e-8) } else { 1e-8 }
  };
  let left_min = half_min(left);
  let right_min = half_min(right);

  let mut result = left.add(right);
  result.map_entries_in_place(|i, j, _| {
    let l = left.get(i, j);
    let r = right.get(i, j);
    let left_val = if l > 0.0 { l } else { left_min };
    let right_val = if r > 0.0 { r } else { right_min };
    if left_val > left_min || right_val > right_min {
      if weight < 0.5 {
        left_val * right_val.powf(weight / (1.0 - weight))
      } else {
        left_val.powf((1.0 - weight) / weight) * right_val
      }
    } else {
      0.0
    }
  });
  result.eliminate_zeros();
  result
}

/// Max-normalize each row so every vertex keeps one full-strength edge, then
/// symmetrize again by fuzzy union.
pub fn reset_local_connectivity(graph: &CooMatrix) -> CooMatrix {
  let mut result = graph.row_normalize_max().fuzzy_union(1.0);
  result.eliminate_zeros();
  result
}

/*
  Refine the data graph with a target vector.

  Categorical targets scale down edges crossing classes by exp(-far_dist)
  (see [`far_dist`]) and edges touching unknown labels by exp(-unknown_dist).
  Continuous targets get their own fuzzy graph over the 1-D target values
  with target_n_neighbors neighbors, fused into the data graph by a general
  simplicial set intersection at target_weight. Both end with a local
  connectivity reset.
*/
#[derive(TypedBuilder)]
pub struct SupervisedFusion<'a> {
  graph: &'a SparseMat,
  target: &'a Target,
  params: &'a SupervisedParams,
  n_neighbors: usize,
  nn_descent: &'a NnDescentParams,
  #[builder(default = 1)]
  n_threads: usize,
  seed: u64,
}

impl<'a> SupervisedFusion<'a> {
  pub fn exec(self) -> SparseMat {
    let started = Instant::now();
    let graph = CooMatrix::from_csr(self.graph);
    let fused = match self.target {
      Target::Categorical(labels) => categorical_simplicial_set_intersection(
        &graph,
        labels,
        self.params.unknown_dist,
        far_dist(self.params.target_weight),
      ),
      Target::Continuous(values) => {
        let target_graph = self.continuous_target_graph(values);
        let fused = general_simplicial_set_intersection(
          &graph,
          &CooMatrix::from_csr(&target_graph),
          self.params.target_weight,
        );
        reset_local_connectivity(&fused)
      }
    };
    info!(
      duration_ms = started.elapsed().as_millis(),
      nnz = fused.nnz(),
      "supervised fusion complete"
    );
    fused.to_csr()
  }

  fn continuous_target_graph(&self, values: &[f32]) -> SparseMat {
    let n_samples = values.len();
    let k = self
      .params
      .target_n_neighbors
      .unwrap_or(self.n_neighbors)
      .clamp(2, n_samples.max(2))
      .min(n_samples);
    let data = Array2::from_shape_fn((n_samples, 1), |(i, _)| values[i]);
    let (knn, _) = NearestNeighbors::builder()
      .data(data.view())
      .metric(&Euclidean)
      .n_neighbors(k)
      .params(self.nn_descent)
      .n_threads(self.n_threads)
      .seed(self.seed)
      .build()
      .exec();
    let none = DashSet::new();
    let (graph, _, _) = FuzzySimplicialSet::builder()
      .knn_indices(knn.indices.view())
      .knn_dists(knn.dists.view())
      .n_neighbors(k)
      .knn_disconnections(&none)
      .build()
      .exec();
    graph
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  fn chain() -> CooMatrix {
    // 0 - 1 - 2 - 3 with full strength.
    CooMatrix::new(
      (4, 4),
      vec![0, 1, 1, 2, 2, 3],
      vec![1, 0, 2, 1, 3, 2],
      vec![1.0; 6],
    )
  }

  #[test]
  fn far_dist_grows_with_weight() {
    assert_relative_eq!(far_dist(0.5), 5.0);
    assert_eq!(far_dist(1.0), 1.0e12);
    assert!(far_dist(0.9) > far_dist(0.1));
  }

  #[test]
  fn categorical_intersection_weakens_cross_class_edges() {
    let labels = vec![0, 0, 1, -1];
    let fused = categorical_simplicial_set_intersection(&chain(), &labels, 1.0, far_dist(0.5));
    // Same class keeps full strength after the reset.
    assert_relative_eq!(fused.get(0, 1), 1.0);
    let cross = fused.get(1, 2);
    let unknown = fused.get(2, 3);
    assert!(cross < 0.05, "cross-class edge kept weight {cross}");
    assert!(unknown > cross);
    for (i, j, v) in fused.iter() {
      assert_relative_eq!(v, fused.get(j, i), epsilon = 1e-6);
    }
  }

  #[test]
  fn general_intersection_respects_weight() {
    let left = chain();
    let right = CooMatrix::new((4, 4), vec![0, 1], vec![1, 0], vec![0.5, 0.5]);
    let data_heavy = general_simplicial_set_intersection(&left, &right, 0.0);
    assert_relative_eq!(data_heavy.get(1, 2), 1.0);
    let target_heavy = general_simplicial_set_intersection(&left, &right, 1.0);
    assert_relative_eq!(target_heavy.get(0, 1), 0.5);
    assert_relative_eq!(target_heavy.get(1, 2), 0.25);
  }

  #[test]
  fn continuous_target_pulls_graph_toward_target_neighbors() {
    let graph = chain().to_csr();
    let target = Target::Continuous(vec![0.0, 0.1, 5.0, 5.1]);
    let params = SupervisedParams {
      target_weight: 0.9,
      ..Default::default()
    };
    let fused = SupervisedFusion::builder()
      .graph(&graph)
      .target(&target)
      .params(&params)
      .n_neighbors(2)
      .nn_descent(&NnDescentParams::default())
      .seed(1)
      .build()
      .exec();
    let fused = CooMatrix::from_csr(&fused);
    assert!(fused.get(0, 1) > fused.get(1, 2));
  }
}
