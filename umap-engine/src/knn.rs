use crate::config::NnDescentParams;
use crate::heap::NeighborHeap;
use crate::metric::Metric;
use crate::nn_descent::NnDescent;
use crate::progress::ProgressTracker;
use crate::progress::Stage;
use crate::rp_tree::BuildForest;
use crate::rp_tree::RpForest;
use crate::rp_tree::default_n_trees;
use crate::sparse::CooMatrix;
use crate::sparse::SparseMat;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::Axis;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use std::time::Instant;
use tracing::info;
use typed_builder::TypedBuilder;

/// Below this many samples the exact pairwise distance matrix is computed
/// instead of running the approximate pipeline.
pub const SMALL_DATA_THRESHOLD: usize = 4096;

/// Index stored where fewer than k neighbors were found.
pub const MISSING: u32 = u32::MAX;

/// A k-nearest neighbor graph. Rows are sorted ascending by distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnnGraph {
  pub indices: Array2<u32>,
  pub dists: Array2<f32>,
}

impl KnnGraph {
  /// Sort a neighbor heap and convert it, mapping empty slots to [`MISSING`].
  pub fn from_heap(heap: NeighborHeap) -> Self {
    let (indices, dists) = heap.deheap_sort();
    let indices = indices.mapv(|i| u32::try_from(i).unwrap_or(MISSING));
    Self { indices, dists }
  }

  pub fn n_samples(&self) -> usize {
    self.indices.nrows()
  }

  pub fn n_neighbors(&self) -> usize {
    self.indices.ncols()
  }

  /// Undirected adjacency over the k-NN edges (self loops dropped), used to
  /// expand searches for unseen points.
  pub fn search_graph(&self) -> SparseMat {
    let n = self.n_samples();
    let mut rows = Vec::with_capacity(self.indices.len());
    let mut cols = Vec::with_capacity(self.indices.len());
    let mut vals = Vec::with_capacity(self.indices.len());
    for ((i, _), &j) in self.indices.indexed_iter() {
      if j == MISSING || j as usize == i {
        continue;
      }
      rows.push(i as u32);
      cols.push(j);
      vals.push(1.0);
    }
    let directed = CooMatrix::from_triplets_with((n, n), rows, cols, vals, f32::max);
    directed.maximum(&directed.transpose()).to_csr()
  }
}

/// Full distance matrix between every pair of rows of `a` and `b`, rows in parallel.
pub fn pairwise_distances(a: ArrayView2<f32>, b: ArrayView2<f32>, metric: &dyn Metric) -> Array2<f32> {
  let mut dmat = Array2::<f32>::zeros((a.nrows(), b.nrows()));
  dmat
    .axis_iter_mut(Axis(0))
    .into_par_iter()
    .enumerate()
    .for_each(|(i, mut row)| {
      let x = a.row(i);
      for (j, out) in row.iter_mut().enumerate() {
        *out = metric.distance(x, b.row(j));
      }
    });
  dmat
}

/// Exact k-NN from a dense distance matrix (rows = queries).
pub fn knn_from_distances(dmat: ArrayView2<f32>, k: usize) -> KnnGraph {
  let n = dmat.nrows();
  let k = k.min(dmat.ncols());
  let rows: Vec<Vec<(u32, f32)>> = (0..n)
    .into_par_iter()
    .map(|i| {
      let row = dmat.row(i);
      let mut order: Vec<u32> = (0..row.len() as u32).collect();
      order.sort_by(|&a, &b| row[a as usize].total_cmp(&row[b as usize]));
      order.truncate(k);
      order.into_iter().map(|j| (j, row[j as usize])).collect()
    })
    .collect();

  let mut indices = Array2::from_elem((n, k), MISSING);
  let mut dists = Array2::from_elem((n, k), f32::INFINITY);
  for (i, row) in rows.into_iter().enumerate() {
    for (j, (idx, d)) in row.into_iter().enumerate() {
      indices[(i, j)] = idx;
      dists[(i, j)] = d;
    }
  }
  KnnGraph { indices, dists }
}

/// Compute the k-NN graph of `data`, picking the strategy from its size and metric.
///
/// Precomputed distances are read directly, small inputs use the exact
/// pairwise matrix, and everything else goes through a random projection
/// forest followed by nearest neighbor descent. The forest is returned so new
/// points can be searched later.
#[derive(TypedBuilder)]
pub struct NearestNeighbors<'a> {
  data: ArrayView2<'a, f32>,
  metric: &'a dyn Metric,
  n_neighbors: usize,
  params: &'a NnDescentParams,
  #[builder(default = 1)]
  n_threads: usize,
  seed: u64,
  #[builder(default = false)]
  force_approximate: bool,
  #[builder(default, setter(strip_option))]
  progress: Option<&'a ProgressTracker>,
}

impl<'a> NearestNeighbors<'a> {
  pub fn exec(self) -> (KnnGraph, Option<RpForest>) {
    let n_samples = self.data.nrows();
    let started = Instant::now();

    if self.metric.is_precomputed() {
      let graph = knn_from_distances(self.data, self.n_neighbors);
      info!(
        duration_ms = started.elapsed().as_millis(),
        n_samples, "knn from precomputed distances complete"
      );
      return (graph, None);
    }

    if n_samples < SMALL_DATA_THRESHOLD && !self.force_approximate {
      let dmat = pairwise_distances(self.data, self.data, self.metric);
      let graph = knn_from_distances(dmat.view(), self.n_neighbors);
      info!(
        duration_ms = started.elapsed().as_millis(),
        n_samples, "exact pairwise knn complete"
      );
      if let Some(progress) = self.progress {
        progress.report(Stage::NearestNeighbors, 1, 1);
      }
      return (graph, None);
    }

    let mut rng = StdRng::seed_from_u64(self.seed);
    let forest_seed: u64 = rng.random();
    let descent_seed: u64 = rng.random();

    let n_trees = self
      .params
      .n_trees
      .unwrap_or_else(|| default_n_trees(n_samples));
    let forest = BuildForest::builder()
      .data(self.data)
      .n_trees(n_trees)
      .leaf_size(self.n_neighbors.max(10))
      .angular(self.metric.is_angular())
      .seed(forest_seed)
      .build()
      .exec();

    let n_iters = self
      .params
      .n_iters
      .unwrap_or_else(|| ((n_samples as f64).log2().round() as usize).max(5));
    let descent = NnDescent::builder()
      .data(self.data.view())
      .metric(self.metric)
      .n_neighbors(self.n_neighbors)
      .forest(Some(&forest))
      .max_candidates(self.params.max_candidates.min(self.n_neighbors))
      .n_iters(n_iters)
      .delta(self.params.delta)
      .rho(self.params.rho)
      .n_threads(self.n_threads)
      .seed(descent_seed)
      .progress(self.progress)
      .build();
    let graph = descent.exec();

    info!(
      duration_ms = started.elapsed().as_millis(),
      n_samples, n_trees, n_iters, "approximate knn complete"
    );
    (graph, Some(forest))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metric::Euclidean;
  use ndarray::array;

  #[test]
  fn exact_knn_lists_self_first() {
    let data = array![[0.0f32], [1.0], [3.0], [7.0]];
    let dmat = pairwise_distances(data.view(), data.view(), &Euclidean);
    let graph = knn_from_distances(dmat.view(), 2);
    assert_eq!(graph.indices.row(0).to_vec(), vec![0, 1]);
    assert_eq!(graph.indices.row(3).to_vec(), vec![3, 2]);
    assert_eq!(graph.dists.row(2).to_vec(), vec![0.0, 2.0]);
  }

  #[test]
  fn search_graph_is_symmetric_without_self_loops() {
    let graph = KnnGraph {
      indices: array![[0u32, 1], [1, 2], [2, MISSING]],
      dists: array![[0.0f32, 1.0], [0.0, 2.0], [0.0, f32::INFINITY]],
    };
    let search = graph.search_graph();
    assert_eq!(search.nnz(), 4);
    assert_eq!(crate::sparse::csr_row_indices(&search, 1), &[0, 2]);
    assert_eq!(crate::sparse::csr_row_indices(&search, 2), &[1]);
  }
}
