use crate::sparse::SparseMat;
use crate::sparse::csr_from_rows;
use dashmap::DashSet;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::time::Instant;
use tracing::debug;
use typed_builder::TypedBuilder;

/*
  Construct the membership strength data for the 1-skeleton of each local
  fuzzy simplicial set, directly as a CSR matrix where row i holds the local
  fuzzy set of sample i.

  Parameters
  ----------
  knn_indices: array of shape (n_samples, n_neighbors)
      Neighbor indices. Values >= n_cols (such as u32::MAX for a neighbor
      that was never found) are skipped.

  knn_dists: array of shape (n_samples, n_neighbors)
      The distances to those neighbors.

  knn_disconnections: set of (row, slot) pairs
      Entries that were cut by the disconnection distance.

  sigmas, rhos: arrays of shape (n_samples,)
      Output of the smooth kNN distance calibration.

  n_cols: Number of columns of the result. Equal to n_samples for the
      training graph; the training set size when rows are new points.

  bipartite: bool (default false)
      When false, rows and columns index the same point set and self edges
      are dropped. When true the indices refer to another set and are kept.

  Returns
  -------
  A (n_samples, n_cols) CSR matrix with sorted column indices and strictly
  positive entries: 1 when the distance is within rho or sigma is zero,
  exp(-(d - rho) / sigma) otherwise.
*/
#[derive(TypedBuilder)]
pub struct ComputeMembershipStrengths<'a, 'd> {
  knn_indices: ArrayView2<'a, u32>,
  knn_dists: ArrayView2<'a, f32>,
  knn_disconnections: &'d DashSet<(usize, usize)>,
  sigmas: ArrayView1<'a, f32>,
  rhos: ArrayView1<'a, f32>,
  n_cols: usize,
  #[builder(default = false)]
  bipartite: bool,
}

impl<'a, 'd> ComputeMembershipStrengths<'a, 'd> {
  pub fn exec(self) -> SparseMat {
    let n_samples = self.knn_indices.nrows();
    let n_neighbors = self.knn_indices.ncols();

    let started = Instant::now();
    let mut rows: Vec<Vec<(u32, f32)>> = Vec::with_capacity(n_samples);
    (0..n_samples)
      .into_par_iter()
      .map(|i| {
        (0..n_neighbors)
          .filter_map(|j| self.strength(i, j).map(|val| (self.knn_indices[(i, j)], val)))
          .collect()
      })
      .collect_into_vec(&mut rows);

    let graph = csr_from_rows((n_samples, self.n_cols), rows);
    debug!(
      duration_ms = started.elapsed().as_millis(),
      nnz = graph.nnz(),
      "membership strengths complete"
    );
    graph
  }

  #[inline]
  fn strength(&self, i: usize, j: usize) -> Option<f32> {
    let idx = self.knn_indices[(i, j)] as usize;
    if idx >= self.n_cols || self.knn_disconnections.contains(&(i, j)) {
      return None;
    }
    if !self.bipartite && idx == i {
      return None;
    }
    let d = self.knn_dists[(i, j)];
    let val = if d - self.rhos[i] <= 0.0 || self.sigmas[i] == 0.0 {
      1.0
    } else {
      f32::exp(-(d - self.rhos[i]) / self.sigmas[i])
    };
    (val != 0.0).then_some(val)
  }
}
