use crate::sparse::SparseMat;
use crate::sparse::csr_from_rows;
use crate::sparse::csr_get;
use crate::umap::compute_membership_strengths::ComputeMembershipStrengths;
use crate::umap::smooth_knn_dist::SmoothKnnDist;
use dashmap::DashSet;
use ndarray::Array1;
use ndarray::ArrayView2;
use rayon::prelude::*;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::debug;
use tracing::info;
use typed_builder::TypedBuilder;

/// CSC structure without data - only stores indptr and indices for transpose traversal.
/// Values are looked up in the original CSR via binary search O(log k).
struct CscStructure {
  indptr: Vec<u32>,
  indices: Vec<u32>,
}

impl CscStructure {
  /// Rows that have an entry in `col`.
  #[inline]
  fn col_row_indices(&self, col: usize) -> &[u32] {
    let start = self.indptr[col] as usize;
    let end = self.indptr[col + 1] as usize;
    &self.indices[start..end]
  }
}

/// Mark every (row, slot) of the kNN graph whose distance reaches `threshold`.
pub fn find_disconnections(knn_dists: ArrayView2<f32>, threshold: f32) -> DashSet<(usize, usize)> {
  let disconnections = DashSet::new();
  (0..knn_dists.nrows()).into_par_iter().for_each(|i| {
    for (j, &d) in knn_dists.row(i).iter().enumerate() {
      if d >= threshold && d.is_finite() {
        disconnections.insert((i, j));
      }
    }
  });
  disconnections
}

/// Rows of `graph` with no positive weight.
pub fn disconnected_vertices(graph: &SparseMat) -> Vec<usize> {
  graph
    .outer_iterator()
    .enumerate()
    .filter(|(_, row)| row.data().iter().all(|&v| v == 0.0))
    .map(|(i, _)| i)
    .collect()
}

/*
  Given the k-nearest neighbors of every sample, compute the fuzzy simplicial
  set (a fuzzy graph stored as a sparse matrix) associated to the data. Each
  point gets a local fuzzy simplicial set by approximating geodesic distance
  around it, and the local sets are combined into a global one via a fuzzy
  union.

  Parameters
  ----------
  knn_indices, knn_dists: arrays of shape (n_samples, n_neighbors)
      Neighbor indices and distances, rows sorted by distance. The sample
      itself is expected first at distance 0.

  n_neighbors: The number of neighbors used to approximate geodesic distance.

  knn_disconnections: Entries cut by the disconnection distance, see
      [`find_disconnections`].

  set_op_mix_ratio: float (default 1.0)
      Interpolate between (fuzzy) union and intersection when combining the
      local sets. Both use the product t-norm; 1.0 is a pure union, 0.0 a
      pure intersection.

  local_connectivity: float (default 1.0)
      Number of nearest neighbors assumed to be connected at a local level.

  apply_set_operations: bool (default true)
      When false, the directed membership graph is returned as is.

  Returns
  -------
  (graph, sigmas, rhos): a symmetric (n_samples, n_samples) CSR graph and the
  per-sample calibration used to build it.
*/
#[derive(TypedBuilder, Debug)]
pub struct FuzzySimplicialSet<'a, 'd> {
  knn_indices: ArrayView2<'a, u32>,
  knn_dists: ArrayView2<'a, f32>,
  n_neighbors: usize,
  knn_disconnections: &'d DashSet<(usize, usize)>,
  #[builder(default = 1.0)]
  set_op_mix_ratio: f32,
  #[builder(default = 1.0)]
  local_connectivity: f32,
  #[builder(default = true)]
  apply_set_operations: bool,
}

impl<'a, 'd> FuzzySimplicialSet<'a, 'd> {
  pub fn exec(self) -> (SparseMat, Array1<f32>, Array1<f32>) {
    let n_samples = self.knn_indices.nrows();
    assert!(
      n_samples < u32::MAX as usize,
      "n_samples must be < 2^32 for u32 indices"
    );

    let started = Instant::now();
    let (sigmas, rhos) = SmoothKnnDist::builder()
      .distances(self.knn_dists)
      .k(self.n_neighbors)
      .local_connectivity(self.local_connectivity)
      .build()
      .exec();
    debug!(
      duration_ms = started.elapsed().as_millis(),
      "smooth_knn_dist complete"
    );

    let mut result = ComputeMembershipStrengths::builder()
      .knn_indices(self.knn_indices.view())
      .knn_dists(self.knn_dists.view())
      .knn_disconnections(self.knn_disconnections)
      .sigmas(sigmas.view())
      .rhos(rhos.view())
      .n_cols(n_samples)
      .build()
      .exec();

    if self.apply_set_operations {
      let started = Instant::now();
      result = apply_set_operations_parallel(&result, self.set_op_mix_ratio);
      debug!(
        duration_ms = started.elapsed().as_millis(),
        nnz = result.nnz(),
        "set_operations complete"
      );
    }

    info!(
      duration_ms = started.elapsed().as_millis(),
      n_samples,
      nnz = result.nnz(),
      "fuzzy simplicial set complete"
    );
    (result, sigmas, rhos)
  }
}

/// Build CSC structure (indptr + indices only, no data) for transpose traversal.
fn build_csc_structure(csr: &SparseMat) -> CscStructure {
  let n_rows = csr.rows();
  let n_cols = csr.cols();
  let nnz = csr.nnz();

  let col_counts: Vec<AtomicU32> = (0..n_cols).map(|_| AtomicU32::new(0)).collect();
  (0..n_rows).into_par_iter().for_each(|row| {
    let row_start = csr.indptr().index(row) as usize;
    let row_end = csr.indptr().index(row + 1) as usize;
    for &col in &csr.indices()[row_start..row_end] {
      col_counts[col as usize].fetch_add(1, Ordering::Relaxed);
    }
  });

  let mut indptr: Vec<u32> = Vec::with_capacity(n_cols + 1);
  indptr.push(0);
  let mut total = 0u32;
  for count in &col_counts {
    total += count.load(Ordering::Relaxed);
    indptr.push(total);
  }
  assert_eq!(total as usize, nnz);

  // Sequential fill; walking rows in order leaves each column's rows sorted.
  let mut indices: Vec<u32> = vec![0; nnz];
  let mut col_offsets: Vec<u32> = vec![0; n_cols];
  for row in 0..n_rows {
    let row_start = csr.indptr().index(row) as usize;
    let row_end = csr.indptr().index(row + 1) as usize;
    for &col in &csr.indices()[row_start..row_end] {
      let write_pos = (indptr[col as usize] + col_offsets[col as usize]) as usize;
      indices[write_pos] = row as u32;
      col_offsets[col as usize] += 1;
    }
  }

  CscStructure { indptr, indices }
}

/// Apply fuzzy set union/intersection operations, building CSR directly.
///
/// Computes: set_op_mix_ratio * (A + A^T) + (1 - 2*set_op_mix_ratio) * (A ⊙ A^T)
/// where ⊙ is the Hadamard (elementwise) product.
///
/// For each pair (i, j) where A[i,j] or A[j,i] is non-zero, output[i,j] and
/// output[j,i] receive the same value.
pub fn apply_set_operations_parallel(input: &SparseMat, set_op_mix_ratio: f32) -> SparseMat {
  let n_samples = input.rows();
  let prod_coeff = 1.0 - 2.0 * set_op_mix_ratio;
  let csc = build_csc_structure(input);

  let combined = |row: usize, col: u32, val_rc: f32| {
    let val_cr = csr_get(input, col as usize, row as u32);
    set_op_mix_ratio * val_rc + set_op_mix_ratio * val_cr + prod_coeff * val_rc * val_cr
  };

  // Row r collects A's row r plus the entries of column r with no direct counterpart.
  let mut rows: Vec<Vec<(u32, f32)>> = Vec::with_capacity(n_samples);
  (0..n_samples)
    .into_par_iter()
    .map(|row| {
      let row_start = input.indptr().index(row) as usize;
      let row_end = input.indptr().index(row + 1) as usize;
      let mut out = Vec::with_capacity(row_end - row_start);
      for (&col, &val_rc) in input.indices()[row_start..row_end]
        .iter()
        .zip(&input.data()[row_start..row_end])
      {
        let val = combined(row, col, val_rc);
        if val != 0.0 {
          out.push((col, val));
        }
      }
      for &c in csc.col_row_indices(row) {
        if csr_get(input, row, c) != 0.0 {
          continue;
        }
        let val = set_op_mix_ratio * csr_get(input, c as usize, row as u32);
        if val != 0.0 {
          out.push((c, val));
        }
      }
      out
    })
    .collect_into_vec(&mut rows);

  csr_from_rows((n_samples, n_samples), rows)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sparse::CooMatrix;
  use approx::assert_relative_eq;
  use ndarray::array;

  fn knn() -> (ndarray::Array2<u32>, ndarray::Array2<f32>) {
    (
      array![[0u32, 1, 2], [1, 0, 2], [2, 1, 0], [3, 2, 1]],
      array![
        [0.0f32, 1.0, 2.0],
        [0.0, 1.0, 1.5],
        [0.0, 1.5, 2.0],
        [0.0, 3.0, 4.5]
      ],
    )
  }

  #[test]
  fn graph_is_symmetric_with_unit_bounded_weights() {
    let (indices, dists) = knn();
    let none = DashSet::new();
    let (graph, sigmas, rhos) = FuzzySimplicialSet::builder()
      .knn_indices(indices.view())
      .knn_dists(dists.view())
      .n_neighbors(3)
      .knn_disconnections(&none)
      .build()
      .exec();

    assert_eq!(sigmas.len(), 4);
    assert_eq!(rhos.to_vec(), vec![1.0, 1.0, 1.5, 3.0]);
    let dense = graph.to_dense();
    for i in 0..4 {
      assert_eq!(dense[(i, i)], 0.0);
      for j in 0..4 {
        assert_relative_eq!(dense[(i, j)], dense[(j, i)], epsilon = 1e-6);
        assert!((0.0..=1.0).contains(&dense[(i, j)]));
      }
    }
    assert!(disconnected_vertices(&graph).is_empty());
  }

  #[test]
  fn parallel_set_operations_match_coo_algebra() {
    let (indices, dists) = knn();
    let none = DashSet::new();
    for mix in [0.0f32, 0.3, 1.0] {
      let (directed, _, _) = FuzzySimplicialSet::builder()
        .knn_indices(indices.view())
        .knn_dists(dists.view())
        .n_neighbors(3)
        .knn_disconnections(&none)
        .apply_set_operations(false)
        .build()
        .exec();
      let fast = apply_set_operations_parallel(&directed, mix).to_dense();
      let reference = CooMatrix::from_csr(&directed).fuzzy_union(mix).to_dense();
      for (a, b) in fast.iter().zip(reference.iter()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-6);
      }
    }
  }

  #[test]
  fn disconnection_threshold_isolates_far_vertex() {
    let (indices, dists) = knn();
    let cut = find_disconnections(dists.view(), 2.5);
    assert_eq!(cut.len(), 2);
    let (graph, _, _) = FuzzySimplicialSet::builder()
      .knn_indices(indices.view())
      .knn_dists(dists.view())
      .n_neighbors(3)
      .knn_disconnections(&cut)
      .build()
      .exec();
    assert_eq!(disconnected_vertices(&graph), vec![3]);
  }
}
