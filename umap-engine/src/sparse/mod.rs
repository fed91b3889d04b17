//! Sparse matrix support.
//!
//! Graphs live in CSR form ([`SparseMat`]) for row-sliced iteration during
//! optimization and search. [`CooMatrix`] carries the algebra used by the
//! supervised refinements (unions, intersections, normalizations).

mod coo;

pub use coo::CooMatrix;

use rayon::prelude::*;
use sprs::CsMatI;

/// Sparse matrix with u32 indices to save memory (4 bytes vs 8 bytes per index).
/// Valid for n_samples < 2^32 (~4 billion).
pub type SparseMat = CsMatI<f32, u32>;

/// Binary search for value A[row, col] in a CSR matrix. Returns 0.0 if not found.
#[inline]
pub fn csr_get(csr: &SparseMat, row: usize, col: u32) -> f32 {
  let row_start = csr.indptr().index(row) as usize;
  let row_end = csr.indptr().index(row + 1) as usize;
  let row_indices = &csr.indices()[row_start..row_end];
  let row_data = &csr.data()[row_start..row_end];

  match row_indices.binary_search(&col) {
    Ok(idx) => row_data[idx],
    Err(_) => 0.0,
  }
}

/// Column indices stored in `row`.
#[inline]
pub fn csr_row_indices(csr: &SparseMat, row: usize) -> &[u32] {
  let row_start = csr.indptr().index(row) as usize;
  let row_end = csr.indptr().index(row + 1) as usize;
  &csr.indices()[row_start..row_end]
}

/// Largest stored value, or `None` for an empty matrix.
pub fn max_value(csr: &SparseMat) -> Option<f32> {
  csr.data().iter().copied().reduce(f32::max)
}

/// Assemble a CSR matrix from per-row `(col, value)` lists, sorting each row by column.
pub(crate) fn csr_from_rows(shape: (usize, usize), mut rows: Vec<Vec<(u32, f32)>>) -> SparseMat {
  assert_eq!(rows.len(), shape.0, "row count differs from shape");
  rows
    .par_iter_mut()
    .for_each(|row| row.sort_unstable_by_key(|&(col, _)| col));

  let nnz: usize = rows.iter().map(Vec::len).sum();
  assert!(nnz <= u32::MAX as usize, "nnz overflows u32");
  let mut indptr: Vec<u32> = Vec::with_capacity(shape.0 + 1);
  let mut indices: Vec<u32> = Vec::with_capacity(nnz);
  let mut data: Vec<f32> = Vec::with_capacity(nnz);
  indptr.push(0);
  for row in rows {
    for (col, val) in row {
      indices.push(col);
      data.push(val);
    }
    indptr.push(indices.len() as u32);
  }
  CsMatI::new(shape, indptr, indices, data)
}

/// Keep only entries satisfying `keep(value)`; everything else is dropped.
pub fn filter_values(csr: &SparseMat, keep: impl Fn(f32) -> bool) -> SparseMat {
  let (n_rows, n_cols) = csr.shape();
  let mut indptr: Vec<u32> = Vec::with_capacity(n_rows + 1);
  let mut indices: Vec<u32> = Vec::with_capacity(csr.nnz());
  let mut data: Vec<f32> = Vec::with_capacity(csr.nnz());
  indptr.push(0);
  for row in csr.outer_iterator() {
    for (&col, &val) in row.indices().iter().zip(row.data()) {
      if keep(val) {
        indices.push(col);
        data.push(val);
      }
    }
    indptr.push(indices.len() as u32);
  }
  CsMatI::new((n_rows, n_cols), indptr, indices, data)
}

pub fn eliminate_zeros(csr: &SparseMat) -> SparseMat {
  filter_values(csr, |v| v != 0.0)
}

/// Divide each row by the sum of its absolute values.
pub fn l1_row_normalize(csr: &SparseMat) -> SparseMat {
  let mut out = csr.clone();
  for mut row in out.outer_iterator_mut() {
    let norm: f32 = row.data().iter().map(|v| v.abs()).sum();
    if norm > 0.0 {
      for (_, v) in row.iter_mut() {
        *v /= norm;
      }
    }
  }
  out
}

/// Divide each row by its maximum entry.
pub fn row_normalize_max(csr: &SparseMat) -> SparseMat {
  let mut out = csr.clone();
  for mut row in out.outer_iterator_mut() {
    let max = row.data().iter().copied().fold(0.0, f32::max);
    if max > 0.0 {
      for (_, v) in row.iter_mut() {
        *v /= max;
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  fn sample() -> SparseMat {
    CooMatrix::new(
      (2, 3),
      vec![0, 0, 1, 1],
      vec![0, 2, 1, 2],
      vec![1.0, 3.0, 0.0, 2.0],
    )
    .to_csr()
  }

  #[test]
  fn lookup_and_filters() {
    let m = sample();
    assert_eq!(csr_get(&m, 0, 2), 3.0);
    assert_eq!(csr_get(&m, 0, 1), 0.0);
    assert_eq!(csr_row_indices(&m, 1), &[1, 2]);
    assert_eq!(eliminate_zeros(&m).nnz(), 3);
    assert_eq!(filter_values(&m, |v| v >= 2.0).nnz(), 2);
    assert_eq!(max_value(&m), Some(3.0));
  }

  #[test]
  fn rows_assemble_sorted() {
    let m = csr_from_rows((3, 4), vec![vec![(3, 1.0), (0, 2.0)], vec![], vec![(1, 0.5)]]);
    assert_eq!(m.indptr().raw_storage(), &[0, 2, 2, 3]);
    assert_eq!(csr_row_indices(&m, 0), &[0, 3]);
    assert_eq!(csr_get(&m, 0, 0), 2.0);
    assert_eq!(csr_get(&m, 2, 1), 0.5);
  }

  #[test]
  fn normalizations() {
    let m = sample();
    let l1 = l1_row_normalize(&m);
    assert_relative_eq!(csr_get(&l1, 0, 0), 0.25);
    assert_relative_eq!(csr_get(&l1, 0, 2), 0.75);
    let mx = row_normalize_max(&m);
    assert_relative_eq!(csr_get(&mx, 0, 2), 1.0);
    assert_relative_eq!(csr_get(&mx, 1, 2), 1.0);
  }
}
