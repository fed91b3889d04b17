use super::SparseMat;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::Axis;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use sprs::CsMatI;
use std::cmp::Ordering;

/// Coordinate-format sparse matrix.
///
/// Entries are kept sorted by (row, col) with no duplicate coordinates, so
/// lookups are a binary search and every binary operator is a single
/// merge-scan over two sorted streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooMatrix {
  shape: (usize, usize),
  rows: Vec<u32>,
  cols: Vec<u32>,
  data: Vec<f32>,
}

impl CooMatrix {
  /// Build from unordered triplets. Duplicate coordinates are summed.
  pub fn new(shape: (usize, usize), rows: Vec<u32>, cols: Vec<u32>, data: Vec<f32>) -> Self {
    Self::from_triplets_with(shape, rows, cols, data, |a, b| a + b)
  }

  /// Build from unordered triplets, folding duplicate coordinates with `combine`.
  pub fn from_triplets_with(
    shape: (usize, usize),
    rows: Vec<u32>,
    cols: Vec<u32>,
    data: Vec<f32>,
    combine: impl Fn(f32, f32) -> f32,
  ) -> Self {
    assert_eq!(rows.len(), cols.len(), "rows and cols differ in length");
    assert_eq!(rows.len(), data.len(), "rows and data differ in length");

    let mut order: Vec<usize> = (0..rows.len()).collect();
    order.sort_unstable_by_key(|&i| (rows[i], cols[i]));

    let mut out = Self::zeros(shape);
    for i in order {
      let (r, c, v) = (rows[i], cols[i], data[i]);
      debug_assert!((r as usize) < shape.0 && (c as usize) < shape.1);
      match (out.rows.last(), out.cols.last()) {
        (Some(&lr), Some(&lc)) if lr == r && lc == c => {
          if let Some(last) = out.data.last_mut() {
            *last = combine(*last, v);
          }
        }
        _ => {
          out.rows.push(r);
          out.cols.push(c);
          out.data.push(v);
        }
      }
    }
    out
  }

  pub fn zeros(shape: (usize, usize)) -> Self {
    Self {
      shape,
      rows: Vec::new(),
      cols: Vec::new(),
      data: Vec::new(),
    }
  }

  pub fn from_dense(dense: ArrayView2<f32>) -> Self {
    let mut out = Self::zeros((dense.nrows(), dense.ncols()));
    for ((r, c), &v) in dense.indexed_iter() {
      if v != 0.0 {
        out.rows.push(r as u32);
        out.cols.push(c as u32);
        out.data.push(v);
      }
    }
    out
  }

  pub fn from_csr(csr: &SparseMat) -> Self {
    let mut out = Self::zeros(csr.shape());
    for (r, row) in csr.outer_iterator().enumerate() {
      for (c, &v) in row.iter() {
        out.rows.push(r as u32);
        out.cols.push(c as u32);
        out.data.push(v);
      }
    }
    out
  }

  pub fn shape(&self) -> (usize, usize) {
    self.shape
  }

  pub fn nnz(&self) -> usize {
    self.data.len()
  }

  pub fn rows(&self) -> &[u32] {
    &self.rows
  }

  pub fn cols(&self) -> &[u32] {
    &self.cols
  }

  pub fn data(&self) -> &[f32] {
    &self.data
  }

  /// Iterate `(row, col, value)` in row-major order.
  pub fn iter(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
    self
      .rows
      .iter()
      .zip(&self.cols)
      .zip(&self.data)
      .map(|((&r, &c), &v)| (r as usize, c as usize, v))
  }

  /// Value at (row, col), or 0 if the coordinate isn't stored.
  pub fn get(&self, row: usize, col: usize) -> f32 {
    let key = (row as u32, col as u32);
    let mut lo = 0;
    let mut hi = self.data.len();
    while lo < hi {
      let mid = (lo + hi) / 2;
      match (self.rows[mid], self.cols[mid]).cmp(&key) {
        Ordering::Less => lo = mid + 1,
        Ordering::Greater => hi = mid,
        Ordering::Equal => return self.data[mid],
      }
    }
    0.0
  }

  /// Merge-scan two sorted coordinate streams.
  ///
  /// With `union` every coordinate present in either operand is visited and a
  /// missing side reads as 0; otherwise only shared coordinates are kept.
  fn merge_scan(&self, other: &Self, union: bool, op: impl Fn(f32, f32) -> f32) -> Self {
    assert_eq!(self.shape, other.shape, "sparse operands differ in shape");
    let mut out = Self::zeros(self.shape);
    let (mut i, mut j) = (0, 0);
    let (n, m) = (self.nnz(), other.nnz());
    let emit = |out: &mut Self, r: u32, c: u32, v: f32| {
      out.rows.push(r);
      out.cols.push(c);
      out.data.push(v);
    };
    while i < n && j < m {
      let a = (self.rows[i], self.cols[i]);
      let b = (other.rows[j], other.cols[j]);
      match a.cmp(&b) {
        Ordering::Less => {
          if union {
            emit(&mut out, a.0, a.1, op(self.data[i], 0.0));
          }
          i += 1;
        }
        Ordering::Greater => {
          if union {
            emit(&mut out, b.0, b.1, op(0.0, other.data[j]));
          }
          j += 1;
        }
        Ordering::Equal => {
          emit(&mut out, a.0, a.1, op(self.data[i], other.data[j]));
          i += 1;
          j += 1;
        }
      }
    }
    if union {
      for k in i..n {
        emit(&mut out, self.rows[k], self.cols[k], op(self.data[k], 0.0));
      }
      for k in j..m {
        emit(&mut out, other.rows[k], other.cols[k], op(0.0, other.data[k]));
      }
    }
    out
  }

  pub fn add(&self, other: &Self) -> Self {
    self.merge_scan(other, true, |a, b| a + b)
  }

  pub fn subtract(&self, other: &Self) -> Self {
    self.merge_scan(other, true, |a, b| a - b)
  }

  /// Elementwise product; only coordinates stored in both operands survive.
  pub fn hadamard(&self, other: &Self) -> Self {
    self.merge_scan(other, false, |a, b| a * b)
  }

  /// Elementwise maximum over the union of both sparsity patterns.
  pub fn maximum(&self, other: &Self) -> Self {
    self.merge_scan(other, true, f32::max)
  }

  pub fn transpose(&self) -> Self {
    let (n_rows, n_cols) = self.shape;
    let mut order: Vec<usize> = (0..self.nnz()).collect();
    order.sort_unstable_by_key(|&i| (self.cols[i], self.rows[i]));
    Self {
      shape: (n_cols, n_rows),
      rows: order.iter().map(|&i| self.cols[i]).collect(),
      cols: order.iter().map(|&i| self.rows[i]).collect(),
      data: order.iter().map(|&i| self.data[i]).collect(),
    }
  }

  /// `A + Aᵀ`.
  pub fn add_transpose(&self) -> Self {
    self.add(&self.transpose())
  }

  /// `A ∘ Aᵀ`.
  pub fn hadamard_multiply_transpose(&self) -> Self {
    self.hadamard(&self.transpose())
  }

  /// Fuzzy union of a directed membership graph with its transpose, blended
  /// with the fuzzy intersection:
  /// `mix·(A + Aᵀ − A∘Aᵀ) + (1 − mix)·(A∘Aᵀ)`.
  pub fn fuzzy_union(&self, set_op_mix_ratio: f32) -> Self {
    let product = self.hadamard_multiply_transpose();
    let union = self.add_transpose().subtract(&product);
    if set_op_mix_ratio >= 1.0 {
      return union;
    }
    union
      .scale(set_op_mix_ratio)
      .add(&product.scale(1.0 - set_op_mix_ratio))
  }

  pub fn scale(&self, factor: f32) -> Self {
    self.map_values(|v| v * factor)
  }

  pub fn map_values(&self, f: impl Fn(f32) -> f32) -> Self {
    Self {
      shape: self.shape,
      rows: self.rows.clone(),
      cols: self.cols.clone(),
      data: self.data.iter().map(|&v| f(v)).collect(),
    }
  }

  /// Apply `f(row, col, value)` to every stored entry in place.
  pub fn map_entries_in_place(&mut self, f: impl Fn(usize, usize, f32) -> f32) {
    for k in 0..self.data.len() {
      self.data[k] = f(self.rows[k] as usize, self.cols[k] as usize, self.data[k]);
    }
  }

  /// Drop explicitly stored zeros.
  pub fn eliminate_zeros(&mut self) {
    let mut write = 0;
    for read in 0..self.data.len() {
      if self.data[read] != 0.0 {
        self.rows[write] = self.rows[read];
        self.cols[write] = self.cols[read];
        self.data[write] = self.data[read];
        write += 1;
      }
    }
    self.rows.truncate(write);
    self.cols.truncate(write);
    self.data.truncate(write);
  }

  /// Start offset of every row plus a trailing end offset.
  fn row_offsets(&self) -> Vec<usize> {
    let mut offsets = vec![0usize; self.shape.0 + 1];
    for &r in &self.rows {
      offsets[r as usize + 1] += 1;
    }
    for i in 0..self.shape.0 {
      offsets[i + 1] += offsets[i];
    }
    offsets
  }

  fn normalize_rows_by(&self, norm: impl Fn(&[f32]) -> f32) -> Self {
    let offsets = self.row_offsets();
    let mut out = self.clone();
    for r in 0..self.shape.0 {
      let (start, end) = (offsets[r], offsets[r + 1]);
      let denom = norm(&self.data[start..end]);
      if denom > 0.0 {
        for v in &mut out.data[start..end] {
          *v /= denom;
        }
      }
    }
    out
  }

  /// Divide each row by its maximum entry.
  pub fn row_normalize_max(&self) -> Self {
    self.normalize_rows_by(|row| row.iter().copied().fold(0.0, f32::max))
  }

  /// Divide each row by the sum of its absolute values.
  pub fn l1_row_normalize(&self) -> Self {
    self.normalize_rows_by(|row| row.iter().map(|v| v.abs()).sum())
  }

  pub fn to_csr(&self) -> SparseMat {
    let indptr: Vec<u32> = self.row_offsets().into_iter().map(|o| o as u32).collect();
    CsMatI::new(self.shape, indptr, self.cols.clone(), self.data.clone())
  }

  pub fn to_dense(&self) -> Array2<f32> {
    let mut dense = Array2::zeros(self.shape);
    for (r, c, v) in self.iter() {
      dense[(r, c)] = v;
    }
    dense
  }

  /// Sparse × dense product, rows in parallel.
  pub fn multiply_dense(&self, other: ArrayView2<f32>) -> Array2<f32> {
    assert_eq!(self.shape.1, other.nrows(), "inner dimensions differ");
    let offsets = self.row_offsets();
    let mut out = Array2::zeros((self.shape.0, other.ncols()));
    out
      .axis_iter_mut(Axis(0))
      .into_par_iter()
      .enumerate()
      .for_each(|(r, mut out_row)| {
        for i in offsets[r]..offsets[r + 1] {
          out_row.scaled_add(self.data[i], &other.row(self.cols[i] as usize));
        }
      });
    out
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use ndarray::array;
  use proptest::prelude::*;

  fn directed() -> CooMatrix {
    CooMatrix::new(
      (3, 3),
      vec![0, 0, 1, 2],
      vec![1, 2, 0, 0],
      vec![0.5, 1.0, 0.25, 0.0],
    )
  }

  #[test]
  fn new_sorts_and_sums_duplicates() {
    let m = CooMatrix::new((2, 2), vec![1, 0, 1], vec![0, 1, 0], vec![1.0, 2.0, 3.0]);
    assert_eq!(m.nnz(), 2);
    assert_eq!(m.rows(), &[0, 1]);
    assert_eq!(m.get(1, 0), 4.0);
    assert_eq!(m.get(0, 1), 2.0);
    assert_eq!(m.get(0, 0), 0.0);
  }

  #[test]
  fn algebra_matches_dense() {
    let a = directed();
    let b = a.transpose();
    let da = a.to_dense();
    let db = b.to_dense();
    assert_eq!(a.add(&b).to_dense(), &da + &db);
    assert_eq!(a.subtract(&b).to_dense(), &da - &db);
    assert_eq!(a.hadamard(&b).to_dense(), &da * &db);
    assert_eq!(b.to_dense(), da.t());
  }

  #[test]
  fn fuzzy_union_is_symmetric_probabilistic_or() {
    let a = directed();
    let u = a.fuzzy_union(1.0);
    assert_relative_eq!(u.get(0, 1), 0.5 + 0.25 - 0.125);
    assert_relative_eq!(u.get(1, 0), u.get(0, 1));
    assert_relative_eq!(u.get(0, 2), 1.0);
    assert_relative_eq!(u.get(2, 0), 1.0);

    let intersection = a.fuzzy_union(0.0);
    assert_relative_eq!(intersection.get(0, 1), 0.125);
    assert_eq!(intersection.get(0, 2), 0.0);
  }

  #[test]
  fn eliminate_zeros_and_normalize() {
    let mut a = directed();
    a.eliminate_zeros();
    assert_eq!(a.nnz(), 3);
    let n = a.row_normalize_max();
    assert_eq!(n.get(0, 1), 0.5);
    assert_eq!(n.get(0, 2), 1.0);
    assert_eq!(n.get(1, 0), 1.0);
    let l1 = a.l1_row_normalize();
    assert_relative_eq!(l1.get(0, 1) + l1.get(0, 2), 1.0);
  }

  #[test]
  fn csr_round_trip_and_products() {
    let a = directed();
    let csr = a.to_csr();
    assert_eq!(CooMatrix::from_csr(&csr), a);

    let x = array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]];
    let expected = a.to_dense().dot(&x);
    assert_eq!(a.multiply_dense(x.view()), expected);
  }

  proptest! {
    #[test]
    fn union_ops_agree_with_dense(
      entries in prop::collection::vec((0u32..6, 0u32..6, 0.0f32..1.0), 0..30)
    ) {
      let (rows, rest): (Vec<u32>, Vec<(u32, f32)>) =
        entries.iter().map(|&(r, c, v)| (r, (c, v))).unzip();
      let (cols, vals): (Vec<u32>, Vec<f32>) = rest.into_iter().unzip();
      let a = CooMatrix::from_triplets_with((6, 6), rows, cols, vals, f32::max);
      let t = a.transpose();
      let dense = a.to_dense();
      prop_assert_eq!(a.maximum(&t).to_dense(), ndarray::Zip::from(&dense).and(&dense.t()).map_collect(|&x, &y| x.max(y)));
      let u = a.fuzzy_union(1.0);
      for (r, c, v) in u.iter() {
        prop_assert!((v - u.get(c, r)).abs() < 1e-6);
      }
    }
  }
}
