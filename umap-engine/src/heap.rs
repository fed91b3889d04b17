//! Bounded per-point max-heaps of candidate neighbors.
//!
//! Every row holds at most `k` `(weight, index, is_new)` triples arranged as a
//! max-heap on weight, so the root is the current worst candidate and a push
//! only has to beat it. Rows are independently locked, which lets descent
//! workers push into any row concurrently.

use ndarray::Array2;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use rand::Rng;
use std::ops::Range;

/// Index stored in unfilled slots.
pub const EMPTY: i32 = -1;

/// One point's candidate list, stored as a max-heap on `weights`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeapRow {
  pub indices: Vec<i32>,
  pub weights: Vec<f32>,
  pub flags: Vec<bool>,
}

impl HeapRow {
  fn new(size: usize) -> Self {
    Self {
      indices: vec![EMPTY; size],
      weights: vec![f32::INFINITY; size],
      flags: vec![false; size],
    }
  }

  /// Current worst (largest) weight held by the row.
  #[inline]
  pub fn max_weight(&self) -> f32 {
    self.weights.first().copied().unwrap_or(f32::NEG_INFINITY)
  }

  /// Offer a candidate. Returns true if the row changed.
  ///
  /// Rejected when it isn't better than the current worst entry or when
  /// `index` is already present.
  pub fn push(&mut self, weight: f32, index: i32, flag: bool) -> bool {
    let size = self.weights.len();
    if size == 0 || !(weight < self.weights[0]) {
      return false;
    }
    if self.indices.contains(&index) {
      return false;
    }

    // Replace the root and sift it down to its place.
    let mut i = 0;
    loop {
      let ic1 = 2 * i + 1;
      let ic2 = ic1 + 1;
      let i_swap = if ic1 >= size {
        break;
      } else if ic2 >= size {
        if self.weights[ic1] > weight {
          ic1
        } else {
          break;
        }
      } else if self.weights[ic1] >= self.weights[ic2] {
        if weight < self.weights[ic1] {
          ic1
        } else {
          break;
        }
      } else if weight < self.weights[ic2] {
        ic2
      } else {
        break;
      };

      self.weights[i] = self.weights[i_swap];
      self.indices[i] = self.indices[i_swap];
      self.flags[i] = self.flags[i_swap];
      i = i_swap;
    }

    self.weights[i] = weight;
    self.indices[i] = index;
    self.flags[i] = flag;
    true
  }

  /// Restore the heap property for the subtree at `elt`, looking only at the
  /// first `len` slots.
  fn sift_down(&mut self, len: usize, mut elt: usize) {
    while elt * 2 + 1 < len {
      let left = elt * 2 + 1;
      let right = left + 1;
      let mut swap = elt;
      if self.weights[swap] < self.weights[left] {
        swap = left;
      }
      if right < len && self.weights[swap] < self.weights[right] {
        swap = right;
      }
      if swap == elt {
        break;
      }
      self.weights.swap(elt, swap);
      self.indices.swap(elt, swap);
      self.flags.swap(elt, swap);
      elt = swap;
    }
  }

  /// Second half of heapsort: leaves the row sorted ascending by weight.
  pub fn deheap_sort(&mut self) {
    let size = self.weights.len();
    for j in 1..size {
      let end = size - j;
      self.weights.swap(0, end);
      self.indices.swap(0, end);
      self.flags.swap(0, end);
      self.sift_down(end, 0);
    }
  }

  /// Remove the "new" flag from the closest flagged candidate and return its index.
  pub fn smallest_flagged(&mut self) -> Option<usize> {
    let mut min_dist = f32::INFINITY;
    let mut result = None;
    for i in 0..self.weights.len() {
      if self.flags[i] && self.weights[i] < min_dist {
        min_dist = self.weights[i];
        result = Some(i);
      }
    }
    let slot = result?;
    self.flags[slot] = false;
    usize::try_from(self.indices[slot]).ok()
  }
}

/// Array of bounded max-heaps, one per point.
#[derive(Debug)]
pub struct NeighborHeap {
  n_neighbors: usize,
  rows: Vec<Mutex<HeapRow>>,
}

impl NeighborHeap {
  pub fn new(n_points: usize, size: usize) -> Self {
    Self {
      n_neighbors: size,
      rows: (0..n_points).map(|_| Mutex::new(HeapRow::new(size))).collect(),
    }
  }

  pub fn n_points(&self) -> usize {
    self.rows.len()
  }

  pub fn n_neighbors(&self) -> usize {
    self.n_neighbors
  }

  /// Push a candidate into `row`. Safe to call from several threads at once.
  #[inline]
  pub fn push(&self, row: usize, weight: f32, index: usize, flag: bool) -> bool {
    self.rows[row].lock().push(weight, index as i32, flag)
  }

  /// Lock `row` for direct inspection.
  pub fn row(&self, row: usize) -> MutexGuard<'_, HeapRow> {
    self.rows[row].lock()
  }

  pub fn smallest_flagged(&self, row: usize) -> Option<usize> {
    self.rows[row].lock().smallest_flagged()
  }

  /// Sort every row ascending by weight and return `(indices, weights)`.
  pub fn deheap_sort(self) -> (Array2<i32>, Array2<f32>) {
    let n_points = self.rows.len();
    let k = self.n_neighbors;
    let mut indices = Array2::from_elem((n_points, k), EMPTY);
    let mut weights = Array2::from_elem((n_points, k), f32::INFINITY);
    for (i, row) in self.rows.into_iter().enumerate() {
      let mut row = row.into_inner();
      row.deheap_sort();
      for j in 0..k {
        indices[(i, j)] = row.indices[j];
        weights[(i, j)] = row.weights[j];
      }
    }
    (indices, weights)
  }

  /// Build a capped, randomly prioritized exploration set for every vertex.
  ///
  /// See [`NeighborHeap::build_candidates_into`].
  pub fn build_candidates<R: Rng>(&self, max_candidates: usize, rng: &mut R) -> NeighborHeap {
    let candidates = NeighborHeap::new(self.n_points(), max_candidates);
    self.build_candidates_into(&candidates, 0..self.n_points(), rng);
    candidates
  }

  /// Fill `candidates` from the rows in `range`.
  ///
  /// Each current neighbor `j` of `i` is offered to both `i`'s and `j`'s
  /// candidate rows (forward and reverse edge) under a random priority, so
  /// the capped heap keeps a uniform random subset. The candidate inherits
  /// the neighbor's "new" flag, which is then cleared in this graph.
  pub fn build_candidates_into<R: Rng>(
    &self,
    candidates: &NeighborHeap,
    range: Range<usize>,
    rng: &mut R,
  ) {
    for i in range {
      let snapshot = {
        let mut row = self.rows[i].lock();
        let snapshot = row.clone();
        row.flags.iter_mut().for_each(|f| *f = false);
        snapshot
      };
      for (&idx, &is_new) in snapshot.indices.iter().zip(&snapshot.flags) {
        if idx < 0 {
          continue;
        }
        let d: f32 = rng.random();
        candidates.push(i, d, idx as usize, is_new);
        candidates.push(idx as usize, d, i, is_new);
      }
    }
  }
}

/// Draw `n_samples` distinct indices from `0..pool_size` by rejection.
pub fn rejection_sample<R: Rng>(n_samples: usize, pool_size: usize, rng: &mut R) -> Vec<usize> {
  let n_samples = n_samples.min(pool_size);
  let mut result = Vec::with_capacity(n_samples);
  while result.len() < n_samples {
    let j = rng.random_range(0..pool_size);
    if !result.contains(&j) {
      result.push(j);
    }
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use rand::SeedableRng;
  use rand::rngs::StdRng;
  use rayon::prelude::*;

  #[test]
  fn push_rejects_worse_and_duplicates() {
    let mut row = HeapRow::new(3);
    assert!(row.push(5.0, 1, true));
    assert!(row.push(3.0, 2, true));
    assert!(row.push(4.0, 3, true));
    assert_eq!(row.max_weight(), 5.0);
    assert!(!row.push(6.0, 4, true));
    assert!(!row.push(1.0, 2, true));
    assert!(row.push(1.0, 7, false));
    assert_eq!(row.max_weight(), 4.0);
    row.deheap_sort();
    assert_eq!(row.indices, vec![7, 2, 3]);
    assert_eq!(row.weights, vec![1.0, 3.0, 4.0]);
    assert_eq!(row.flags, vec![false, true, true]);
  }

  #[test]
  fn smallest_flagged_drains_in_order() {
    let heap = NeighborHeap::new(1, 4);
    heap.push(0, 2.0, 10, true);
    heap.push(0, 1.0, 11, false);
    heap.push(0, 3.0, 12, true);
    assert_eq!(heap.smallest_flagged(0), Some(10));
    assert_eq!(heap.smallest_flagged(0), Some(12));
    assert_eq!(heap.smallest_flagged(0), None);
  }

  #[test]
  fn candidates_include_reverse_edges_and_clear_flags() {
    let graph = NeighborHeap::new(3, 2);
    graph.push(0, 1.0, 1, true);
    graph.push(0, 2.0, 2, false);
    let mut rng = StdRng::seed_from_u64(7);
    let candidates = graph.build_candidates(4, &mut rng);

    let row0 = candidates.row(0).clone();
    assert!(row0.indices.contains(&1) && row0.indices.contains(&2));
    assert!(candidates.row(1).indices.contains(&0));
    assert!(candidates.row(2).indices.contains(&0));
    let slot = candidates.row(2).indices.iter().position(|&i| i == 0).unwrap();
    assert!(!candidates.row(2).flags[slot]);
    assert!(graph.row(0).flags.iter().all(|f| !f));
  }

  #[test]
  fn concurrent_pushes_keep_best() {
    let heap = NeighborHeap::new(4, 5);
    (0..400usize).into_par_iter().for_each(|i| {
      heap.push(i % 4, (i / 4) as f32, i, true);
    });
    let (indices, weights) = heap.deheap_sort();
    for r in 0..4 {
      let row: Vec<f32> = weights.row(r).to_vec();
      assert_eq!(row, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
      assert_eq!(indices[(r, 0)], r as i32);
    }
  }

  #[test]
  fn rejection_sample_is_distinct() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut s = rejection_sample(10, 12, &mut rng);
    s.sort();
    s.dedup();
    assert_eq!(s.len(), 10);
    assert_eq!(rejection_sample(5, 3, &mut rng).len(), 3);
  }

  proptest! {
    #[test]
    fn heap_keeps_k_smallest_distinct(
      mut pushes in prop::collection::vec((0.0f32..100.0, 0i32..40), 0..120),
      k in 1usize..10,
    ) {
      pushes.sort_by_key(|p| p.1);
      pushes.dedup_by_key(|p| p.1);
      let mut row = HeapRow::new(k);
      for &(w, idx) in &pushes {
        row.push(w, idx, true);
      }
      row.deheap_sort();

      let kept: Vec<i32> = row.indices.iter().copied().filter(|&i| i != EMPTY).collect();
      let mut dedup = kept.clone();
      dedup.sort();
      dedup.dedup();
      prop_assert_eq!(dedup.len(), kept.len());

      for pair in row.weights.windows(2) {
        prop_assert!(pair[0] <= pair[1]);
      }

      // Nothing rejected may beat the worst kept weight.
      let worst = row.weights[k - 1];
      for &(w, idx) in &pushes {
        if w < worst {
          prop_assert!(row.indices.contains(&idx));
        }
      }
    }

    #[test]
    fn deheap_sort_independent_of_push_order(
      mut pushes in prop::collection::vec((0u32..1000, 0i32..1000), 1..40),
      k in 1usize..8,
    ) {
      pushes.sort_by_key(|p| p.1);
      pushes.dedup_by_key(|p| p.1);
      pushes.sort_by_key(|p| p.0);
      pushes.dedup_by_key(|p| p.0);
      let mut forward = HeapRow::new(k);
      let mut backward = HeapRow::new(k);
      for &(w, idx) in &pushes {
        forward.push(w as f32, idx, false);
      }
      for &(w, idx) in pushes.iter().rev() {
        backward.push(w as f32, idx, false);
      }
      forward.deheap_sort();
      backward.deheap_sort();
      prop_assert_eq!(forward.weights, backward.weights);
      prop_assert_eq!(forward.indices, backward.indices);
    }
  }
}
