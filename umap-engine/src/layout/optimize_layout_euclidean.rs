use super::EdgeSchedule;
use super::Edges;
use super::EpochParams;
use super::attractive_coeff;
use super::repulsive_coeff;
use ndarray::ArrayView2;
use ndarray::ArrayViewMut2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;

/// Edges handled by one parallel task (and one generator).
pub const EDGE_CHUNK_SIZE: usize = 4096;

/// Wrapper to allow concurrent mutable access to embedding arrays in parallel SGD.
///
/// # Safety
///
/// This type explicitly allows data races on the underlying f32 values
/// (Hogwild! SGD, Recht et al. 2011). Two workers may update the same
/// coordinate at once and one update can be lost; SGD tolerates this, and
/// most edges of a batch don't share vertices.
struct UnsafeSyncCell<T> {
  ptr: *mut T,
}

unsafe impl<T> Send for UnsafeSyncCell<T> {}
unsafe impl<T> Sync for UnsafeSyncCell<T> {}

impl<T> UnsafeSyncCell<T> {
  /// # Safety
  ///
  /// The pointer must stay valid for the lifetime of this cell.
  unsafe fn new(ptr: *mut T) -> Self {
    Self { ptr }
  }

  #[inline(always)]
  fn get(&self) -> *mut T {
    self.ptr
  }
}

/*
  Run one epoch of stochastic gradient descent on the fuzzy set cross
  entropy between the high dimensional graph and the embedding. Edges are
  sampled according to their membership strength; the (1 - p) terms come
  from negative sampling as in word2vec.

  This is the Euclidean specialization, working on squared distances.

  Parameters
  ----------
  head_embedding: array of shape (n_samples, n_components)
      The embedding being improved. Must be in standard (row-major) layout.

  tail_embedding: array of shape (source_samples, n_components) (optional)
      Reference embedding the heads are placed against. `None` means the
      heads are embedded against themselves: tails are rows of
      head_embedding and are moved along with the heads. With a reference,
      only head_embedding moves.

  edges: head[i] -> tail[i] for every 1-simplex with non-zero membership.

  schedule: per-edge sampling state, advanced in place.

  params: curve (a, b), repulsion gamma, learning rate alpha, epoch number,
      the epoch's seed, and whether to run the edges in parallel.

  With parallel = false the epoch draws from a single generator seeded with
  params.seed and is fully reproducible. With parallel = true the edges are
  split into EDGE_CHUNK_SIZE chunks, each with its own generator derived from
  params.seed, and run lock-free on the current rayon pool.
*/
pub fn optimize_layout_euclidean_single_epoch(
  head_embedding: &mut ArrayViewMut2<f32>,
  tail_embedding: Option<ArrayView2<f32>>,
  edges: Edges,
  schedule: &mut EdgeSchedule,
  params: &EpochParams,
) {
  assert!(
    head_embedding.is_standard_layout(),
    "embedding must be in standard layout"
  );
  let dim = head_embedding.ncols();
  let head_ptr = head_embedding.as_mut_ptr();
  let (tail_ptr, n_vertices, move_other) = match tail_embedding {
    Some(tail) => {
      assert!(tail.is_standard_layout(), "reference embedding must be in standard layout");
      assert_eq!(tail.ncols(), dim, "reference embedding dimension mismatch");
      (tail.as_ptr(), tail.nrows(), false)
    }
    None => (head_ptr as *const f32, head_embedding.nrows(), true),
  };
  let n_edges = schedule.len();
  let eps_ptr = schedule.epochs_per_sample.as_ptr();
  let eps_neg_ptr = schedule.epochs_per_negative_sample.as_ptr();
  let next_ptr = schedule.epoch_of_next_sample.as_mut_ptr();
  let next_neg_ptr = schedule.epoch_of_next_negative_sample.as_mut_ptr();

  let mut master = StdRng::seed_from_u64(params.seed);
  if !params.parallel {
    let kernel = EdgeKernel {
      head_ptr,
      tail_ptr,
      eps_ptr,
      eps_neg_ptr,
      next_ptr,
      next_neg_ptr,
      dim,
      n_vertices,
      move_other,
      params,
    };
    for i in 0..n_edges {
      // SAFETY: pointers come from live arrays and this is the only writer.
      unsafe { kernel.process(i, edges, &mut master) };
    }
    return;
  }

  let n_chunks = n_edges.div_ceil(EDGE_CHUNK_SIZE);
  let seeds: Vec<u64> = (0..n_chunks).map(|_| master.random()).collect();

  // SAFETY: Hogwild; races on embedding coordinates are accepted. Schedule
  // entry i is only touched by the chunk that owns edge i.
  let head_cell = unsafe { UnsafeSyncCell::new(head_ptr) };
  let tail_cell = unsafe { UnsafeSyncCell::new(tail_ptr as *mut f32) };
  let eps_cell = unsafe { UnsafeSyncCell::new(eps_ptr as *mut f64) };
  let eps_neg_cell = unsafe { UnsafeSyncCell::new(eps_neg_ptr as *mut f64) };
  let next_cell = unsafe { UnsafeSyncCell::new(next_ptr) };
  let next_neg_cell = unsafe { UnsafeSyncCell::new(next_neg_ptr) };

  seeds.into_par_iter().enumerate().for_each(|(c, seed)| {
    let mut rng = StdRng::seed_from_u64(seed);
    let kernel = EdgeKernel {
      head_ptr: head_cell.get(),
      tail_ptr: tail_cell.get() as *const f32,
      eps_ptr: eps_cell.get() as *const f64,
      eps_neg_ptr: eps_neg_cell.get() as *const f64,
      next_ptr: next_cell.get(),
      next_neg_ptr: next_neg_cell.get(),
      dim,
      n_vertices,
      move_other,
      params,
    };
    let start = c * EDGE_CHUNK_SIZE;
    let end = (start + EDGE_CHUNK_SIZE).min(n_edges);
    for i in start..end {
      unsafe { kernel.process(i, edges, &mut rng) };
    }
  });
}

struct EdgeKernel<'p> {
  head_ptr: *mut f32,
  tail_ptr: *const f32,
  eps_ptr: *const f64,
  eps_neg_ptr: *const f64,
  next_ptr: *mut f64,
  next_neg_ptr: *mut f64,
  dim: usize,
  n_vertices: usize,
  move_other: bool,
  params: &'p EpochParams,
}

impl<'p> EdgeKernel<'p> {
  /// Attract edge `i` if it is due, then repel its head from random vertices.
  ///
  /// # Safety
  ///
  /// `head_ptr` and `tail_ptr` must point to live row-major matrices with
  /// `dim` columns covering every index in `edges`, with `n_vertices` rows on
  /// the tail side. When `move_other` is set they must be the same matrix.
  /// The schedule pointers must cover index `i`.
  #[inline]
  unsafe fn process(&self, i: usize, edges: Edges, rng: &mut StdRng) {
    let EpochParams {
      a,
      b,
      gamma,
      alpha,
      epoch,
      ..
    } = *self.params;
    let n = epoch as f64;
    let dim = self.dim;

    unsafe {
      let epochs_per_sample = *self.eps_ptr.add(i);
      let next = self.next_ptr.add(i);
      if epochs_per_sample <= 0.0 || *next > n {
        return;
      }
      let j = edges.head[i] as usize;
      let k = edges.tail[i] as usize;

      let current = self.head_ptr.add(j * dim);
      let other = self.tail_ptr.add(k * dim);

      let mut dist_squared = 0.0_f32;
      for d in 0..dim {
        let diff = *current.add(d) - *other.add(d);
        dist_squared += diff * diff;
      }
      let grad_coeff = attractive_coeff(dist_squared, a, b);
      for d in 0..dim {
        let diff = *current.add(d) - *other.add(d);
        let grad_d = (grad_coeff * diff).clamp(-4.0, 4.0);
        *current.add(d) += grad_d * alpha;
        if self.move_other {
          *self.head_ptr.add(k * dim + d) -= grad_d * alpha;
        }
      }

      *next += epochs_per_sample;

      let epochs_per_negative_sample = *self.eps_neg_ptr.add(i);
      let next_neg = self.next_neg_ptr.add(i);
      let n_neg_samples = ((n - *next_neg) / epochs_per_negative_sample) as usize;

      for _ in 0..n_neg_samples {
        let k = rng.random_range(0..self.n_vertices);
        if self.move_other && j == k {
          continue;
        }
        let other = self.tail_ptr.add(k * dim);

        let mut dist_squared = 0.0_f32;
        for d in 0..dim {
          let diff = *current.add(d) - *other.add(d);
          dist_squared += diff * diff;
        }
        let grad_coeff = repulsive_coeff(dist_squared, a, b, gamma);
        if grad_coeff > 0.0 {
          for d in 0..dim {
            let diff = *current.add(d) - *other.add(d);
            let grad_d = (grad_coeff * diff).clamp(-4.0, 4.0);
            *current.add(d) += grad_d * alpha;
          }
        }
      }

      *next_neg += n_neg_samples as f64 * epochs_per_negative_sample;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array1;
  use ndarray::array;

  fn params(epoch: usize, parallel: bool) -> EpochParams {
    EpochParams {
      a: 1.577,
      b: 0.895,
      gamma: 1.0,
      alpha: 1.0,
      epoch,
      seed: 7,
      parallel,
    }
  }

  #[test]
  fn attraction_pulls_connected_points_together() {
    let mut embedding = array![[0.0f32, 0.0], [3.0, 0.0], [10.0, 10.0]];
    let head = Array1::from(vec![0u32, 1]);
    let tail = Array1::from(vec![1u32, 0]);
    let edges = Edges {
      head: head.view(),
      tail: tail.view(),
    };
    let mut schedule = EdgeSchedule::new(array![1.0, 1.0], 5.0);
    let before = (embedding[(1, 0)] - embedding[(0, 0)]).abs();
    for epoch in 1..20 {
      optimize_layout_euclidean_single_epoch(
        &mut embedding.view_mut(),
        None,
        edges,
        &mut schedule,
        &params(epoch, false),
      );
    }
    let after = (embedding[(1, 0)] - embedding[(0, 0)]).abs();
    assert!(after < before, "distance went from {before} to {after}");
    assert_eq!(schedule.epoch_of_next_sample.to_vec(), vec![20.0, 20.0]);
  }

  #[test]
  fn reference_embedding_stays_fixed() {
    let reference = array![[0.0f32, 0.0], [1.0, 1.0]];
    let mut new_points = array![[5.0f32, 5.0]];
    let head = Array1::from(vec![0u32]);
    let tail = Array1::from(vec![1u32]);
    let edges = Edges {
      head: head.view(),
      tail: tail.view(),
    };
    let mut schedule = EdgeSchedule::new(array![1.0], 5.0);
    for epoch in 1..10 {
      optimize_layout_euclidean_single_epoch(
        &mut new_points.view_mut(),
        Some(reference.view()),
        edges,
        &mut schedule,
        &params(epoch, true),
      );
    }
    assert_eq!(reference, array![[0.0f32, 0.0], [1.0, 1.0]]);
    assert!(new_points[(0, 0)] < 5.0);
  }

  #[test]
  fn reference_row_sharing_head_index_still_repels() {
    let reference = array![[0.0f32, 0.0]];
    let mut new_points = array![[0.5f32, 0.0]];
    let head = Array1::from(vec![0u32]);
    let tail = Array1::from(vec![0u32]);
    let mut schedule = EdgeSchedule::new(array![1.0], 5.0);
    let params = EpochParams {
      alpha: 0.01,
      ..params(1, false)
    };
    optimize_layout_euclidean_single_epoch(
      &mut new_points.view_mut(),
      Some(reference.view()),
      Edges {
        head: head.view(),
        tail: tail.view(),
      },
      &mut schedule,
      &params,
    );
    // Attraction alone would leave the point below 0.5.
    assert!(new_points[(0, 0)] > 0.5, "got {}", new_points[(0, 0)]);
  }

  #[test]
  fn sequential_epoch_is_deterministic() {
    let start = array![[0.0f32, 1.0], [2.0, 0.5], [4.0, 4.0], [1.0, 3.0]];
    let head = Array1::from(vec![0u32, 1, 2, 3, 1, 0]);
    let tail = Array1::from(vec![1u32, 0, 3, 2, 2, 3]);
    let run = || {
      let mut embedding = start.clone();
      let mut schedule = EdgeSchedule::new(Array1::from_elem(6, 1.0), 5.0);
      let edges = Edges {
        head: head.view(),
        tail: tail.view(),
      };
      for epoch in 1..15 {
        optimize_layout_euclidean_single_epoch(
          &mut embedding.view_mut(),
          None,
          edges,
          &mut schedule,
          &params(epoch, false),
        );
      }
      embedding
    };
    assert_eq!(run(), run());
  }
}
