use crate::heap::NeighborHeap;
use crate::heap::rejection_sample;
use crate::knn::KnnGraph;
use crate::metric::Metric;
use crate::progress::ProgressTracker;
use crate::progress::Stage;
use crate::rp_tree::RpForest;
use ndarray::ArrayView2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::ops::Range;
use std::time::Instant;
use tracing::debug;
use typed_builder::TypedBuilder;

/*
  Approximate k-nearest neighbor graph by nearest neighbor descent.

  The graph starts from k random neighbors per point, plus every pair that
  shares a leaf in the random projection forest when one is supplied. Each
  round then samples up to max_candidates neighbors (forward and reverse) per
  point and compares every pair of them, on the principle that a neighbor of a
  neighbor is likely a neighbor. Pairs where both sides were already examined
  in an earlier round are skipped.

  Parameters
  ----------
  n_neighbors: Number of neighbors kept per point. Each point is its own first
  neighbor at distance zero.

  max_candidates: Cap on the sampled candidate set per point and round.

  n_iters: Maximum number of rounds.

  delta: Stop early once a round performs at most delta * n_neighbors *
  n_samples heap updates.

  rho: Probability of skipping a candidate as the first element of a pair.

  n_threads: With one thread the work runs on a single generator seeded from
  `seed`, so results are reproducible. With more, points are split into
  n_threads * (1 + floor(log2(n_threads))) chunks, each with its own generator
  derived from the master one, and heap rows are locked individually.
*/
#[derive(TypedBuilder)]
pub struct NnDescent<'a> {
  data: ArrayView2<'a, f32>,
  metric: &'a dyn Metric,
  n_neighbors: usize,
  #[builder(default)]
  forest: Option<&'a RpForest>,
  #[builder(default = 60)]
  max_candidates: usize,
  #[builder(default = 10)]
  n_iters: usize,
  #[builder(default = 0.001)]
  delta: f32,
  #[builder(default = 0.5)]
  rho: f32,
  #[builder(default = 1)]
  n_threads: usize,
  seed: u64,
  #[builder(default)]
  progress: Option<&'a ProgressTracker>,
}

impl<'a> NnDescent<'a> {
  pub fn exec(self) -> KnnGraph {
    let n_samples = self.data.nrows();
    let k = self.n_neighbors.min(n_samples);
    let started = Instant::now();
    let mut rng = StdRng::seed_from_u64(self.seed);

    let graph = NeighborHeap::new(n_samples, k);
    for i in 0..n_samples {
      graph.push(i, 0.0, i, true);
    }

    self.for_each_chunk(&mut rng, |range, rng| {
      for i in range {
        for j in rejection_sample(k, n_samples, rng) {
          if j == i {
            continue;
          }
          let d = self.distance(i, j);
          graph.push(i, d, j, true);
          graph.push(j, d, i, true);
        }
      }
      0
    });

    if let Some(forest) = self.forest {
      let leaves: Vec<&[u32]> = forest.leaves().collect();
      leaves.par_iter().for_each(|leaf| {
        for (a, &p) in leaf.iter().enumerate() {
          for &q in &leaf[a + 1..] {
            let d = self.distance(p as usize, q as usize);
            graph.push(p as usize, d, q as usize, true);
            graph.push(q as usize, d, p as usize, true);
          }
        }
      });
    }
    debug!(
      duration_ms = started.elapsed().as_millis(),
      n_samples, k, "nn descent initialized"
    );

    let threshold = (self.delta * k as f32 * n_samples as f32) as usize;
    let max_candidates = self.max_candidates.max(1);
    for iter in 0..self.n_iters {
      let candidates = NeighborHeap::new(n_samples, max_candidates);
      self.for_each_chunk(&mut rng, |range, rng| {
        graph.build_candidates_into(&candidates, range, rng);
        0
      });

      let updates = self.for_each_chunk(&mut rng, |range, rng| {
        let mut updates = 0;
        for i in range {
          updates += self.local_join(&graph, &candidates, i, rng);
        }
        updates
      });

      debug!(iter, updates, threshold, "nn descent round complete");
      if let Some(progress) = self.progress {
        progress.report(Stage::NearestNeighbors, iter + 1, self.n_iters);
      }
      if updates <= threshold {
        if let Some(progress) = self.progress {
          progress.report(Stage::NearestNeighbors, self.n_iters, self.n_iters);
        }
        break;
      }
    }

    KnnGraph::from_heap(graph)
  }

  #[inline]
  fn distance(&self, i: usize, j: usize) -> f32 {
    self.metric.distance(self.data.row(i), self.data.row(j))
  }

  /// Compare every admissible pair in `i`'s candidate set. Returns the number
  /// of heap updates performed.
  fn local_join(
    &self,
    graph: &NeighborHeap,
    candidates: &NeighborHeap,
    i: usize,
    rng: &mut StdRng,
  ) -> usize {
    let row = candidates.row(i).clone();
    let mut updates = 0;
    for (a, (&p, &p_new)) in row.indices.iter().zip(&row.flags).enumerate() {
      if p < 0 || rng.random::<f32>() < self.rho {
        continue;
      }
      for (&q, &q_new) in row.indices[a + 1..].iter().zip(&row.flags[a + 1..]) {
        if q < 0 || p == q || (!p_new && !q_new) {
          continue;
        }
        let (p, q) = (p as usize, q as usize);
        let d = self.distance(p, q);
        updates += graph.push(p, d, q, true) as usize;
        updates += graph.push(q, d, p, true) as usize;
      }
    }
    updates
  }

  /// Run `f` over all points, either in one go or split into seeded chunks on
  /// the current rayon pool. Returns the sum of what `f` returns.
  fn for_each_chunk<F>(&self, rng: &mut StdRng, f: F) -> usize
  where
    F: Fn(Range<usize>, &mut StdRng) -> usize + Sync,
  {
    let n_samples = self.data.nrows();
    if self.n_threads <= 1 {
      return f(0..n_samples, rng);
    }
    let n_chunks = self.n_threads * (1 + self.n_threads.ilog2() as usize);
    let chunk_size = n_samples.div_ceil(n_chunks).max(1);
    let seeds: Vec<u64> = (0..n_chunks).map(|_| rng.random()).collect();
    seeds
      .into_par_iter()
      .enumerate()
      .map(|(c, seed)| {
        let start = (c * chunk_size).min(n_samples);
        let end = (start + chunk_size).min(n_samples);
        let mut chunk_rng = StdRng::seed_from_u64(seed);
        f(start..end, &mut chunk_rng)
      })
      .sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::knn::knn_from_distances;
  use crate::knn::pairwise_distances;
  use crate::metric::Euclidean;
  use crate::rp_tree::BuildForest;
  use ndarray::Array2;

  fn random_data(n: usize, dim: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, dim), |_| rng.random_range(-1.0..1.0))
  }

  fn recall(approx: &KnnGraph, exact: &KnnGraph) -> f64 {
    let mut hits = 0;
    for (a, e) in approx.indices.rows().into_iter().zip(exact.indices.rows()) {
      hits += a.iter().filter(|i| e.iter().any(|j| j == *i)).count();
    }
    hits as f64 / exact.indices.len() as f64
  }

  #[test]
  fn matches_brute_force_closely() {
    let data = random_data(600, 8, 1);
    let exact = knn_from_distances(pairwise_distances(data.view(), data.view(), &Euclidean).view(), 10);
    let forest = BuildForest::builder()
      .data(data.view())
      .n_trees(6)
      .leaf_size(20)
      .seed(3)
      .build()
      .exec();
    let graph = NnDescent::builder()
      .data(data.view())
      .metric(&Euclidean)
      .n_neighbors(10)
      .forest(Some(&forest))
      .n_iters(10)
      .seed(5)
      .build()
      .exec();
    assert!(recall(&graph, &exact) > 0.9);
    for i in 0..data.nrows() {
      assert_eq!(graph.indices[(i, 0)] as usize, i);
      assert_eq!(graph.dists[(i, 0)], 0.0);
    }
  }

  #[test]
  fn parallel_descent_reaches_good_recall() {
    let data = random_data(500, 5, 2);
    let exact = knn_from_distances(pairwise_distances(data.view(), data.view(), &Euclidean).view(), 8);
    let graph = NnDescent::builder()
      .data(data.view())
      .metric(&Euclidean)
      .n_neighbors(8)
      .n_iters(15)
      .n_threads(4)
      .seed(9)
      .build()
      .exec();
    assert!(recall(&graph, &exact) > 0.85);
  }

  #[test]
  fn single_thread_is_deterministic() {
    let data = random_data(300, 4, 3);
    let run = || {
      NnDescent::builder()
        .data(data.view())
        .metric(&Euclidean)
        .n_neighbors(6)
        .seed(11)
        .build()
        .exec()
    };
    assert_eq!(run(), run());
  }
}
