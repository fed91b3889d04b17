use crate::heap::NeighborHeap;
use crate::heap::rejection_sample;
use crate::knn::KnnGraph;
use crate::metric::Metric;
use crate::progress::ProgressTracker;
use crate::progress::Stage;
use crate::rp_tree::RpForest;
use crate::sparse::SparseMat;
use crate::sparse::csr_row_indices;
use ndarray::ArrayView2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::debug;
use typed_builder::TypedBuilder;

/*
  Find approximate nearest neighbors of unseen points among the training
  data.

  Every query starts from the leaves of the training forest it falls into,
  topped up with random training points. The search then repeatedly takes the
  closest unexpanded candidate and offers each of its neighbors in the
  training search graph, until no candidate is left unexpanded.

  Parameters
  ----------
  data: array of shape (n_samples, n_features)
      The training data the graph was built on.

  queries: array of shape (n_queries, n_features)

  search_graph: csr matrix of shape (n_samples, n_samples)
      Undirected k-NN adjacency of the training data.

  forest: Trees built on the training data, if any.

  Returns
  -------
  A k-NN graph of shape (n_queries, n_neighbors) whose indices refer to rows of
  data.
*/
#[derive(TypedBuilder)]
pub struct NnSearch<'a> {
  data: ArrayView2<'a, f32>,
  queries: ArrayView2<'a, f32>,
  metric: &'a dyn Metric,
  search_graph: &'a SparseMat,
  #[builder(default)]
  forest: Option<&'a RpForest>,
  n_neighbors: usize,
  seed: u64,
  #[builder(default)]
  progress: Option<&'a ProgressTracker>,
}

impl<'a> NnSearch<'a> {
  pub fn exec(self) -> KnnGraph {
    let started = Instant::now();
    let n_queries = self.queries.nrows();
    let n_samples = self.data.nrows();
    let k = self.n_neighbors.min(n_samples);

    let mut master = StdRng::seed_from_u64(self.seed);
    let seeds: Vec<u64> = (0..n_queries).map(|_| master.random()).collect();
    let heap = NeighborHeap::new(n_queries, k);
    let done = AtomicUsize::new(0);

    seeds.into_par_iter().enumerate().for_each(|(q, seed)| {
      let mut rng = StdRng::seed_from_u64(seed);
      self.search_one(q, &heap, &mut rng);
      let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
      if let Some(progress) = self.progress {
        progress.report(Stage::Transform, completed, n_queries);
      }
    });

    debug!(
      duration_ms = started.elapsed().as_millis(),
      n_queries, n_samples, "nn search complete"
    );
    KnnGraph::from_heap(heap)
  }

  fn search_one(&self, q: usize, heap: &NeighborHeap, rng: &mut StdRng) {
    let query = self.queries.row(q);
    let mut visited = HashSet::new();
    let offer = |j: usize, visited: &mut HashSet<usize>| {
      if visited.insert(j) {
        let d = self.metric.distance(query, self.data.row(j));
        heap.push(q, d, j, true);
      }
    };

    if let Some(forest) = self.forest {
      for tree in forest.trees() {
        for &j in tree.search(query, rng) {
          offer(j as usize, &mut visited);
        }
      }
    }
    for j in rejection_sample(heap.n_neighbors(), self.data.nrows(), rng) {
      offer(j, &mut visited);
    }

    while let Some(vertex) = heap.smallest_flagged(q) {
      for &j in csr_row_indices(self.search_graph, vertex) {
        offer(j as usize, &mut visited);
      }
    }
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

  #[test]
  fn search_finds_most_true_neighbors() {
    let data = random_data(800, 6, 1);
    let queries = random_data(50, 6, 2);
    let train_knn = knn_from_distances(
      pairwise_distances(data.view(), data.view(), &Euclidean).view(),
      10,
    );
    let exact = knn_from_distances(
      pairwise_distances(queries.view(), data.view(), &Euclidean).view(),
      10,
    );
    let forest = BuildForest::builder()
      .data(data.view())
      .n_trees(4)
      .leaf_size(20)
      .seed(4)
      .build()
      .exec();
    let search_graph = train_knn.search_graph();
    let found = NnSearch::builder()
      .data(data.view())
      .queries(queries.view())
      .metric(&Euclidean)
      .search_graph(&search_graph)
      .forest(Some(&forest))
      .n_neighbors(10)
      .seed(8)
      .build()
      .exec();

    assert_eq!(found.indices.dim(), (50, 10));
    let mut hits = 0;
    for (f, e) in found.indices.rows().into_iter().zip(exact.indices.rows()) {
      hits += f.iter().filter(|i| e.iter().any(|j| j == *i)).count();
    }
    assert!(hits as f64 / 500.0 > 0.9, "recall {}", hits as f64 / 500.0);
    for row in found.dists.rows() {
      let row = row.to_vec();
      assert!(row.windows(2).all(|w| w[0] <= w[1]));
    }
  }
}
