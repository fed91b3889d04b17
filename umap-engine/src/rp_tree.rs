//! Random projection trees.
//!
//! A tree recursively splits the point set by random hyperplanes until each
//! partition holds at most `leaf_size` points. Trees are built recursively and
//! then flattened into parallel arrays so searches walk plain slices.

use ndarray::Array1;
use ndarray::Array2;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Deserialize;
use serde::Serialize;
use std::time::Instant;
use tracing::debug;
use typed_builder::TypedBuilder;

/// Margins closer to the hyperplane than this are decided by a coin flip.
const EPS: f32 = 1e-8;

/// Recursion guard; a partition this deep becomes a leaf regardless of size.
const MAX_DEPTH: usize = 100;

/// Node of a tree under construction.
#[derive(Debug)]
pub enum TreeNode {
  Leaf(Vec<u32>),
  Split {
    hyperplane: Array1<f32>,
    offset: f32,
    left: Box<TreeNode>,
    right: Box<TreeNode>,
  },
}

impl TreeNode {
  pub fn num_nodes(&self) -> usize {
    match self {
      TreeNode::Leaf(_) => 1,
      TreeNode::Split { left, right, .. } => 1 + left.num_nodes() + right.num_nodes(),
    }
  }

  pub fn num_leaves(&self) -> usize {
    match self {
      TreeNode::Leaf(_) => 1,
      TreeNode::Split { left, right, .. } => left.num_leaves() + right.num_leaves(),
    }
  }
}

fn norm(v: ArrayView1<f32>) -> f32 {
  v.dot(&v).sqrt()
}

/// Pick two distinct members of `indices`.
fn pick_pair<R: Rng>(indices: &[u32], rng: &mut R) -> (usize, usize) {
  let n = indices.len();
  let left = rng.random_range(0..n);
  let mut right = rng.random_range(0..n - 1);
  if right >= left {
    right += 1;
  }
  (indices[left] as usize, indices[right] as usize)
}

/// Hyperplane through the midpoint of two random members, normal to their difference.
fn euclidean_hyperplane<R: Rng>(
  data: ArrayView2<f32>,
  indices: &[u32],
  rng: &mut R,
) -> (Array1<f32>, f32) {
  let (l, r) = pick_pair(indices, rng);
  let left = data.row(l);
  let right = data.row(r);
  let hyperplane = &left - &right;
  let midpoint = (&left + &right) * 0.5;
  let offset = -hyperplane.dot(&midpoint);
  (hyperplane, offset)
}

/// Hyperplane bisecting the angle between two random members, through the origin.
fn angular_hyperplane<R: Rng>(
  data: ArrayView2<f32>,
  indices: &[u32],
  rng: &mut R,
) -> (Array1<f32>, f32) {
  let (l, r) = pick_pair(indices, rng);
  let left = data.row(l);
  let right = data.row(r);

  let mut left_norm = norm(left);
  let mut right_norm = norm(right);
  if left_norm.abs() < EPS {
    left_norm = 1.0;
  }
  if right_norm.abs() < EPS {
    right_norm = 1.0;
  }

  let mut hyperplane = &left / left_norm - &right / right_norm;
  let mut hyperplane_norm = norm(hyperplane.view());
  if hyperplane_norm.abs() < EPS {
    hyperplane_norm = 1.0;
  }
  hyperplane /= hyperplane_norm;
  (hyperplane, 0.0)
}

#[inline]
fn margin(hyperplane: ArrayView1<f32>, offset: f32, point: ArrayView1<f32>) -> f32 {
  offset + hyperplane.dot(&point)
}

/// Side of the hyperplane `point` falls on; true means left.
#[inline]
fn goes_left<R: Rng>(m: f32, rng: &mut R) -> bool {
  if m.abs() < EPS {
    rng.random_bool(0.5)
  } else {
    m > 0.0
  }
}

fn split<R: Rng>(
  data: ArrayView2<f32>,
  indices: Vec<u32>,
  angular: bool,
  rng: &mut R,
) -> (Array1<f32>, f32, Vec<u32>, Vec<u32>) {
  let (hyperplane, offset) = if angular {
    angular_hyperplane(data, &indices, rng)
  } else {
    euclidean_hyperplane(data, &indices, rng)
  };

  let mut left = Vec::with_capacity(indices.len() / 2);
  let mut right = Vec::with_capacity(indices.len() / 2);
  for &i in &indices {
    if goes_left(margin(hyperplane.view(), offset, data.row(i as usize)), rng) {
      left.push(i);
    } else {
      right.push(i);
    }
  }

  // Degenerate split (e.g. duplicated points): cut a random permutation in half.
  if left.is_empty() || right.is_empty() {
    let mut shuffled = indices;
    shuffled.shuffle(rng);
    right = shuffled.split_off(shuffled.len() / 2);
    left = shuffled;
  }

  (hyperplane, offset, left, right)
}

/// Recursively partition `indices` until each leaf holds at most `leaf_size` points.
pub fn make_tree<R: Rng>(
  data: ArrayView2<f32>,
  indices: Vec<u32>,
  angular: bool,
  leaf_size: usize,
  rng: &mut R,
) -> TreeNode {
  make_tree_at_depth(data, indices, angular, leaf_size, rng, 0)
}

fn make_tree_at_depth<R: Rng>(
  data: ArrayView2<f32>,
  indices: Vec<u32>,
  angular: bool,
  leaf_size: usize,
  rng: &mut R,
  depth: usize,
) -> TreeNode {
  if indices.len() <= leaf_size.max(1) || depth >= MAX_DEPTH {
    return TreeNode::Leaf(indices);
  }
  let (hyperplane, offset, left, right) = split(data, indices, angular, rng);
  TreeNode::Split {
    hyperplane,
    offset,
    left: Box::new(make_tree_at_depth(data, left, angular, leaf_size, rng, depth + 1)),
    right: Box::new(make_tree_at_depth(data, right, angular, leaf_size, rng, depth + 1)),
  }
}

/// A tree flattened into parallel arrays.
///
/// `children[node]` holds the left and right node ids of an internal node. A
/// leaf is encoded as `[-leaf_id, -1]`; node 0 is the root, so no internal
/// node ever has a non-positive left child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatTree {
  hyperplanes: Array2<f32>,
  offsets: Vec<f32>,
  children: Vec<[i32; 2]>,
  leaves: Vec<Vec<u32>>,
}

impl FlatTree {
  /// Convert a built tree into its array form.
  pub fn flatten(tree: TreeNode, dim: usize) -> Self {
    let n_nodes = tree.num_nodes();
    let mut flat = FlatTree {
      hyperplanes: Array2::zeros((n_nodes, dim)),
      offsets: vec![0.0; n_nodes],
      children: vec![[-1, -1]; n_nodes],
      leaves: Vec::with_capacity(tree.num_leaves()),
    };
    let mut next_node = 0;
    flat.flatten_node(tree, &mut next_node);
    flat
  }

  fn flatten_node(&mut self, node: TreeNode, next_node: &mut usize) -> usize {
    let id = *next_node;
    *next_node += 1;
    match node {
      TreeNode::Leaf(indices) => {
        self.children[id] = [-(self.leaves.len() as i32), -1];
        self.leaves.push(indices);
      }
      TreeNode::Split {
        hyperplane,
        offset,
        left,
        right,
      } => {
        self.hyperplanes.row_mut(id).assign(&hyperplane);
        self.offsets[id] = offset;
        let left_id = self.flatten_node(*left, next_node);
        let right_id = self.flatten_node(*right, next_node);
        self.children[id] = [left_id as i32, right_id as i32];
      }
    }
    id
  }

  /// Descend to the leaf `point` falls into and return its members.
  pub fn search<R: Rng>(&self, point: ArrayView1<f32>, rng: &mut R) -> &[u32] {
    let mut node = 0usize;
    while self.children[node][0] > 0 {
      let m = margin(self.hyperplanes.row(node), self.offsets[node], point);
      node = if goes_left(m, rng) {
        self.children[node][0] as usize
      } else {
        self.children[node][1] as usize
      };
    }
    &self.leaves[(-self.children[node][0]) as usize]
  }

  pub fn leaves(&self) -> &[Vec<u32>] {
    &self.leaves
  }

  pub fn n_nodes(&self) -> usize {
    self.offsets.len()
  }
}

/// Default forest size: `5 + ⌊√n / 20⌋`.
pub fn default_n_trees(n_samples: usize) -> usize {
  5 + ((n_samples as f64).sqrt() / 20.0).floor() as usize
}

/// An ensemble of independently seeded random projection trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpForest {
  trees: Vec<FlatTree>,
}

#[derive(TypedBuilder)]
pub struct BuildForest<'a> {
  data: ArrayView2<'a, f32>,
  n_trees: usize,
  leaf_size: usize,
  #[builder(default = false)]
  angular: bool,
  seed: u64,
}

impl<'a> BuildForest<'a> {
  /// Build all trees in parallel on the current rayon pool.
  ///
  /// Every tree gets its own generator, derived from `seed` before any work
  /// is spawned, so the forest doesn't depend on the number of threads.
  pub fn exec(self) -> RpForest {
    let BuildForest {
      data,
      n_trees,
      leaf_size,
      angular,
      seed,
    } = self;

    let started = Instant::now();
    let mut master = StdRng::seed_from_u64(seed);
    let tree_seeds: Vec<u64> = (0..n_trees).map(|_| master.random()).collect();
    let n_samples = data.nrows() as u32;

    let trees: Vec<FlatTree> = tree_seeds
      .into_par_iter()
      .map(|tree_seed| {
        let mut rng = StdRng::seed_from_u64(tree_seed);
        let tree = make_tree(data, (0..n_samples).collect(), angular, leaf_size, &mut rng);
        FlatTree::flatten(tree, data.ncols())
      })
      .collect();

    debug!(
      duration_ms = started.elapsed().as_millis(),
      n_trees, leaf_size, angular, "rp forest complete"
    );
    RpForest { trees }
  }
}

impl RpForest {
  pub fn trees(&self) -> &[FlatTree] {
    &self.trees
  }

  pub fn n_trees(&self) -> usize {
    self.trees.len()
  }

  /// Iterate over every leaf of every tree.
  pub fn leaves(&self) -> impl Iterator<Item = &[u32]> {
    self
      .trees
      .iter()
      .flat_map(|tree| tree.leaves().iter().map(Vec::as_slice))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use rand::Rng;

  fn random_data(n: usize, dim: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, dim), |_| rng.random::<f32>())
  }

  fn assert_partition(tree: &FlatTree, n: usize) {
    let mut seen = vec![0usize; n];
    for leaf in tree.leaves() {
      for &i in leaf {
        seen[i as usize] += 1;
      }
    }
    assert!(seen.iter().all(|&c| c == 1), "leaves must be disjoint and exhaustive");
  }

  #[test]
  fn leaves_partition_the_points() {
    let data = random_data(500, 8, 3);
    for angular in [false, true] {
      let mut rng = StdRng::seed_from_u64(11);
      let tree = make_tree(data.view(), (0..500).collect(), angular, 15, &mut rng);
      let flat = FlatTree::flatten(tree, 8);
      assert_partition(&flat, 500);
      assert!(flat.leaves().iter().all(|leaf| leaf.len() <= 15));
      assert!(flat.leaves().len() > 1);
    }
  }

  #[test]
  fn duplicated_points_still_split() {
    let data = Array2::<f32>::ones((64, 3));
    let mut rng = StdRng::seed_from_u64(5);
    let tree = make_tree(data.view(), (0..64).collect(), false, 10, &mut rng);
    let flat = FlatTree::flatten(tree, 3);
    assert_partition(&flat, 64);
    assert!(flat.leaves().iter().all(|leaf| leaf.len() <= 10));
  }

  #[test]
  fn search_finds_own_leaf() {
    let data = random_data(300, 5, 9);
    let mut rng = StdRng::seed_from_u64(2);
    let tree = make_tree(data.view(), (0..300).collect(), false, 10, &mut rng);
    let flat = FlatTree::flatten(tree, 5);
    for i in 0..300u32 {
      let leaf = flat.search(data.row(i as usize), &mut rng);
      assert!(leaf.contains(&i));
    }
  }

  #[test]
  fn single_leaf_tree() {
    let data = random_data(5, 2, 1);
    let mut rng = StdRng::seed_from_u64(2);
    let tree = make_tree(data.view(), (0..5).collect(), false, 10, &mut rng);
    let flat = FlatTree::flatten(tree, 2);
    assert_eq!(flat.n_nodes(), 1);
    assert_eq!(flat.search(data.row(0), &mut rng).len(), 5);
  }

  #[test]
  fn forest_is_independent_of_thread_count() {
    let data = random_data(400, 6, 4);
    let build = |threads: usize| {
      let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .unwrap();
      pool.install(|| {
        BuildForest::builder()
          .data(data.view())
          .n_trees(6)
          .leaf_size(12)
          .seed(99)
          .build()
          .exec()
      })
    };
    let one = build(1);
    let four = build(4);
    assert_eq!(one.n_trees(), 6);
    let a: Vec<&[u32]> = one.leaves().collect();
    let b: Vec<&[u32]> = four.leaves().collect();
    assert_eq!(a, b);
  }

  #[test]
  fn default_tree_count() {
    assert_eq!(default_n_trees(100), 5);
    assert_eq!(default_n_trees(10_000), 10);
  }
}
