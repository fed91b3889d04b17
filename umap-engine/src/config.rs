use ndarray::Array2;
use serde::Deserialize;
use serde::Serialize;

/// Configuration for manifold shape and embedding space properties.
///
/// These parameters control the geometric properties of the low-dimensional
/// embedding space and how the manifold is shaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldParams {
  /// Minimum distance between points in the embedding space.
  ///
  /// Controls how tightly points can be packed together. Smaller values
  /// create more clustered embeddings, larger values spread points out more.
  ///
  /// Must be in `[0, spread]`.
  ///
  /// Default: 0.1
  pub min_dist: f32,

  /// The effective scale of embedded points.
  ///
  /// Together with `min_dist`, this determines the embedding's overall spread.
  /// The curve used in optimization is calibrated using these parameters.
  ///
  /// Default: 1.0
  pub spread: f32,

  /// Parameter 'a' of the distance-to-probability curve: 1 / (1 + a*x^(2b))
  ///
  /// If `None`, fitted from `min_dist` and `spread`. Only used when `b` is set too.
  ///
  /// Default: None (auto-compute)
  pub a: Option<f32>,

  /// Parameter 'b' of the distance-to-probability curve: 1 / (1 + a*x^(2b))
  ///
  /// Default: None (auto-compute)
  pub b: Option<f32>,
}

impl Default for ManifoldParams {
  fn default() -> Self {
    Self {
      min_dist: 0.1,
      spread: 1.0,
      a: None,
      b: None,
    }
  }
}

/// Configuration for k-nearest neighbor graph construction.
///
/// These parameters control how the high-dimensional manifold structure
/// is captured via a fuzzy topological representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphParams {
  /// Number of nearest neighbors to use for manifold approximation, counting
  /// the point itself.
  ///
  /// Larger values capture more global structure but may miss fine details.
  /// Values above the number of samples minus one are clamped.
  ///
  /// Must be >= 2.
  ///
  /// Default: 15
  pub n_neighbors: usize,

  /// Local connectivity requirement (number of nearest neighbors assumed connected).
  ///
  /// Higher values make the manifold more locally connected, which can help
  /// with datasets that have variable density.
  ///
  /// Default: 1.0
  pub local_connectivity: f32,

  /// Interpolation between fuzzy union (1.0) and fuzzy intersection (0.0).
  ///
  /// Must be in range [0.0, 1.0].
  ///
  /// Default: 1.0
  pub set_op_mix_ratio: f32,

  /// Distance threshold at or beyond which edges are disconnected.
  ///
  /// If `None`, uses the metric's [`disconnection_threshold`](crate::Metric::disconnection_threshold).
  ///
  /// Default: None (use metric default)
  pub disconnection_distance: Option<f32>,
}

impl Default for GraphParams {
  fn default() -> Self {
    Self {
      n_neighbors: 15,
      local_connectivity: 1.0,
      set_op_mix_ratio: 1.0,
      disconnection_distance: None,
    }
  }
}

/// Configuration for stochastic gradient descent optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationParams {
  /// Number of optimization epochs.
  ///
  /// If `None`, will be automatically determined based on dataset size:
  /// - <= 10,000 samples: 500 epochs
  /// - > 10,000 samples: 200 epochs
  ///
  /// Must be > 10 when set.
  ///
  /// Default: None (auto-determine)
  pub n_epochs: Option<usize>,

  /// Initial learning rate for SGD. Decays linearly to 0.
  ///
  /// Default: 1.0
  pub learning_rate: f32,

  /// Number of negative samples per positive sample.
  ///
  /// Default: 5
  pub negative_sample_rate: usize,

  /// Weight applied to negative samples (repulsion strength).
  ///
  /// Default: 1.0
  pub repulsion_strength: f32,
}

impl Default for OptimizationParams {
  fn default() -> Self {
    Self {
      n_epochs: None,
      learning_rate: 1.0,
      negative_sample_rate: 5,
      repulsion_strength: 1.0,
    }
  }
}

/// Tuning for the approximate nearest neighbor pipeline used on inputs with at
/// least [`SMALL_DATA_THRESHOLD`](crate::knn::SMALL_DATA_THRESHOLD) samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NnDescentParams {
  /// Number of random projection trees. `None` means `5 + floor(sqrt(n) / 20)`.
  pub n_trees: Option<usize>,

  /// Maximum descent rounds. `None` means `max(5, round(log2(n)))`.
  pub n_iters: Option<usize>,

  /// Cap on sampled candidates per point and round, further capped at `n_neighbors`.
  ///
  /// Default: 60
  pub max_candidates: usize,

  /// Early stop threshold, as a fraction of `n_neighbors * n_samples` heap updates.
  ///
  /// Default: 0.001
  pub delta: f32,

  /// Probability of skipping a candidate during a local join.
  ///
  /// Default: 0.5
  pub rho: f32,
}

impl Default for NnDescentParams {
  fn default() -> Self {
    Self {
      n_trees: None,
      n_iters: None,
      max_candidates: 60,
      delta: 0.001,
      rho: 0.5,
    }
  }
}

/// How a target vector passed to `fit` is blended into the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedParams {
  /// Neighbors used for the continuous target graph. `None` reuses `n_neighbors`.
  pub target_n_neighbors: Option<usize>,

  /// Weight of the target versus the data, in [0, 1]. 1.0 means the target
  /// completely dominates.
  ///
  /// Default: 0.5
  pub target_weight: f32,

  /// Penalty distance applied to edges touching a sample of unknown label.
  ///
  /// Default: 1.0
  pub unknown_dist: f32,
}

impl Default for SupervisedParams {
  fn default() -> Self {
    Self {
      target_n_neighbors: None,
      target_weight: 0.5,
      unknown_dist: 1.0,
    }
  }
}

/// Initial embedding strategy.
///
/// Only [`Init::Random`] is implemented; the others are rejected with
/// [`UmapError::Unsupported`](crate::UmapError::Unsupported).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Init {
  #[default]
  Random,
  Spectral,
  Custom(Array2<f32>),
}

/// Complete UMAP configuration.
///
/// Groups all parameters for dimensionality reduction into a coherent structure.
/// All parameter groups have sensible defaults and can be customized individually.
///
/// # Example
///
/// ```
/// use umap_engine::GraphParams;
/// use umap_engine::UmapConfig;
///
/// let config = UmapConfig {
///   n_components: 3,
///   graph: GraphParams {
///     n_neighbors: 30,
///     ..Default::default()
///   },
///   seed: Some(42),
///   ..Default::default()
/// };
/// assert_eq!(config.manifold.min_dist, 0.1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmapConfig {
  /// Number of dimensions in the output embedding.
  ///
  /// Must be >= 1.
  ///
  /// Default: 2
  pub n_components: usize,

  pub manifold: ManifoldParams,

  pub graph: GraphParams,

  pub optimization: OptimizationParams,

  pub nn_descent: NnDescentParams,

  pub supervised: SupervisedParams,

  pub init: Init,

  /// Worker threads. `None` runs on the global rayon pool. With `Some(1)` and a
  /// seed, results are reproducible bit for bit.
  pub n_threads: Option<usize>,

  /// Seed for every random decision. `None` draws one from the OS.
  pub seed: Option<u64>,

  /// Report progress at `info` instead of `debug` level.
  pub verbose: bool,
}

impl Default for UmapConfig {
  fn default() -> Self {
    Self {
      n_components: 2,
      manifold: ManifoldParams::default(),
      graph: GraphParams::default(),
      optimization: OptimizationParams::default(),
      nn_descent: NnDescentParams::default(),
      supervised: SupervisedParams::default(),
      init: Init::default(),
      n_threads: None,
      seed: None,
      verbose: false,
    }
  }
}
