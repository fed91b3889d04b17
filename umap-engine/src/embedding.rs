use crate::config::Init;
use crate::config::UmapConfig;
use crate::embedding_metric::EmbeddingMetric;
use crate::embedding_metric::EuclideanEmbedding;
use crate::error::Result;
use crate::error::UmapError;
use crate::knn::KnnGraph;
use crate::knn::NearestNeighbors;
use crate::knn::knn_from_distances;
use crate::knn::pairwise_distances;
use crate::manifold::LearnedManifold;
use crate::metric::Euclidean;
use crate::metric::Metric;
use crate::nn_search::NnSearch;
use crate::optimizer::Optimizer;
use crate::progress::LoggingObserver;
use crate::progress::ProgressObserver;
use crate::progress::ProgressTracker;
use crate::progress::Stage;
use crate::rp_tree::RpForest;
use crate::sparse::CooMatrix;
use crate::sparse::SparseMat;
use crate::sparse::l1_row_normalize;
use crate::umap::constants::DISCONNECTED_WARN_FRACTION;
use crate::umap::compute_membership_strengths::ComputeMembershipStrengths;
use crate::umap::find_ab_params::find_ab_params;
use crate::umap::fuzzy_simplicial_set::FuzzySimplicialSet;
use crate::umap::fuzzy_simplicial_set::disconnected_vertices;
use crate::umap::fuzzy_simplicial_set::find_disconnections;
use crate::umap::init_graph_transform::init_graph_transform;
use crate::umap::raise_disconnected_warning::raise_disconnected_warning;
use crate::umap::smooth_knn_dist::SmoothKnnDist;
use crate::umap::supervised::SupervisedFusion;
use crate::umap::supervised::Target;
use ndarray::Array2;
use ndarray::ArrayView2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::ThreadPoolBuilder;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Epochs between two progress reports while optimizing.
const EPOCHS_PER_REPORT: usize = 10;

/// UMAP dimensionality reduction algorithm.
///
/// This struct holds the configuration and metrics for UMAP. It can be reused
/// to fit multiple datasets with the same parameters.
///
/// # Example
///
/// ```
/// use ndarray::Array2;
/// use umap_engine::Umap;
/// use umap_engine::UmapConfig;
///
/// let data = Array2::from_shape_fn((60, 4), |(i, j)| ((i * 31 + j * 17) % 23) as f32);
/// let config = UmapConfig {
///   seed: Some(7),
///   ..Default::default()
/// };
/// let model = Umap::new(config).fit(data.view(), None)?;
/// assert_eq!(model.embedding().dim(), (60, 2));
/// # Ok::<(), umap_engine::UmapError>(())
/// ```
///
/// For checkpointed training, build the manifold with [`Umap::learn_manifold`]
/// and drive an [`Optimizer`] directly.
#[derive(Clone)]
pub struct Umap {
  config: UmapConfig,
  metric: Arc<dyn Metric>,
  output_metric: Arc<dyn EmbeddingMetric>,
  observers: Vec<Arc<dyn ProgressObserver>>,
}

impl fmt::Debug for Umap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Umap")
      .field("config", &self.config)
      .field("metric", &self.metric)
      .field("output_metric", &self.output_metric)
      .field("observers", &self.observers.len())
      .finish()
  }
}

/// The neighbor graph and search structures behind a manifold.
struct GraphParts {
  manifold: LearnedManifold,
  knn: KnnGraph,
  forest: Option<RpForest>,
  n_neighbors: usize,
}

impl Umap {
  /// Create a new UMAP instance with Euclidean input and output metrics.
  pub fn new(config: UmapConfig) -> Self {
    Self::with_metrics(config, Arc::new(Euclidean), Arc::new(EuclideanEmbedding))
  }

  /// Create a UMAP instance with custom distance metrics.
  ///
  /// # Arguments
  ///
  /// * `config` - UMAP configuration parameters
  /// * `metric` - Distance metric for input space (graph construction), see
  ///   [`metric_by_name`](crate::metric_by_name)
  /// * `output_metric` - Distance metric for output embedding space (optimization)
  pub fn with_metrics(
    config: UmapConfig,
    metric: Arc<dyn Metric>,
    output_metric: Arc<dyn EmbeddingMetric>,
  ) -> Self {
    Self {
      config,
      metric,
      output_metric,
      observers: Vec::new(),
    }
  }

  /// Register an observer for progress updates of later fits and transforms.
  pub fn add_progress_observer(&mut self, observer: Arc<dyn ProgressObserver>) {
    self.observers.push(observer);
  }

  pub fn config(&self) -> &UmapConfig {
    &self.config
  }

  /// Fit the model and return the embedding of `data`.
  pub fn fit_transform(&self, data: ArrayView2<f32>) -> Result<Array2<f32>> {
    Ok(self.fit(data, None)?.into_embedding())
  }

  /// Fit a sparse input. Rows are densified for distance evaluation, and the
  /// resulting model can't transform new points.
  pub fn fit_sparse(&self, data: &SparseMat, target: Option<&Target>) -> Result<FittedUmap> {
    let dense = data.to_dense();
    let mut fitted = self.fit(dense.view(), target)?;
    fitted.sparse_input = true;
    Ok(fitted)
  }

  /// Learn the manifold and optimize an embedding of it.
  ///
  /// `target`, if given, supervises the embedding: see
  /// [`SupervisedParams`](crate::SupervisedParams).
  ///
  /// Vertices the manifold leaves without any edge embed as NaN. A single
  /// sample embeds at the origin.
  pub fn fit(&self, data: ArrayView2<f32>, target: Option<&Target>) -> Result<FittedUmap> {
    self.validate_parameters()?;
    self.validate_input(data, target)?;
    let n_samples = data.nrows();
    let seed = self.seed();

    if n_samples == 1 {
      return Ok(FittedUmap {
        data: data.to_owned(),
        embedding: Array2::zeros((1, self.config.n_components)),
        manifold: None,
        knn: None,
        forest: None,
        search_graph: None,
        n_neighbors: 1,
        sparse_input: false,
        seed,
        config: self.config.clone(),
        metric: self.metric.clone(),
        output_metric: self.output_metric.clone(),
        tracker: Arc::new(self.tracker()),
      });
    }

    let started = Instant::now();
    let tracker = Arc::new(self.tracker());
    let fitted = self.run_in_pool(|| {
      let mut rng = StdRng::seed_from_u64(seed);
      let graph_seed: u64 = rng.random();
      let layout_seed: u64 = rng.random();

      let parts = self.build_graph(data, target, graph_seed, &tracker);
      let total_epochs = self
        .config
        .optimization
        .n_epochs
        .unwrap_or(if n_samples <= 10_000 { 500 } else { 200 });

      let init = Array2::from_shape_fn((n_samples, self.config.n_components), |_| {
        rng.random_range(-10.0f32..10.0)
      });
      let mut optimizer = Optimizer::new(
        parts.manifold,
        init,
        total_epochs,
        &self.config,
        self.output_metric.metric_type(),
        layout_seed,
      );
      self.optimize(&mut optimizer, Stage::Optimization, &tracker);

      let (manifold, mut embedding) = optimizer.into_parts();
      for i in disconnected_vertices(&manifold.graph) {
        embedding.row_mut(i).fill(f32::NAN);
      }
      let search_graph = parts.forest.as_ref().map(|_| parts.knn.search_graph());

      FittedUmap {
        data: data.to_owned(),
        embedding,
        manifold: Some(manifold),
        knn: Some(parts.knn),
        forest: parts.forest,
        search_graph,
        n_neighbors: parts.n_neighbors,
        sparse_input: false,
        seed,
        config: self.config.clone(),
        metric: self.metric.clone(),
        output_metric: self.output_metric.clone(),
        tracker: tracker.clone(),
      }
    })?;

    info!(
      duration_ms = started.elapsed().as_millis(),
      n_samples,
      n_components = self.config.n_components,
      "fit complete"
    );
    Ok(fitted)
  }

  /// Learn the manifold structure from high-dimensional data.
  ///
  /// This is the expensive graph construction phase. The result can be
  /// cached, serialized, and handed to [`Optimizer::new`] to run (and
  /// checkpoint) the layout separately.
  pub fn learn_manifold(
    &self,
    data: ArrayView2<f32>,
    target: Option<&Target>,
  ) -> Result<LearnedManifold> {
    self.validate_parameters()?;
    self.validate_input(data, target)?;
    if data.nrows() < 2 {
      return Err(UmapError::InvalidParameter(
        "learning a manifold needs at least 2 samples".to_string(),
      ));
    }
    let seed = self.seed();
    let tracker = self.tracker();
    self.run_in_pool(|| self.build_graph(data, target, seed, &tracker).manifold)
  }

  fn build_graph(
    &self,
    data: ArrayView2<f32>,
    target: Option<&Target>,
    seed: u64,
    tracker: &ProgressTracker,
  ) -> GraphParts {
    let n_samples = data.nrows();
    let graph_params = &self.config.graph;
    let n_neighbors = self.effective_n_neighbors(n_samples);
    let n_threads = self
      .config
      .n_threads
      .unwrap_or_else(rayon::current_num_threads);

    let mut rng = StdRng::seed_from_u64(seed);
    let knn_seed: u64 = rng.random();
    let target_seed: u64 = rng.random();

    let (knn, forest) = NearestNeighbors::builder()
      .data(data.view())
      .metric(self.metric.as_ref())
      .n_neighbors(n_neighbors)
      .params(&self.config.nn_descent)
      .n_threads(n_threads)
      .seed(knn_seed)
      .progress(tracker)
      .build()
      .exec();

    let disconnection_distance = graph_params
      .disconnection_distance
      .unwrap_or_else(|| self.metric.disconnection_threshold());
    let knn_disconnections = find_disconnections(knn.dists.view(), disconnection_distance);
    let edges_removed = knn_disconnections.len();

    let (mut graph, sigmas, rhos) = FuzzySimplicialSet::builder()
      .knn_indices(knn.indices.view())
      .knn_dists(knn.dists.view())
      .n_neighbors(n_neighbors)
      .knn_disconnections(&knn_disconnections)
      .set_op_mix_ratio(graph_params.set_op_mix_ratio)
      .local_connectivity(graph_params.local_connectivity)
      .build()
      .exec();
    if let Some(target) = target {
      graph = SupervisedFusion::builder()
        .graph(&graph)
        .target(target)
        .params(&self.config.supervised)
        .n_neighbors(n_neighbors)
        .nn_descent(&self.config.nn_descent)
        .n_threads(n_threads)
        .seed(target_seed)
        .build()
        .exec();
    }

    debug!(
      n_samples,
      n_neighbors,
      edges_removed,
      nnz = graph.nnz(),
      supervised = target.is_some(),
      "manifold graph ready"
    );
    raise_disconnected_warning(
      edges_removed,
      disconnected_vertices(&graph).len(),
      disconnection_distance,
      n_samples,
      DISCONNECTED_WARN_FRACTION,
    );

    let (a, b) = self.curve_params();
    GraphParts {
      manifold: LearnedManifold {
        graph,
        sigmas,
        rhos,
        n_vertices: n_samples,
        a,
        b,
      },
      knn,
      forest,
      n_neighbors,
    }
  }

  fn optimize(&self, optimizer: &mut Optimizer, stage: Stage, tracker: &ProgressTracker) {
    let started = Instant::now();
    let total = optimizer.total_epochs();
    while optimizer.remaining_epochs() > 0 {
      let n = optimizer.remaining_epochs().min(EPOCHS_PER_REPORT);
      optimizer.step_epochs(n, self.output_metric.as_ref());
      tracker.report(stage, optimizer.current_epoch(), total);
    }
    info!(
      duration_ms = started.elapsed().as_millis(),
      %stage,
      n_epochs = total,
      n_edges = optimizer.n_edges(),
      "layout optimization complete"
    );
  }

  fn curve_params(&self) -> (f32, f32) {
    match (self.config.manifold.a, self.config.manifold.b) {
      (Some(a), Some(b)) => (a, b),
      _ => find_ab_params(self.config.manifold.spread, self.config.manifold.min_dist),
    }
  }

  fn effective_n_neighbors(&self, n_samples: usize) -> usize {
    let requested = self.config.graph.n_neighbors;
    let limit = (n_samples - 1).max(2).min(n_samples);
    if requested > limit {
      warn!(
        requested,
        n_samples,
        using = limit,
        "n_neighbors is larger than the dataset size, truncating"
      );
      limit
    } else {
      requested
    }
  }

  fn seed(&self) -> u64 {
    self.config.seed.unwrap_or_else(|| rand::rng().random())
  }

  fn tracker(&self) -> ProgressTracker {
    let mut observers: Vec<Arc<dyn ProgressObserver>> = vec![Arc::new(LoggingObserver {
      verbose: self.config.verbose,
    })];
    observers.extend(self.observers.iter().cloned());
    ProgressTracker::new(observers)
  }

  fn run_in_pool<T, F>(&self, f: F) -> Result<T>
  where
    T: Send,
    F: FnOnce() -> T + Send,
  {
    run_in_pool(self.config.n_threads, f)
  }

  fn validate_input(&self, data: ArrayView2<f32>, target: Option<&Target>) -> Result<()> {
    let n_samples = data.nrows();
    if n_samples == 0 {
      return Err(UmapError::InvalidParameter("input has no samples".to_string()));
    }
    if data.iter().any(|v| !v.is_finite()) {
      return Err(UmapError::NonFiniteInput);
    }
    if self.metric.is_precomputed() && data.ncols() != n_samples {
      return Err(UmapError::ShapeMismatch(format!(
        "precomputed distances must be square, got {} x {}",
        n_samples,
        data.ncols()
      )));
    }
    if let Some(target) = target {
      if target.len() != n_samples {
        return Err(UmapError::ShapeMismatch(format!(
          "target has {} entries but data has {} samples",
          target.len(),
          n_samples
        )));
      }
      if let Target::Continuous(values) = target {
        if values.iter().any(|v| !v.is_finite()) {
          return Err(UmapError::NonFiniteInput);
        }
      }
    }
    Ok(())
  }

  fn validate_parameters(&self) -> Result<()> {
    let config = &self.config;
    let invalid = |msg: String| Err(UmapError::InvalidParameter(msg));

    if config.graph.n_neighbors < 2 {
      return invalid(format!(
        "n_neighbors must be >= 2, got {}",
        config.graph.n_neighbors
      ));
    }
    if config.n_components < 1 {
      return invalid(format!(
        "n_components must be >= 1, got {}",
        config.n_components
      ));
    }
    if let Some(n_epochs) = config.optimization.n_epochs {
      if n_epochs <= 10 {
        return invalid(format!("n_epochs must be > 10, got {n_epochs}"));
      }
    }
    if !(0.0..=1.0).contains(&config.graph.set_op_mix_ratio) {
      return invalid(format!(
        "set_op_mix_ratio must be between 0.0 and 1.0, got {}",
        config.graph.set_op_mix_ratio
      ));
    }
    if !(config.manifold.min_dist >= 0.0) {
      return invalid(format!(
        "min_dist cannot be negative, got {}",
        config.manifold.min_dist
      ));
    }
    if !(config.manifold.spread > 0.0) {
      return invalid(format!(
        "spread must be positive, got {}",
        config.manifold.spread
      ));
    }
    if config.manifold.min_dist > config.manifold.spread {
      return invalid(format!(
        "min_dist ({}) must be <= spread ({})",
        config.manifold.min_dist, config.manifold.spread
      ));
    }
    if config.n_threads == Some(0) {
      return invalid("n_threads must be >= 1".to_string());
    }
    if config.optimization.negative_sample_rate == 0 {
      return invalid("negative_sample_rate must be > 0".to_string());
    }
    if !(config.optimization.learning_rate > 0.0) {
      return invalid(format!(
        "learning_rate must be positive, got {}",
        config.optimization.learning_rate
      ));
    }
    if !(config.optimization.repulsion_strength >= 0.0) {
      return invalid(format!(
        "repulsion_strength cannot be negative, got {}",
        config.optimization.repulsion_strength
      ));
    }
    if !(config.graph.local_connectivity >= 0.0) {
      return invalid(format!(
        "local_connectivity cannot be negative, got {}",
        config.graph.local_connectivity
      ));
    }
    if !(0.0..=1.0).contains(&config.supervised.target_weight) {
      return invalid(format!(
        "target_weight must be between 0.0 and 1.0, got {}",
        config.supervised.target_weight
      ));
    }
    match config.init {
      Init::Random => Ok(()),
      Init::Spectral => Err(UmapError::Unsupported(
        "spectral initialization".to_string(),
      )),
      Init::Custom(_) => Err(UmapError::Unsupported(
        "custom initialization".to_string(),
      )),
    }
  }
}

/// A fitted UMAP model: the embedding plus everything needed to place new
/// points into it.
///
/// Besides the embedding this keeps the training data, its neighbor graph,
/// the random projection forest (for large inputs) and the learned manifold.
#[derive(Debug, Clone)]
pub struct FittedUmap {
  pub(crate) data: Array2<f32>,
  pub(crate) embedding: Array2<f32>,
  pub(crate) manifold: Option<LearnedManifold>,
  pub(crate) knn: Option<KnnGraph>,
  pub(crate) forest: Option<RpForest>,
  pub(crate) search_graph: Option<SparseMat>,
  pub(crate) n_neighbors: usize,
  pub(crate) sparse_input: bool,
  pub(crate) seed: u64,
  pub(crate) config: UmapConfig,
  pub(crate) metric: Arc<dyn Metric>,
  pub(crate) output_metric: Arc<dyn EmbeddingMetric>,
  pub(crate) tracker: Arc<ProgressTracker>,
}

impl FittedUmap {
  /// Get a view of the computed embedding.
  ///
  /// Each row represents one input sample in the low-dimensional space.
  pub fn embedding(&self) -> ArrayView2<'_, f32> {
    self.embedding.view()
  }

  /// Consume the model and return the embedding, avoiding a copy.
  pub fn into_embedding(self) -> Array2<f32> {
    self.embedding
  }

  /// Get a reference to the learned manifold. `None` for a single-sample fit.
  pub fn manifold(&self) -> Option<&LearnedManifold> {
    self.manifold.as_ref()
  }

  /// The k-NN graph of the training data. `None` for a single-sample fit.
  pub fn knn(&self) -> Option<&KnnGraph> {
    self.knn.as_ref()
  }

  /// Number of neighbors actually used, after clamping to the sample count.
  pub fn n_neighbors(&self) -> usize {
    self.n_neighbors
  }

  /// Get a reference to the configuration used for this fit.
  pub fn config(&self) -> &UmapConfig {
    &self.config
  }

  /*
    Transform new data points into the existing embedding space.

    The new points' neighbors among the training data come from the exact
    distance matrix for small training sets, and otherwise from the training
    forest followed by a search over the training neighbor graph. Their
    membership strengths are computed one-sided (local_connectivity - 1), the
    points are initialized at the weighted average of their neighbors'
    embeddings, and a short optimization places them against the fixed
    training embedding.

    Rows with no neighbor in range of the disconnection distance embed as NaN.
  */
  pub fn transform(&self, new_data: ArrayView2<f32>) -> Result<Array2<f32>> {
    if self.metric.is_precomputed() {
      return Err(UmapError::Unsupported(
        "transform with a precomputed metric".to_string(),
      ));
    }
    if self.sparse_input {
      return Err(UmapError::Unsupported(
        "transform of a model fitted on sparse input".to_string(),
      ));
    }
    let (Some(manifold), Some(knn)) = (&self.manifold, &self.knn) else {
      return Err(UmapError::Unsupported(
        "transform of a model fitted on a single sample".to_string(),
      ));
    };
    if new_data.ncols() != self.data.ncols() {
      return Err(UmapError::ShapeMismatch(format!(
        "new data has {} features but the model was fitted on {}",
        new_data.ncols(),
        self.data.ncols()
      )));
    }
    if new_data.iter().any(|v| !v.is_finite()) {
      return Err(UmapError::NonFiniteInput);
    }
    let n_new = new_data.nrows();
    if n_new == 0 {
      return Ok(Array2::zeros((0, self.config.n_components)));
    }

    let started = Instant::now();
    let tracker = self.tracker.as_ref();
    let embedding = run_in_pool(self.config.n_threads, || {
      let mut rng = StdRng::seed_from_u64(self.seed);
      let search_seed: u64 = rng.random();
      let layout_seed: u64 = rng.random();

      let new_knn = match (&self.forest, &self.search_graph) {
        (Some(forest), Some(search_graph)) => NnSearch::builder()
          .data(self.data.view())
          .queries(new_data.view())
          .metric(self.metric.as_ref())
          .search_graph(search_graph)
          .forest(Some(forest))
          .n_neighbors(self.n_neighbors)
          .seed(search_seed)
          .progress(Some(tracker))
          .build()
          .exec(),
        _ => {
          let dmat = pairwise_distances(new_data, self.data.view(), self.metric.as_ref());
          knn_from_distances(dmat.view(), self.n_neighbors)
        }
      };

      let disconnection_distance = self
        .config
        .graph
        .disconnection_distance
        .unwrap_or_else(|| self.metric.disconnection_threshold());
      let knn_disconnections = find_disconnections(new_knn.dists.view(), disconnection_distance);

      let local_connectivity = (self.config.graph.local_connectivity - 1.0).max(0.0);
      let (sigmas, rhos) = SmoothKnnDist::builder()
        .distances(new_knn.dists.view())
        .k(self.n_neighbors)
        .local_connectivity(local_connectivity)
        .build()
        .exec();
      let graph = ComputeMembershipStrengths::builder()
        .knn_indices(new_knn.indices.view())
        .knn_dists(new_knn.dists.view())
        .knn_disconnections(&knn_disconnections)
        .sigmas(sigmas.view())
        .rhos(rhos.view())
        .n_cols(knn.n_samples())
        .bipartite(true)
        .build()
        .exec();
      let graph = self.without_nan_anchors(&graph);

      let init = init_graph_transform(&graph, self.embedding.view());
      let total_epochs = match self.config.optimization.n_epochs {
        Some(n_epochs) => (n_epochs / 3).max(1),
        None if n_new <= 10_000 => 100,
        None => 30,
      };

      let mut optimizer = Optimizer::with_reference(
        LearnedManifold {
          graph: l1_row_normalize(&graph),
          sigmas,
          rhos,
          n_vertices: manifold.n_vertices(),
          a: manifold.a,
          b: manifold.b,
        },
        init,
        self.embedding.clone(),
        total_epochs,
        &self.config,
        self.output_metric.metric_type(),
        layout_seed,
      );
      let started = Instant::now();
      while optimizer.remaining_epochs() > 0 {
        let n = optimizer.remaining_epochs().min(EPOCHS_PER_REPORT);
        optimizer.step_epochs(n, self.output_metric.as_ref());
        tracker.report(Stage::Transform, optimizer.current_epoch(), total_epochs);
      }
      info!(
        duration_ms = started.elapsed().as_millis(),
        n_epochs = total_epochs,
        n_edges = optimizer.n_edges(),
        "transform optimization complete"
      );
      optimizer.into_parts().1
    })?;

    info!(
      duration_ms = started.elapsed().as_millis(),
      n_new, "transform complete"
    );
    Ok(embedding)
  }

  /// Drop edges to training points that were embedded as NaN.
  fn without_nan_anchors(&self, graph: &SparseMat) -> SparseMat {
    let nan_rows: Vec<bool> = self
      .embedding
      .rows()
      .into_iter()
      .map(|row| row.iter().any(|v| v.is_nan()))
      .collect();
    if !nan_rows.iter().any(|&nan| nan) {
      return graph.clone();
    }
    let mut coo = CooMatrix::from_csr(graph);
    coo.map_entries_in_place(|_, j, v| if nan_rows[j] { 0.0 } else { v });
    coo.eliminate_zeros();
    coo.to_csr()
  }
}

/// Run `f` on a dedicated pool of `n_threads` workers, or on the global pool.
fn run_in_pool<T, F>(n_threads: Option<usize>, f: F) -> Result<T>
where
  T: Send,
  F: FnOnce() -> T + Send,
{
  match n_threads {
    Some(n) => {
      let pool = ThreadPoolBuilder::new()
        .num_threads(n)
        .build()
        .map_err(|e| UmapError::ThreadPool(e.to_string()))?;
      Ok(pool.install(f))
    }
    None => Ok(f()),
  }
}
