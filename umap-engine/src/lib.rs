//! Fast, parallel Rust implementation of the UMAP dimensionality reduction algorithm.
//!
//! The full pipeline runs in-crate: k-nearest neighbors (exact for small
//! inputs, random projection forest plus nearest neighbor descent otherwise),
//! the fuzzy simplicial set, optional supervision by a target vector, and
//! stochastic gradient descent on the layout. Fitted models can place new
//! points into an existing embedding.
//!
//! # Example
//!
//! ```
//! use ndarray::Array2;
//! use umap_engine::Umap;
//! use umap_engine::UmapConfig;
//!
//! let data = Array2::from_shape_fn((80, 5), |(i, j)| ((i * 13 + j * 7) % 19) as f32);
//! let config = UmapConfig {
//!   n_threads: Some(1),
//!   seed: Some(42),
//!   ..Default::default()
//! };
//! let model = Umap::new(config).fit(data.view(), None)?;
//! let placed = model.transform(data.slice(ndarray::s![..3, ..]))?;
//! assert_eq!(placed.dim(), (3, 2));
//! # Ok::<(), umap_engine::UmapError>(())
//! ```
//!
//! # Features
//!
//! - **Parallel everywhere**: forest construction, descent, graph building and
//!   Hogwild! SGD on a rayon pool sized by `n_threads`
//! - **Reproducible**: one thread plus a seed gives bit-identical results
//! - **Extensible metrics**: custom input distances via [`Metric`], custom
//!   embedding distances via [`EmbeddingMetric`]
//! - **Checkpointing**: [`Optimizer`] state is serde serializable
//!
//! # Limitations
//!
//! - Random initialization only ([`Init::Spectral`] is rejected)
//! - Sparse inputs are densified and can't be transformed afterwards

// Public modules
pub mod config;
pub mod embedding_metric;
pub mod error;
pub mod metric;
pub mod progress;
pub mod sparse;

// Public re-exports (primary API)
pub use config::GraphParams;
pub use config::Init;
pub use config::ManifoldParams;
pub use config::NnDescentParams;
pub use config::OptimizationParams;
pub use config::SupervisedParams;
pub use config::UmapConfig;
pub use embedding::FittedUmap;
pub use embedding::Umap;
pub use embedding_metric::EmbeddingMetric;
pub use embedding_metric::EuclideanEmbedding;
pub use embedding_metric::ManhattanEmbedding;
pub use embedding_metric::MetricType;
pub use error::Result;
pub use error::UmapError;
pub use knn::KnnGraph;
pub use manifold::LearnedManifold;
pub use metric::Metric;
pub use metric::metric_by_name;
pub use optimizer::Optimizer;
pub use progress::LoggingObserver;
pub use progress::ProgressObserver;
pub use progress::Stage;
pub use sparse::CooMatrix;
pub use sparse::SparseMat;
pub use umap::supervised::Target;

// Internal modules (not exposed)
mod embedding;
mod layout;
mod nn_search;
mod umap;

// Public modules (for advanced users)
pub mod heap;
pub mod knn;
pub mod manifold;
pub mod nn_descent;
pub mod optimizer;
pub mod rp_tree;
