use crate::sparse::CooMatrix;
use crate::sparse::SparseMat;
use ndarray::Array2;
use ndarray::ArrayView2;
use ndarray::Axis;
use rayon::prelude::*;

/*
  Place new points relative to the trained embedding using the bipartite
  graph of membership strengths between them and the training samples.

  A row with no neighbors in the training set embeds as NaN. A row with an
  edge of strength exactly 1 (the new point coincides with a training point)
  takes that point's coordinates. Everything else is the strength-weighted
  average of its neighbors' coordinates.

  Parameters
  ----------
  graph: csr matrix of shape (n_new_samples, n_samples)
      Strengths in [0, 1], not normalized.

  embedding: array of shape (n_samples, dim)
      Embedding of the training data.

  Returns
  -------
  Array of shape (n_new_samples, dim) with the initial coordinates.
*/
pub fn init_graph_transform(graph: &SparseMat, embedding: ArrayView2<f32>) -> Array2<f32> {
  let weights = CooMatrix::from_csr(graph).l1_row_normalize();
  let mut result = weights.multiply_dense(embedding);

  result
    .axis_iter_mut(Axis(0))
    .into_par_iter()
    .enumerate()
    .for_each(|(i, mut out)| {
      let Some(row) = graph.outer_view(i).filter(|row| row.nnz() > 0) else {
        out.fill(f32::NAN);
        return;
      };
      if let Some((col, _)) = row.iter().find(|&(_, &v)| v == 1.0) {
        out.assign(&embedding.row(col));
      }
    });

  result
}
