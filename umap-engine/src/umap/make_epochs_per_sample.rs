use ndarray::Array1;
use ndarray::ArrayView1;

/*
  Given a set of weights and number of epochs generate the number of
  epochs per sample for each weight.

  Parameters
  ----------
  weights: array of shape (n_1_simplices)
      The weights of how much we wish to sample each 1-simplex.

  n_epochs: int
      The total number of epochs we want to train for.

  Returns
  -------
  An array of number of epochs per sample, one for each 1-simplex. The
  strongest edge fires every epoch; an edge of weight w fires every
  max_weight / w epochs. Edges of weight 0 get -1 and never fire.
*/
pub fn make_epochs_per_sample(weights: ArrayView1<f32>, n_epochs: usize) -> Array1<f64> {
  let max_weight = weights.iter().copied().fold(0.0f32, f32::max);
  weights.mapv(|w| {
    let n_samples = n_epochs as f64 * (w as f64 / max_weight as f64);
    if n_samples > 0.0 {
      n_epochs as f64 / n_samples
    } else {
      -1.0
    }
  })
}
