use super::EdgeSchedule;
use super::Edges;
use super::EpochParams;
use crate::embedding_metric::EmbeddingMetric;
use ndarray::ArrayView2;
use ndarray::ArrayViewMut2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Run one epoch of SGD with an arbitrary embedding metric.
///
/// Slower than the Euclidean specialization: every distance goes through
/// [`EmbeddingMetric::distance`] and the epoch always runs on one thread with
/// a generator seeded from `params.seed`, so it is reproducible regardless of
/// `params.parallel`.
///
/// With `tail_embedding = None` the heads are embedded against themselves and
/// the tail of each attracted edge moves too. With a reference embedding only
/// `head_embedding` changes.
pub fn optimize_layout_generic_single_epoch(
  head_embedding: &mut ArrayViewMut2<f32>,
  tail_embedding: Option<ArrayView2<f32>>,
  edges: Edges,
  schedule: &mut EdgeSchedule,
  params: &EpochParams,
  output_metric: &dyn EmbeddingMetric,
) {
  let EpochParams {
    a,
    b,
    gamma,
    alpha,
    epoch,
    seed,
    ..
  } = *params;
  let n = epoch as f64;
  let dim = head_embedding.ncols();
  let move_other = tail_embedding.is_none();
  let n_vertices = match &tail_embedding {
    Some(tail) => tail.nrows(),
    None => head_embedding.nrows(),
  };
  let mut rng = StdRng::seed_from_u64(seed);

  for i in 0..schedule.len() {
    let epochs_per_sample = schedule.epochs_per_sample[i];
    if epochs_per_sample <= 0.0 || schedule.epoch_of_next_sample[i] > n {
      continue;
    }
    let j = edges.head[i] as usize;
    let k = edges.tail[i] as usize;

    let other = match &tail_embedding {
      Some(tail) => tail.row(k).to_owned(),
      None => head_embedding.row(k).to_owned(),
    };
    let current = head_embedding.row(j).to_owned();
    let (dist_output, grad_dist_output) = output_metric.distance(current.view(), other.view());
    let (_, rev_grad_dist_output) = output_metric.distance(other.view(), current.view());

    let w_l = if dist_output > 0.0 {
      1.0 / (1.0 + a * f32::powf(dist_output, 2.0 * b))
    } else {
      1.0
    };
    let grad_coeff = 2.0 * b * (w_l - 1.0) / (dist_output + 1e-6);

    for d in 0..dim {
      let grad_d = (grad_coeff * grad_dist_output[d]).clamp(-4.0, 4.0);
      head_embedding[(j, d)] += grad_d * alpha;
      if move_other {
        let grad_d = (grad_coeff * rev_grad_dist_output[d]).clamp(-4.0, 4.0);
        head_embedding[(k, d)] += grad_d * alpha;
      }
    }

    schedule.epoch_of_next_sample[i] += epochs_per_sample;

    let epochs_per_negative_sample = schedule.epochs_per_negative_sample[i];
    let n_neg_samples =
      ((n - schedule.epoch_of_next_negative_sample[i]) / epochs_per_negative_sample) as usize;

    for _ in 0..n_neg_samples {
      let k = rng.random_range(0..n_vertices);
      if move_other && j == k {
        continue;
      }
      let other = match &tail_embedding {
        Some(tail) => tail.row(k).to_owned(),
        None => head_embedding.row(k).to_owned(),
      };
      let (dist_output, grad_dist_output) =
        output_metric.distance(head_embedding.row(j), other.view());
      if !dist_output.is_finite() {
        continue;
      }

      let w_l = if dist_output > 0.0 {
        1.0 / (1.0 + a * f32::powf(dist_output, 2.0 * b))
      } else {
        1.0
      };
      let grad_coeff = gamma * 2.0 * b * w_l / (dist_output + 1e-6);

      for d in 0..dim {
        let grad_d = (grad_coeff * grad_dist_output[d]).clamp(-4.0, 4.0);
        head_embedding[(j, d)] += grad_d * alpha;
      }
    }

    schedule.epoch_of_next_negative_sample[i] += n_neg_samples as f64 * epochs_per_negative_sample;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::embedding_metric::ManhattanEmbedding;
  use ndarray::Array1;
  use ndarray::array;

  fn params(epoch: usize) -> EpochParams {
    EpochParams {
      a: 1.577,
      b: 0.895,
      gamma: 1.0,
      alpha: 0.5,
      epoch,
      seed: 3,
      parallel: true,
    }
  }

  #[test]
  fn manhattan_layout_pulls_neighbors_together() {
    let mut embedding = array![[0.0f32, 0.0], [4.0, 4.0], [-20.0, 20.0]];
    let head = Array1::from(vec![0u32, 1]);
    let tail = Array1::from(vec![1u32, 0]);
    let edges = Edges {
      head: head.view(),
      tail: tail.view(),
    };
    let mut schedule = EdgeSchedule::new(array![1.0, 1.0], 2.0);
    let l1 = |e: &ndarray::Array2<f32>| (e[(1, 0)] - e[(0, 0)]).abs() + (e[(1, 1)] - e[(0, 1)]).abs();
    let before = l1(&embedding);
    for epoch in 1..10 {
      optimize_layout_generic_single_epoch(
        &mut embedding.view_mut(),
        None,
        edges,
        &mut schedule,
        &params(epoch),
        &ManhattanEmbedding,
      );
    }
    assert!(l1(&embedding) < before);
  }

  #[test]
  fn reference_row_sharing_head_index_still_repels() {
    let reference = array![[0.0f32, 0.0]];
    let mut points = array![[0.5f32, 0.0]];
    let head = Array1::from(vec![0u32]);
    let tail = Array1::from(vec![0u32]);
    let mut schedule = EdgeSchedule::new(array![1.0], 5.0);
    let params = EpochParams {
      alpha: 0.01,
      ..params(1)
    };
    optimize_layout_generic_single_epoch(
      &mut points.view_mut(),
      Some(reference.view()),
      Edges {
        head: head.view(),
        tail: tail.view(),
      },
      &mut schedule,
      &params,
      &ManhattanEmbedding,
    );
    assert!(points[(0, 0)] > 0.5, "got {}", points[(0, 0)]);
    assert_eq!(points[(0, 1)], 0.0);
  }

  #[test]
  fn generic_epoch_is_reproducible() {
    let reference = array![[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let head = Array1::from(vec![0u32, 0, 1]);
    let tail = Array1::from(vec![0u32, 2, 1]);
    let run = || {
      let mut points = array![[3.0f32, 3.0], [-2.0, 1.0]];
      let mut schedule = EdgeSchedule::new(array![1.0, 2.0, 1.0], 5.0);
      for epoch in 1..8 {
        optimize_layout_generic_single_epoch(
          &mut points.view_mut(),
          Some(reference.view()),
          Edges {
            head: head.view(),
            tail: tail.view(),
          },
          &mut schedule,
          &params(epoch),
          &ManhattanEmbedding,
        );
      }
      points
    };
    assert_eq!(run(), run());
  }
}
