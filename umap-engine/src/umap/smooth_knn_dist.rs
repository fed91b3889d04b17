use super::constants::MIN_K_DIST_SCALE;
use super::constants::SMOOTH_K_TOLERANCE;
use ndarray::Array1;
use ndarray::ArrayView1;
use ndarray::ArrayView2;
use rayon::prelude::*;
use typed_builder::TypedBuilder;

#[derive(TypedBuilder, Debug)]
pub struct SmoothKnnDist<'a> {
  distances: ArrayView2<'a, f32>,
  k: usize,
  #[builder(default = 64)]
  n_iter: usize,
  #[builder(default = 1.0)]
  local_connectivity: f32,
  #[builder(default = 1.0)]
  bandwidth: f32,
}

impl<'a> SmoothKnnDist<'a> {
  /*
    Compute a continuous version of the distance to the kth nearest
    neighbor, so that the fuzzy set built around each point has cardinality
    close to log2(k) * bandwidth.

    Parameters
    ----------
    distances: array of shape (n_samples, n_neighbors)
        Sorted distances to each sample's nearest neighbors. The first column
        is skipped by the bisection (it is the sample itself during fit).
        Missing neighbors are stored as infinity and contribute nothing.

    k: The number of nearest neighbors to approximate for.

    n_iter: Maximum bisection steps for each sigma.

    local_connectivity: Number of neighbors each point is assumed to be fully
        connected to. Fractional values interpolate between neighbor distances.
        Zero gives rho = 0 for every point.

    bandwidth: Scale on the target cardinality.

    Returns
    -------
    sigmas: array of shape (n_samples,)
        Bandwidth of each point's exponential kernel, floored at
        MIN_K_DIST_SCALE times the mean neighbor distance.

    rhos: array of shape (n_samples,)
        Distance to the local_connectivity-th nonzero neighbor.
  */
  pub fn exec(self) -> (Array1<f32>, Array1<f32>) {
    let SmoothKnnDist {
      distances,
      k,
      n_iter,
      local_connectivity,
      bandwidth,
    } = self;

    let n_samples = distances.nrows();
    let target = (k as f32).log2() * bandwidth;
    let mean_distances = finite_mean(distances.iter().copied());

    // Each sample is independent; avoid allocating inside the loop.
    let results: Vec<(f32, f32)> = (0..n_samples)
      .into_par_iter()
      .map(|i| {
        let ith_distances = distances.row(i);
        let rho_i = local_rho(ith_distances, local_connectivity);

        let mut lo = 0.0;
        let mut hi = f32::INFINITY;
        let mut mid = 1.0;
        for _ in 0..n_iter {
          let mut psum = 0.0;
          for &dist in ith_distances.iter().skip(1) {
            let d = dist - rho_i;
            if d > 0.0 {
              psum += f32::exp(-(d / mid));
            } else {
              psum += 1.0;
            }
          }

          if f32::abs(psum - target) < SMOOTH_K_TOLERANCE {
            break;
          }

          if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
          } else {
            lo = mid;
            if hi == f32::INFINITY {
              mid *= 2.0;
            } else {
              mid = (lo + hi) / 2.0;
            }
          }
        }

        let mut sigma_i = mid;
        let floor = if rho_i > 0.0 {
          MIN_K_DIST_SCALE * finite_mean(ith_distances.iter().copied())
        } else {
          MIN_K_DIST_SCALE * mean_distances
        };
        if sigma_i < floor {
          sigma_i = floor;
        }

        (sigma_i, rho_i)
      })
      .collect();

    let (sigmas, rhos): (Vec<f32>, Vec<f32>) = results.into_iter().unzip();
    (Array1::from(sigmas), Array1::from(rhos))
  }
}

/// Distance to the `local_connectivity`-th positive neighbor, interpolated for
/// fractional values. Rows with fewer positive neighbors use the largest one.
fn local_rho(row: ArrayView1<f32>, local_connectivity: f32) -> f32 {
  let mut non_zero_count = 0usize;
  let mut max_non_zero = 0.0f32;
  for &d in row.iter() {
    if d > 0.0 && d.is_finite() {
      non_zero_count += 1;
      max_non_zero = max_non_zero.max(d);
    }
  }

  if non_zero_count as f32 >= local_connectivity {
    let index = local_connectivity.floor() as usize;
    let interpolation = local_connectivity - local_connectivity.floor();
    // nth(0) is the first positive distance.
    let nth = |n: usize| {
      row
        .iter()
        .copied()
        .filter(|&d| d > 0.0 && d.is_finite())
        .nth(n)
        .unwrap_or(0.0)
    };
    if index > 0 {
      let mut rho = nth(index - 1);
      if interpolation > SMOOTH_K_TOLERANCE {
        rho += interpolation * (nth(index) - rho);
      }
      rho
    } else {
      interpolation * nth(0)
    }
  } else if non_zero_count > 0 {
    max_non_zero
  } else {
    0.0
  }
}

fn finite_mean(values: impl Iterator<Item = f32>) -> f32 {
  let (sum, count) = values
    .filter(|d| d.is_finite())
    .fold((0.0f64, 0usize), |(s, c), d| (s + d as f64, c + 1));
  if count == 0 { 0.0 } else { (sum / count as f64) as f32 }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;
  use ndarray::array;

  fn sample() -> ndarray::Array2<f32> {
    array![
      [0.0, 1.0, 2.0, 3.0, 4.0],
      [0.0, 0.5, 0.7, 2.0, 9.0],
      [0.0, 3.0, 3.0, 3.5, f32::INFINITY],
    ]
  }

  #[test]
  fn rho_is_first_positive_distance() {
    let d = sample();
    let (sigmas, rhos) = SmoothKnnDist::builder()
      .distances(d.view())
      .k(5)
      .build()
      .exec();
    assert_eq!(rhos.to_vec(), vec![1.0, 0.5, 3.0]);
    assert!(sigmas.iter().all(|&s| s > 0.0 && s.is_finite()));
  }

  #[test]
  fn bisection_hits_target_cardinality() {
    let d = sample();
    let (sigmas, rhos) = SmoothKnnDist::builder()
      .distances(d.view())
      .k(5)
      .build()
      .exec();
    let target = 5f32.log2();
    let row = d.row(0);
    let psum: f32 = row
      .iter()
      .skip(1)
      .map(|&x| {
        let v = x - rhos[0];
        if v > 0.0 { (-v / sigmas[0]).exp() } else { 1.0 }
      })
      .sum();
    assert_relative_eq!(psum, target, epsilon = 1e-3);
  }

  #[test]
  fn rho_grows_with_local_connectivity() {
    let d = sample();
    let mut previous = vec![f32::NEG_INFINITY; d.nrows()];
    for lc in [0.0f32, 0.5, 1.0, 1.5, 2.0, 3.0] {
      let (_, rhos) = SmoothKnnDist::builder()
        .distances(d.view())
        .k(5)
        .local_connectivity(lc)
        .build()
        .exec();
      for (p, r) in previous.iter_mut().zip(rhos.iter()) {
        assert!(*r >= *p, "rho decreased at local_connectivity {lc}");
        *p = *r;
      }
    }
  }

  #[test]
  fn zero_local_connectivity_gives_zero_rho() {
    let d = sample();
    let (sigmas, rhos) = SmoothKnnDist::builder()
      .distances(d.view())
      .k(5)
      .local_connectivity(0.0)
      .build()
      .exec();
    assert!(rhos.iter().all(|&r| r == 0.0));
    assert!(sigmas.iter().all(|&s| s > 0.0));
  }
}
