/*
  Fit a, b params for the differentiable curve used in lower
  dimensional fuzzy simplicial complex construction. We want the
  smooth curve 1 / (1 + a * x^(2b)) that best matches, in the least squares
  sense, an offset exponential decay: 1 for x < min_dist and
  exp(-(x - min_dist) / spread) beyond, sampled at 300 points on
  [0, 3 * spread].

  The fit is a damped Gauss-Newton (Levenberg-Marquardt) iteration started
  from a = b = 1, run in f64.
*/
pub fn find_ab_params(spread: f32, min_dist: f32) -> (f32, f32) {
  const N_POINTS: usize = 300;
  const MAX_ITER: usize = 200;

  let spread = spread as f64;
  let min_dist = min_dist as f64;
  let xs: Vec<f64> = (0..N_POINTS)
    .map(|i| 3.0 * spread * i as f64 / (N_POINTS - 1) as f64)
    .collect();
  let ys: Vec<f64> = xs
    .iter()
    .map(|&x| {
      if x < min_dist {
        1.0
      } else {
        f64::exp(-(x - min_dist) / spread)
      }
    })
    .collect();

  let cost = |a: f64, b: f64| -> f64 {
    xs.iter()
      .zip(&ys)
      .map(|(&x, &y)| {
        let r = curve(x, a, b) - y;
        r * r
      })
      .sum()
  };

  let (mut a, mut b) = (1.0f64, 1.0f64);
  let mut lambda = 1e-3;
  let mut current = cost(a, b);

  for _ in 0..MAX_ITER {
    // Normal equations J^T J and J^T r for the 2 parameters.
    let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (&x, &y) in xs.iter().zip(&ys) {
      if x <= 0.0 {
        // f(0) = 1 for every (a, b): no gradient.
        continue;
      }
      let x2b = x.powf(2.0 * b);
      let denom = 1.0 + a * x2b;
      let r = 1.0 / denom - y;
      let da = -x2b / (denom * denom);
      let db = -2.0 * a * x2b * x.ln() / (denom * denom);
      jaa += da * da;
      jab += da * db;
      jbb += db * db;
      ga += da * r;
      gb += db * r;
    }

    let mut improved = false;
    while lambda < 1e12 {
      let m00 = jaa * (1.0 + lambda);
      let m11 = jbb * (1.0 + lambda);
      let det = m00 * m11 - jab * jab;
      if det.abs() < f64::MIN_POSITIVE {
        lambda *= 10.0;
        continue;
      }
      let step_a = (-ga * m11 + gb * jab) / det;
      let step_b = (-gb * m00 + ga * jab) / det;
      let (next_a, next_b) = (a + step_a, b + step_b);
      if next_a > 0.0 && next_b > 0.0 {
        let next = cost(next_a, next_b);
        if next < current {
          let converged = (current - next) <= 1e-12 * current.max(1e-12);
          a = next_a;
          b = next_b;
          current = next;
          lambda = (lambda / 10.0).max(1e-12);
          improved = !converged;
          break;
        }
      }
      lambda *= 10.0;
    }
    if !improved {
      break;
    }
  }

  (a as f32, b as f32)
}

#[inline]
fn curve(x: f64, a: f64, b: f64) -> f64 {
  1.0 / (1.0 + a * x.powf(2.0 * b))
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_relative_eq;

  #[test]
  fn default_parameters_match_reference_fit() {
    let (a, b) = find_ab_params(1.0, 0.1);
    assert_relative_eq!(a, 1.577, epsilon = 1e-2);
    assert_relative_eq!(b, 0.895, epsilon = 1e-2);
  }

  #[test]
  fn larger_min_dist_flattens_curve() {
    let (a_small, b_small) = find_ab_params(1.0, 0.1);
    let (a_large, b_large) = find_ab_params(1.0, 0.5);
    assert!(a_large < a_small);
    assert!(b_large > b_small);
  }
}
