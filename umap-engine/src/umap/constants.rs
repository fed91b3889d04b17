/// Tolerance for the smooth k-nearest neighbor distance bisection.
pub const SMOOTH_K_TOLERANCE: f32 = 1e-5;

/// Minimum bandwidth, as a fraction of the mean neighbor distance.
pub const MIN_K_DIST_SCALE: f32 = 1e-3;

/// Fraction of fully disconnected vertices above which the warning gets louder.
pub const DISCONNECTED_WARN_FRACTION: f64 = 0.1;
