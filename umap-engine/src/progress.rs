use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::info;

/// Minimum spacing between two forwarded progress updates.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Pipeline stage a progress update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  NearestNeighbors,
  Optimization,
  Transform,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Stage::NearestNeighbors => write!(f, "nearest_neighbors"),
      Stage::Optimization => write!(f, "optimization"),
      Stage::Transform => write!(f, "transform"),
    }
  }
}

/// Receives progress updates. Has no influence on results.
pub trait ProgressObserver: Send + Sync {
  fn update(&self, stage: Stage, completed: usize, total: usize);
}

/// Forwards progress to `tracing`: `info!` when verbose, `debug!` otherwise.
#[derive(Debug, Clone, Copy)]
pub struct LoggingObserver {
  pub verbose: bool,
}

impl ProgressObserver for LoggingObserver {
  fn update(&self, stage: Stage, completed: usize, total: usize) {
    if self.verbose {
      info!(%stage, completed, total, "progress");
    } else {
      debug!(%stage, completed, total, "progress");
    }
  }
}

/// Fan-out to a list of observers, throttled to one update per [`PROGRESS_INTERVAL`].
///
/// The last update of a stage (`completed == total`) is always delivered.
pub struct ProgressTracker {
  observers: Vec<Arc<dyn ProgressObserver>>,
  last_sent: Mutex<Option<Instant>>,
  interval: Duration,
}

impl fmt::Debug for ProgressTracker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProgressTracker")
      .field("observers", &self.observers.len())
      .field("interval", &self.interval)
      .finish()
  }
}

impl ProgressTracker {
  pub fn new(observers: Vec<Arc<dyn ProgressObserver>>) -> Self {
    Self::with_interval(observers, PROGRESS_INTERVAL)
  }

  pub fn with_interval(observers: Vec<Arc<dyn ProgressObserver>>, interval: Duration) -> Self {
    Self {
      observers,
      last_sent: Mutex::new(None),
      interval,
    }
  }

  pub fn report(&self, stage: Stage, completed: usize, total: usize) {
    if self.observers.is_empty() {
      return;
    }
    {
      let mut last = self.last_sent.lock();
      let now = Instant::now();
      let due = last.is_none_or(|t| now.duration_since(t) >= self.interval);
      if !due && completed < total {
        return;
      }
      *last = Some(now);
    }
    for observer in &self.observers {
      observer.update(stage, completed, total);
    }
  }
}
