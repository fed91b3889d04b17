use tracing::debug;
use tracing::warn;

/// Log how many edges the disconnection distance removed and how many vertices
/// ended up with no edge at all.
pub fn raise_disconnected_warning(
  edges_removed: usize,
  vertices_disconnected: usize,
  disconnection_distance: f32,
  total_rows: usize,
  threshold: f64,
) {
  let many = (threshold * total_rows as f64) as usize;
  if vertices_disconnected == 0 {
    if edges_removed > 0 {
      debug!(
        disconnection_distance,
        edges_removed, "edges removed by disconnection distance, no vertex disconnected"
      );
    }
  } else if vertices_disconnected <= many {
    warn!(
      disconnection_distance,
      edges_removed,
      vertices_disconnected,
      "a few vertices were disconnected from the manifold and will embed as NaN"
    );
  } else {
    warn!(
      disconnection_distance,
      edges_removed,
      vertices_disconnected,
      total_rows,
      "a large number of vertices were disconnected from the manifold and will embed as NaN"
    );
  }
}
