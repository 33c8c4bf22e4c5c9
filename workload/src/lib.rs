//! MapReduce applications that can be run by name.

use std::sync::Arc;

use common::Workload;

pub mod vertex_degree;
pub mod wc;

pub use vertex_degree::VertexDegree;
pub use wc::WordCount;

/// Names accepted by [`try_named`].
pub const NAMES: &[&str] = &["wc", "word-count", "vertex-degree"];

/// Looks up a workload by the name used on the command line.
pub fn try_named(name: &str) -> Option<Arc<dyn Workload>> {
    match name {
        "wc" | "word-count" => Some(Arc::new(WordCount)),
        "vertex-degree" => Some(Arc::new(VertexDegree)),
        _ => None,
    }
}
