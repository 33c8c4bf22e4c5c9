//! Map and reduce task execution.
//!
//! A [`MapTask`] streams every record of its input partition through the
//! user's map function and spreads the emitted pairs over R bucket stores.
//! A [`ReduceTask`] merges one bucket of every map task into a key-ordered
//! store and runs the user's reduce function once per key, strictly one key
//! at a time.

mod invocation;
pub mod map;
pub mod reduce;

pub use map::{MapStats, MapTask};
pub use reduce::{ReduceStats, ReduceTask};
