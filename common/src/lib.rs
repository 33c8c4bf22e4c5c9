//! Shared building blocks of the MapReduce-lite task engine.
//!
//! Map and reduce tasks exchange key-value pairs through partitioned
//! stores on the local filesystem. For simplicity everything runs inside a
//! single process; remote partitions are fetched through a [`transport`].

use std::fmt;
use std::fmt::Formatter;
use std::hash::Hasher;

use async_trait::async_trait;

pub mod codec;
pub mod config;
pub mod error;
pub mod naming;
pub mod store;
pub mod stream;
pub mod transport;

pub use config::TaskConfig;
pub use error::{DecodeError, Phase, TaskError};
pub use stream::{PairSender, StreamClosed, ValueReceiver};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// A map reduce application.
///
/// The engine calls [`Workload::map`] once per input record and
/// [`Workload::reduce`] once per distinct intermediate key. Both functions
/// own their output stream; dropping it (by returning) tells the engine that
/// no more pairs will follow.
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Turns one input record into zero or more intermediate pairs.
    async fn map(&self, key: String, value: String, output: PairSender) -> anyhow::Result<()>;

    /// Folds every value of `key` into zero or more output pairs.
    ///
    /// The function must consume `values` until it is closed. Returning
    /// early without an error is reported by the engine as a protocol
    /// violation.
    async fn reduce(
        &self,
        key: String,
        values: ValueReceiver,
        output: PairSender,
    ) -> anyhow::Result<()>;
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Pair {
    /// The key.
    pub key: String,

    /// The value.
    pub value: String,
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.key, self.value)
    }
}

impl Pair {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Get the key of this key-value pair.
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the value of this key-value pair.
    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Consumes the key-value pair and returns the key.
    #[inline]
    pub fn into_key(self) -> String {
        self.key
    }

    /// Consumes the key-value pair and returns the value.
    #[inline]
    pub fn into_value(self) -> String {
        self.value
    }
}

/////////////////////////////////////////////////////////////////////////////
// Partitioning
/////////////////////////////////////////////////////////////////////////////

/// Hashes an intermediate key.
///
/// 64-bit FNV-1a over the key bytes with the standard offset basis, masked
/// to the low 31 bits. Every map task and every reduce task must agree on
/// this function, so it is not configurable.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key);
    (hasher.finish() & 0x7fff_ffff) as u32
}

/// Compute the reduce bucket of `key` by calculating `ihash(key) % n_reduce`.
///
/// `n_reduce` must be non-zero; [`TaskConfig::validate`] rejects a zero
/// reduce count before any task runs.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    ihash(key.as_bytes()) as usize % n_reduce
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn ihash_matches_fnv1a_reference_values() {
        // Offset basis and FNV-1a("a"), masked to 31 bits.
        assert_eq!(ihash(b""), 0x0422_2325);
        assert_eq!(ihash(b"a"), 0x0601_ec8c);
    }

    #[test]
    fn partition_is_deterministic() {
        for key in ["the", "cat", "sat", "", "ünïcødé", "a much longer key with spaces"] {
            for r in 1..8 {
                assert_eq!(partition(key, r), partition(key, r));
                assert!(partition(key, r) < r);
            }
        }
    }

    #[test]
    fn single_bucket_takes_everything() {
        for key in ["x", "y", "z"] {
            assert_eq!(partition(key, 1), 0);
        }
    }

    #[test]
    fn keys_spread_over_buckets() {
        let buckets: HashSet<usize> = (0..200)
            .map(|i| partition(&format!("word{i}"), 4))
            .collect();
        assert_eq!(buckets.len(), 4);
    }

    #[test]
    fn pair_display_joins_key_and_value() {
        let pair = Pair::new("the", "2");
        assert_eq!(pair.to_string(), "the 2");
        assert_eq!(pair.key(), "the");
        assert_eq!(pair.clone().into_value(), "2");
        assert_eq!(pair.into_key(), "the");
    }
}
