//! An SPMD MapReduce engine over blocking collective communication.
//!
//! A fixed group of cooperating ranks runs the same program; rank 0 acts
//! as coordinator and every rank participates in computation. Users
//! implement [`Mapper`], [`Reducer`] and optionally [`Combiner`] on their
//! own types, register them in identical order on every rank, and submit
//! jobs through the coordinator's [`Engine`]. The engine partitions and
//! scatters input, runs map and local combine, shuffles pairs by key hash,
//! reduces grouped values, and gathers results back to the coordinator.
//!
//! There is no fault tolerance and no dynamic membership: collectives are
//! blocking and every rank must issue them in identical order, so any
//! divergence stalls the whole group.

use std::hash::{Hash, Hasher};

pub mod codec;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod utils;
pub mod workload;

pub use codec::{ByteStream, Wire};
pub use engine::Engine;
pub use registry::{CombineToken, JobShape, MapToken, ReduceToken, Registry};
pub use transport::{simulate, Collective, ThreadWorld};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application traits
/////////////////////////////////////////////////////////////////////////////

/// A map phase implementation.
///
/// One instance is default-constructed per job execution. If side data was
/// broadcast for the map phase, [`setup`](Mapper::setup) runs once with the
/// decoded value before the first [`map`](Mapper::map) call; implementations
/// without side data leave `SideData = ()` and keep the default no-op.
pub trait Mapper: Default {
    type Input: Wire + 'static;
    type Key: Wire + Hash + Eq + 'static;
    type Value: Wire + 'static;
    type SideData: Wire;

    fn setup(&mut self, _side: Self::SideData) {}

    /// Produce zero or more key-value pairs for one input item.
    fn map(&mut self, item: Self::Input, out: &mut Vec<(Self::Key, Self::Value)>);
}

/// A reduce phase implementation.
///
/// Invoked once per distinct key with every value observed for that key,
/// after the shuffle has moved all of them onto one rank. The value
/// collection is never empty.
pub trait Reducer: Default {
    type Key: Wire + Hash + Eq + 'static;
    type Value: Wire + 'static;
    type Output: Wire + 'static;
    type SideData: Wire;

    fn setup(&mut self, _side: Self::SideData) {}

    fn reduce(&mut self, key: Self::Key, values: Vec<Self::Value>) -> Self::Output;
}

/// An optional pre-aggregation step run per destination bucket before the
/// shuffle, to cut exchange volume.
///
/// Correctness requires the operation to be reduction-compatible
/// (associative and commutative over the grouped values); the engine does
/// not and cannot check that contract.
pub trait Combiner: Default {
    type Key: Wire + Hash + Eq + 'static;
    type Value: Wire + 'static;
    type SideData: Wire;

    fn setup(&mut self, _side: Self::SideData) {}

    fn combine(&mut self, key: Self::Key, values: Vec<Self::Value>) -> (Self::Key, Self::Value);
}

/////////////////////////////////////////////////////////////////////////////
// Key partitioning
/////////////////////////////////////////////////////////////////////////////

/// Hashes an intermediate key.
///
/// FNV with a fixed seed, masked to 31 bits, so every rank computes the
/// same hash for equal keys regardless of process. This is what makes the
/// shuffle correct without any global coordination.
pub fn ihash<K: Hash>(key: &K) -> u64 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    key.hash(&mut hasher);
    hasher.finish() & 0x7fff_ffff
}

/// Compute the destination rank for a key: `ihash(key) % ranks`.
pub fn partition<K: Hash>(key: &K, ranks: usize) -> usize {
    (ihash(key) % ranks as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_keys_hash_identically() {
        let a = "shared-key".to_string();
        let b = "shared-key".to_string();
        assert_eq!(ihash(&a), ihash(&b));
        for ranks in [1, 2, 4, 7] {
            assert_eq!(partition(&a, ranks), partition(&b, ranks));
        }
    }

    #[test]
    fn partition_stays_in_range() {
        for ranks in [1usize, 2, 3, 8] {
            for key in 0u64..100 {
                assert!(partition(&key, ranks) < ranks);
            }
        }
    }

    #[test]
    fn distinct_keys_spread_across_ranks() {
        let hit: std::collections::HashSet<usize> =
            (0u64..64).map(|key| partition(&key, 4)).collect();
        assert_eq!(hit.len(), 4);
    }
}
