//! Sample MapReduce workloads expressed against the engine's traits.
//!
//! These double as living documentation: `wc` shows a combine-enabled
//! aggregation, `kmeans` shows side data feeding a setup hook. The
//! integration tests and the demo binaries both run them.

pub mod kmeans;
pub mod wc;
