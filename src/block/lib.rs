//! Per-node block storage engine: tiered placement of blocks in memory
//! and on disk, per-block locking, replication to peers, and remote
//! retrieval.

#[macro_use]
extern crate tracing;

pub mod disk;
pub mod events;
pub mod fetch;
pub mod info;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod replicate;
pub mod temp_file;

#[cfg(test)]
pub(crate) mod testing;
