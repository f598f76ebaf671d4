//! Interfaces to the shuffle subsystem

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use tempest_util::data::BlockId;
use tempest_util::error::Error;

/// Serves the bytes of shuffle blocks written on this node.
///
/// Shuffle blocks are written once and never mutated, so reads bypass
/// the block lock manager and go straight to the resolver.
pub trait ShuffleBlockResolver: Send + Sync {
	fn get_block_data(&self, block_id: &BlockId) -> Result<Bytes, Error>;
}

/// What the external shuffle service needs to serve an executor's
/// shuffle files after the executor is gone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorShuffleInfo {
	pub local_dirs: Vec<String>,
	pub sub_dirs_per_local_dir: usize,
	pub shuffle_manager: String,
}

/// Client of the external shuffle service colocated on this host
#[async_trait]
pub trait ExternalShuffleClient: Send + Sync {
	async fn register_with_shuffle_server(
		&self,
		host: &str,
		port: u16,
		executor_id: &str,
		info: &ExecutorShuffleInfo,
	) -> Result<(), Error>;
}
