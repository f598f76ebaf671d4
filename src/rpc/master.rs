//! Interface to the driver-side directory of block locations

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tempest_util::data::*;
use tempest_util::error::Error;

use crate::node::BlockManagerId;

/// Reply to a `get_locations_and_status` query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLocationsAndStatus {
	pub locations: Vec<BlockManagerId>,
	pub status: BlockStatus,
}

/// Client half of the directory service running on the driver.
///
/// The directory maps every reported block to the set of nodes holding
/// it and tracks block manager liveness; this subsystem only consumes
/// it.
#[async_trait]
pub trait MasterClient: Send + Sync {
	/// Announce this block manager. The returned id is the one to use
	/// from then on (the master may canonicalize, e.g. fill in topology
	/// information).
	async fn register_block_manager(
		&self,
		id: &BlockManagerId,
		max_on_heap_mem: u64,
		max_off_heap_mem: u64,
		slave_endpoint: &str,
	) -> Result<BlockManagerId, Error>;

	/// Report the status of one block. A `false` reply means the master
	/// does not know the sender, which must then re-register.
	async fn update_block_info(
		&self,
		id: &BlockManagerId,
		block_id: &BlockId,
		storage_level: StorageLevel,
		mem_size: u64,
		disk_size: u64,
	) -> Result<bool, Error>;

	async fn get_locations(&self, block_id: &BlockId) -> Result<Vec<BlockManagerId>, Error>;

	async fn get_locations_and_status(
		&self,
		block_id: &BlockId,
	) -> Result<Option<BlockLocationsAndStatus>, Error>;

	/// All other live block managers, excluding the caller
	async fn get_peers(&self, id: &BlockManagerId) -> Result<Vec<BlockManagerId>, Error>;
}
