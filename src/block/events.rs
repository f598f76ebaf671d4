//! Storage events forwarded to the scheduler

use tempest_util::data::{BlockId, BlockStatus};

use tempest_rpc::node::BlockManagerId;

/// What the scheduler gets to see of the block store, through its
/// `AsyncEventQueue<StorageEvent>`
#[derive(Debug, Clone)]
pub enum StorageEvent {
	/// The status of a block changed and was reported
	BlockUpdated {
		block_manager_id: BlockManagerId,
		block_id: BlockId,
		status: BlockStatus,
	},
	/// A block was removed from this node entirely
	BlockRemoved {
		block_manager_id: BlockManagerId,
		block_id: BlockId,
	},
}
