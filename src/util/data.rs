//! Block identifiers and storage levels

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of a block stored by a block manager.
///
/// This is a closed set of variants; each has a canonical textual form
/// that is used as the on-wire name of the block and as its file name
/// in the disk tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockId {
	/// A cached partition of a dataset
	Rdd { rdd_id: u32, split_index: u32 },
	/// Output of one map task for one reduce partition
	Shuffle {
		shuffle_id: u32,
		map_id: u32,
		reduce_id: u32,
	},
	/// A piece of a broadcast variable
	Broadcast {
		broadcast_id: u64,
		field: Option<String>,
	},
	/// Result bytes of a finished task
	TaskResult { task_id: u64 },
	/// Scratch block local to this node
	TempLocal { id: u128 },
	/// Block received from a streaming source
	Stream { stream_id: u64, unique_id: u64 },
}

impl BlockId {
	/// Shuffle blocks are served by the shuffle resolver and bypass the
	/// block lock manager entirely.
	pub fn is_shuffle(&self) -> bool {
		matches!(self, BlockId::Shuffle { .. })
	}

	pub fn is_rdd(&self) -> bool {
		matches!(self, BlockId::Rdd { .. })
	}

	pub fn is_broadcast(&self) -> bool {
		matches!(self, BlockId::Broadcast { .. })
	}

	/// The dataset this block belongs to, if it is a cached partition
	pub fn rdd_id(&self) -> Option<u32> {
		match self {
			BlockId::Rdd { rdd_id, .. } => Some(*rdd_id),
			_ => None,
		}
	}

	pub fn broadcast_id(&self) -> Option<u64> {
		match self {
			BlockId::Broadcast { broadcast_id, .. } => Some(*broadcast_id),
			_ => None,
		}
	}

	/// Canonical textual form, e.g. `rdd_4_17`
	pub fn name(&self) -> String {
		self.to_string()
	}
}

impl fmt::Display for BlockId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BlockId::Rdd { rdd_id, split_index } => write!(f, "rdd_{}_{}", rdd_id, split_index),
			BlockId::Shuffle {
				shuffle_id,
				map_id,
				reduce_id,
			} => write!(f, "shuffle_{}_{}_{}", shuffle_id, map_id, reduce_id),
			BlockId::Broadcast {
				broadcast_id,
				field: None,
			} => write!(f, "broadcast_{}", broadcast_id),
			BlockId::Broadcast {
				broadcast_id,
				field: Some(field),
			} => write!(f, "broadcast_{}_{}", broadcast_id, field),
			BlockId::TaskResult { task_id } => write!(f, "taskresult_{}", task_id),
			BlockId::TempLocal { id } => write!(f, "temp_local_{:032x}", id),
			BlockId::Stream {
				stream_id,
				unique_id,
			} => write!(f, "input-{}-{}", stream_id, unique_id),
		}
	}
}

impl FromStr for BlockId {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		fn bad(s: &str) -> Error {
			Error::Message(format!("Unparseable block id: {}", s))
		}

		if let Some(rest) = s.strip_prefix("rdd_") {
			let mut it = rest.splitn(2, '_');
			let rdd_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			let split_index = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			Ok(BlockId::Rdd { rdd_id, split_index })
		} else if let Some(rest) = s.strip_prefix("shuffle_") {
			let mut it = rest.splitn(3, '_');
			let shuffle_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			let map_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			let reduce_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			Ok(BlockId::Shuffle {
				shuffle_id,
				map_id,
				reduce_id,
			})
		} else if let Some(rest) = s.strip_prefix("broadcast_") {
			let mut it = rest.splitn(2, '_');
			let broadcast_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			let field = it.next().map(|x| x.to_string());
			Ok(BlockId::Broadcast {
				broadcast_id,
				field,
			})
		} else if let Some(rest) = s.strip_prefix("taskresult_") {
			Ok(BlockId::TaskResult {
				task_id: rest.parse().map_err(|_| bad(s))?,
			})
		} else if let Some(rest) = s.strip_prefix("temp_local_") {
			Ok(BlockId::TempLocal {
				id: u128::from_str_radix(rest, 16).map_err(|_| bad(s))?,
			})
		} else if let Some(rest) = s.strip_prefix("input-") {
			let mut it = rest.splitn(2, '-');
			let stream_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			let unique_id = it.next().and_then(|x| x.parse().ok()).ok_or_else(|| bad(s))?;
			Ok(BlockId::Stream {
				stream_id,
				unique_id,
			})
		} else {
			Err(bad(s))
		}
	}
}

/// Which memory budget a block is charged against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryMode {
	OnHeap,
	OffHeap,
}

/// Where and how a block should be stored.
///
/// Validity rules: off-heap blocks are always serialized and always use
/// memory; a level must use at least one tier to be valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLevel {
	pub use_disk: bool,
	pub use_memory: bool,
	pub use_off_heap: bool,
	pub deserialized: bool,
	pub replication: u8,
}

pub const MEMORY_ONLY: StorageLevel = StorageLevel {
	use_disk: false,
	use_memory: true,
	use_off_heap: false,
	deserialized: true,
	replication: 1,
};
pub const MEMORY_ONLY_SER: StorageLevel = StorageLevel {
	use_disk: false,
	use_memory: true,
	use_off_heap: false,
	deserialized: false,
	replication: 1,
};
pub const MEMORY_AND_DISK: StorageLevel = StorageLevel {
	use_disk: true,
	use_memory: true,
	use_off_heap: false,
	deserialized: true,
	replication: 1,
};
pub const MEMORY_AND_DISK_SER: StorageLevel = StorageLevel {
	use_disk: true,
	use_memory: true,
	use_off_heap: false,
	deserialized: false,
	replication: 1,
};
pub const DISK_ONLY: StorageLevel = StorageLevel {
	use_disk: true,
	use_memory: false,
	use_off_heap: false,
	deserialized: false,
	replication: 1,
};
pub const OFF_HEAP: StorageLevel = StorageLevel {
	use_disk: false,
	use_memory: true,
	use_off_heap: true,
	deserialized: false,
	replication: 1,
};
pub const NONE: StorageLevel = StorageLevel {
	use_disk: false,
	use_memory: false,
	use_off_heap: false,
	deserialized: false,
	replication: 1,
};

impl StorageLevel {
	pub fn new(
		use_disk: bool,
		use_memory: bool,
		use_off_heap: bool,
		deserialized: bool,
		replication: u8,
	) -> Result<Self, Error> {
		let level = StorageLevel {
			use_disk,
			use_memory,
			use_off_heap,
			deserialized,
			replication,
		};
		if use_off_heap && (deserialized || !use_memory) {
			return Err(Error::InvalidStorageLevel(level));
		}
		if replication == 0 {
			return Err(Error::InvalidStorageLevel(level));
		}
		Ok(level)
	}

	/// A level is valid iff it places the block in at least one tier
	pub fn is_valid(&self) -> bool {
		self.use_memory || self.use_disk
	}

	pub fn memory_mode(&self) -> MemoryMode {
		if self.use_off_heap {
			MemoryMode::OffHeap
		} else {
			MemoryMode::OnHeap
		}
	}

	pub fn with_replication(self, replication: u8) -> Self {
		StorageLevel {
			replication,
			..self
		}
	}
}

impl fmt::Display for StorageLevel {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"StorageLevel(disk={}, memory={}, offheap={}, deserialized={}, replication={})",
			self.use_disk, self.use_memory, self.use_off_heap, self.deserialized, self.replication
		)
	}
}

/// Snapshot of where a block currently lives and how big it is there.
///
/// Always synthesized from the live stores, never from cached metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
	pub storage_level: StorageLevel,
	pub mem_size: u64,
	pub disk_size: u64,
}

impl BlockStatus {
	pub fn empty() -> Self {
		BlockStatus {
			storage_level: NONE,
			mem_size: 0,
			disk_size: 0,
		}
	}

	pub fn is_cached(&self) -> bool {
		self.mem_size + self.disk_size > 0
	}
}

/// Opaque tag describing the record type of a block, interpreted only by
/// the serializer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataTag(pub Arc<str>);

impl DataTag {
	pub fn of(name: &str) -> Self {
		DataTag(name.into())
	}
}

impl fmt::Display for DataTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_block_id_textual_forms() {
		let cases: Vec<(BlockId, &str)> = vec![
			(
				BlockId::Rdd {
					rdd_id: 4,
					split_index: 17,
				},
				"rdd_4_17",
			),
			(
				BlockId::Shuffle {
					shuffle_id: 1,
					map_id: 2,
					reduce_id: 3,
				},
				"shuffle_1_2_3",
			),
			(
				BlockId::Broadcast {
					broadcast_id: 9,
					field: None,
				},
				"broadcast_9",
			),
			(
				BlockId::Broadcast {
					broadcast_id: 9,
					field: Some("piece0".into()),
				},
				"broadcast_9_piece0",
			),
			(BlockId::TaskResult { task_id: 42 }, "taskresult_42"),
			(
				BlockId::Stream {
					stream_id: 7,
					unique_id: 8,
				},
				"input-7-8",
			),
		];
		for (id, s) in cases {
			assert_eq!(id.to_string(), s);
			assert_eq!(s.parse::<BlockId>().unwrap(), id);
		}

		let tmp = BlockId::TempLocal { id: 0xdeadbeef };
		assert_eq!(tmp.to_string().parse::<BlockId>().unwrap(), tmp);

		assert!("rdd_x_1".parse::<BlockId>().is_err());
		assert!("what_is_this".parse::<BlockId>().is_err());
	}

	#[test]
	fn test_storage_level_validity() {
		assert!(MEMORY_ONLY.is_valid());
		assert!(DISK_ONLY.is_valid());
		assert!(!NONE.is_valid());

		assert!(StorageLevel::new(false, true, true, true, 1).is_err());
		assert!(StorageLevel::new(true, false, true, false, 1).is_err());
		assert!(StorageLevel::new(true, true, false, true, 0).is_err());
		assert_eq!(
			StorageLevel::new(false, true, true, false, 2)
				.unwrap()
				.memory_mode(),
			MemoryMode::OffHeap
		);
	}
}
