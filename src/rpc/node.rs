//! Identity of a block manager in the cluster

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identity of one block manager: the executor it serves, where its
/// transfer service listens, and optionally where it sits in the
/// cluster topology.
///
/// Two ids naming the same executor/host/port are the same node even if
/// one of them carries topology information and the other does not, so
/// equality and hashing ignore `topology_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockManagerId {
	pub executor_id: String,
	pub host: String,
	pub port: u16,
	/// Topology tag such as a rack or zone name, assigned by the master
	pub topology_info: Option<String>,
}

impl BlockManagerId {
	pub fn new(executor_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
		Self {
			executor_id: executor_id.into(),
			host: host.into(),
			port,
			topology_info: None,
		}
	}

	pub fn with_topology(mut self, topology_info: impl Into<String>) -> Self {
		self.topology_info = Some(topology_info.into());
		self
	}

	pub fn same_host(&self, other: &BlockManagerId) -> bool {
		self.host == other.host
	}

	pub fn same_rack(&self, other: &BlockManagerId) -> bool {
		match (&self.topology_info, &other.topology_info) {
			(Some(a), Some(b)) => a == b,
			_ => false,
		}
	}
}

impl PartialEq for BlockManagerId {
	fn eq(&self, other: &Self) -> bool {
		self.executor_id == other.executor_id && self.host == other.host && self.port == other.port
	}
}

impl Eq for BlockManagerId {}

impl Hash for BlockManagerId {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.executor_id.hash(state);
		self.host.hash(state);
		self.port.hash(state);
	}
}

impl fmt::Display for BlockManagerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"BlockManagerId({}, {}:{})",
			self.executor_id, self.host, self.port
		)
	}
}
