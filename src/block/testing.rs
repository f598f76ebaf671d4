//! Mock cluster collaborators shared by the tests of this crate

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use tempest_util::data::*;
use tempest_util::error::Error;

use tempest_rpc::master::{BlockLocationsAndStatus, MasterClient};
use tempest_rpc::node::BlockManagerId;
use tempest_rpc::transport::{BlockTransferService, DownloadFileManager, ManagedBuffer};

pub(crate) struct MockMaster {
	peers: Mutex<Vec<BlockManagerId>>,
	locations: Mutex<Option<BlockLocationsAndStatus>>,
	refreshed_locations: Mutex<Option<Vec<BlockManagerId>>>,
	pub(crate) updates: Mutex<Vec<(BlockId, StorageLevel, u64, u64)>>,
	accept_updates: AtomicBool,
	registrations: AtomicU64,
	get_peers_calls: AtomicU64,
	get_locations_calls: AtomicU64,
}

impl MockMaster {
	pub(crate) fn new(peers: Vec<BlockManagerId>) -> Self {
		Self {
			peers: Mutex::new(peers),
			locations: Mutex::new(None),
			refreshed_locations: Mutex::new(None),
			updates: Mutex::new(Vec::new()),
			accept_updates: AtomicBool::new(true),
			registrations: AtomicU64::new(0),
			get_peers_calls: AtomicU64::new(0),
			get_locations_calls: AtomicU64::new(0),
		}
	}

	pub(crate) fn set_locations(&self, locations: Vec<BlockManagerId>, status: BlockStatus) {
		*self.locations.lock().unwrap() = Some(BlockLocationsAndStatus { locations, status });
	}

	pub(crate) fn set_refreshed_locations(&self, locations: Vec<BlockManagerId>) {
		*self.refreshed_locations.lock().unwrap() = Some(locations);
	}

	/// Make `update_block_info` reply false, as for an unknown sender
	pub(crate) fn reject_updates(&self) {
		self.accept_updates.store(false, Ordering::SeqCst);
	}

	pub(crate) fn accept_updates(&self) {
		self.accept_updates.store(true, Ordering::SeqCst);
	}

	pub(crate) fn registrations(&self) -> u64 {
		self.registrations.load(Ordering::SeqCst)
	}

	pub(crate) fn get_peers_calls(&self) -> u64 {
		self.get_peers_calls.load(Ordering::SeqCst)
	}

	pub(crate) fn get_locations_calls(&self) -> u64 {
		self.get_locations_calls.load(Ordering::SeqCst)
	}

	pub(crate) fn last_update_for(
		&self,
		block_id: &BlockId,
	) -> Option<(StorageLevel, u64, u64)> {
		self.updates
			.lock()
			.unwrap()
			.iter()
			.rev()
			.find(|(id, _, _, _)| id == block_id)
			.map(|(_, level, mem, disk)| (*level, *mem, *disk))
	}
}

#[async_trait]
impl MasterClient for MockMaster {
	async fn register_block_manager(
		&self,
		id: &BlockManagerId,
		_max_on_heap_mem: u64,
		_max_off_heap_mem: u64,
		_slave_endpoint: &str,
	) -> Result<BlockManagerId, Error> {
		self.registrations.fetch_add(1, Ordering::SeqCst);
		Ok(id.clone())
	}

	async fn update_block_info(
		&self,
		_id: &BlockManagerId,
		block_id: &BlockId,
		storage_level: StorageLevel,
		mem_size: u64,
		disk_size: u64,
	) -> Result<bool, Error> {
		if !self.accept_updates.load(Ordering::SeqCst) {
			return Ok(false);
		}
		self.updates
			.lock()
			.unwrap()
			.push((block_id.clone(), storage_level, mem_size, disk_size));
		Ok(true)
	}

	async fn get_locations(&self, _block_id: &BlockId) -> Result<Vec<BlockManagerId>, Error> {
		self.get_locations_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(refreshed) = self.refreshed_locations.lock().unwrap().clone() {
			return Ok(refreshed);
		}
		Ok(self
			.locations
			.lock()
			.unwrap()
			.as_ref()
			.map(|las| las.locations.clone())
			.unwrap_or_default())
	}

	async fn get_locations_and_status(
		&self,
		_block_id: &BlockId,
	) -> Result<Option<BlockLocationsAndStatus>, Error> {
		Ok(self.locations.lock().unwrap().clone())
	}

	async fn get_peers(&self, id: &BlockManagerId) -> Result<Vec<BlockManagerId>, Error> {
		self.get_peers_calls.fetch_add(1, Ordering::SeqCst);
		Ok(self
			.peers
			.lock()
			.unwrap()
			.iter()
			.filter(|peer| *peer != id)
			.cloned()
			.collect())
	}
}

pub(crate) struct MockTransport {
	served_blocks: Mutex<HashMap<(String, String), Bytes>>,
	failing_executors: Mutex<HashSet<String>>,
	uploads: Mutex<Vec<(String, BlockId, Bytes, StorageLevel)>>,
	fetch_attempts: AtomicU64,
}

impl MockTransport {
	pub(crate) fn new() -> Self {
		Self {
			served_blocks: Mutex::new(HashMap::new()),
			failing_executors: Mutex::new(HashSet::new()),
			uploads: Mutex::new(Vec::new()),
			fetch_attempts: AtomicU64::new(0),
		}
	}

	pub(crate) fn serve_block(&self, executor_id: &str, block_id: &BlockId, data: Bytes) {
		self.served_blocks
			.lock()
			.unwrap()
			.insert((executor_id.to_string(), block_id.name()), data);
	}

	pub(crate) fn fail_uploads_to(&self, executor_id: &str) {
		self.failing_executors
			.lock()
			.unwrap()
			.insert(executor_id.to_string());
	}

	pub(crate) fn uploads(&self) -> Vec<(String, BlockId, Bytes, StorageLevel)> {
		self.uploads.lock().unwrap().clone()
	}

	pub(crate) fn fetch_attempts(&self) -> u64 {
		self.fetch_attempts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl BlockTransferService for MockTransport {
	async fn fetch_block_sync(
		&self,
		_host: &str,
		_port: u16,
		executor_id: &str,
		block_id: &BlockId,
		temp_file_manager: Option<&dyn DownloadFileManager>,
	) -> Result<ManagedBuffer, Error> {
		self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
		let data = self
			.served_blocks
			.lock()
			.unwrap()
			.get(&(executor_id.to_string(), block_id.name()))
			.cloned()
			.ok_or_else(|| Error::Message(format!("No connection to {}", executor_id)))?;

		match temp_file_manager {
			Some(manager) => {
				let mut file = manager.create_temp_file()?;
				std::fs::write(file.path(), &data)?;
				manager.register_temp_file_to_clean(&mut file);
				Ok(ManagedBuffer::File(file))
			}
			None => Ok(ManagedBuffer::Memory(data)),
		}
	}

	async fn upload_block_sync(
		&self,
		_host: &str,
		_port: u16,
		executor_id: &str,
		block_id: &BlockId,
		data: Bytes,
		level: StorageLevel,
		_tag: DataTag,
	) -> Result<(), Error> {
		if self.failing_executors.lock().unwrap().contains(executor_id) {
			return Err(Error::Message(format!("Upload to {} failed", executor_id)));
		}
		self.uploads
			.lock()
			.unwrap()
			.push((executor_id.to_string(), block_id.clone(), data, level));
		Ok(())
	}
}
