//! The block manager, orchestrating tiered placement, status reporting,
//! replication and remote retrieval of blocks on one node

use std::cmp;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use opentelemetry::Context;

use tempest_util::config::Config;
use tempest_util::data::*;
use tempest_util::error::*;
use tempest_util::event_queue::AsyncEventQueue;
use tempest_util::memory::MemoryAccountant;
use tempest_util::metrics::RecordDuration;
use tempest_util::task::{current_task_attempt_id, TaskAttemptId};
use tempest_util::values::{BlockSerializer, ValuesIter};

use tempest_rpc::master::MasterClient;
use tempest_rpc::node::BlockManagerId;
use tempest_rpc::shuffle::{ExecutorShuffleInfo, ExternalShuffleClient, ShuffleBlockResolver};
use tempest_rpc::transport::{BlockTransferService, ManagedBuffer};
use tempest_rpc::{block_manager_endpoint_name, EndpointHandler, Rpc};

use crate::disk::DiskStore;
use crate::events::StorageEvent;
use crate::fetch::RemoteFetcher;
use crate::info::{BlockInfo, BlockInfoManager};
use crate::memory::{EvictionHandler, MemoryEntry, MemoryStore};
use crate::metrics::BlockManagerMetrics;
use crate::replicate::{replication_policy_from_config, Replicator};
use crate::temp_file::RemoteBlockTempFileManager;

const SHUFFLE_REGISTRATION_BACKOFF: Duration = Duration::from_secs(5);

/// Directives other nodes (and the master, through them) may address to
/// this block manager. All of them are idempotent.
#[derive(Debug, Serialize, Deserialize)]
pub enum BlockManagerRpc {
	Ok,
	/// Store a replica of a block pushed by a peer
	ReplicateBlock {
		block_id: BlockId,
		#[serde(with = "serde_bytes")]
		data: Vec<u8>,
		level: StorageLevel,
		tag: DataTag,
	},
	RemoveBlock(BlockId),
	RemoveRdd(u32),
	RemoveBroadcast(u64),
	GetBlockStatus(BlockId),
	BlockStatusReply(Option<BlockStatus>),
	RemovedCount(usize),
}

impl Rpc for BlockManagerRpc {
	type Response = Result<BlockManagerRpc, Error>;
}

/// Releases one read lock when dropped
struct LockGuard {
	info_manager: Arc<BlockInfoManager>,
	block_id: BlockId,
	task: TaskAttemptId,
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		self.info_manager.unlock(&self.block_id, Some(self.task));
	}
}

/// Records of a locally or remotely read block.
///
/// For local reads the underlying read lock is released when the
/// iterator is exhausted or dropped.
pub struct BlockValuesIterator {
	values: ValuesIter,
	guard: Option<LockGuard>,
}

impl Iterator for BlockValuesIterator {
	type Item = Bytes;

	fn next(&mut self) -> Option<Bytes> {
		match self.values.next() {
			Some(record) => Some(record),
			None => {
				self.guard.take();
				None
			}
		}
	}
}

/// Serialized bytes of a block, holding its read lock (if any) until
/// dropped
pub struct BlockData {
	bytes: Bytes,
	guard: Option<LockGuard>,
}

impl BlockData {
	pub fn bytes(&self) -> &Bytes {
		&self.bytes
	}

	pub fn into_bytes(self) -> Bytes {
		self.bytes.clone()
	}
}

/// Result of `get_or_else_update`
pub enum CachedOrComputed {
	/// The block was (or now is) cached; records come from the store
	Cached(BlockValuesIterator),
	/// The block could not be cached; the computed records are handed
	/// back untouched
	Computed(ValuesIter),
}

/// Per-node block storage service: admission into the memory and disk
/// tiers, eviction under pressure, status reporting to the master,
/// replication to peers and retrieval from them.
pub struct BlockManager {
	id: ArcSwap<BlockManagerId>,
	endpoint_name: String,

	pub(crate) info_manager: Arc<BlockInfoManager>,
	pub(crate) memory_store: Arc<MemoryStore>,
	pub(crate) disk_store: Arc<DiskStore>,

	serializer: Arc<dyn BlockSerializer>,
	accountant: Arc<dyn MemoryAccountant>,
	master: Arc<dyn MasterClient>,
	transport: Arc<dyn BlockTransferService>,
	shuffle_resolver: Option<Arc<dyn ShuffleBlockResolver>>,
	shuffle_client: Option<Arc<dyn ExternalShuffleClient>>,

	replicator: Replicator,
	fetcher: RemoteFetcher,
	pub(crate) temp_file_manager: Arc<RemoteBlockTempFileManager>,
	event_queue: Option<Arc<AsyncEventQueue<StorageEvent>>>,

	pub(crate) metrics: BlockManagerMetrics,

	local_dirs: Vec<PathBuf>,
	sub_dirs_per_local_dir: usize,
	shuffle_service_enabled: bool,
	shuffle_service_port: u16,
	shuffle_registration_timeout: Duration,
	shuffle_registration_max_attempts: u32,
	track_updated_block_statuses: bool,

	reregistering: AtomicBool,
}

struct EvictionCallback {
	manager: std::sync::Weak<BlockManager>,
}

#[async_trait]
impl EvictionHandler for EvictionCallback {
	async fn drop_from_memory(
		&self,
		block_id: &BlockId,
		entry: &MemoryEntry,
	) -> Result<StorageLevel, Error> {
		let manager = self
			.manager
			.upgrade()
			.ok_or_message("Block manager is shut down")?;
		manager.drop_from_memory(block_id, entry).await
	}
}

impl BlockManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		conf: &Config,
		id: BlockManagerId,
		master: Arc<dyn MasterClient>,
		transport: Arc<dyn BlockTransferService>,
		accountant: Arc<dyn MemoryAccountant>,
		serializer: Arc<dyn BlockSerializer>,
		shuffle_resolver: Option<Arc<dyn ShuffleBlockResolver>>,
		shuffle_client: Option<Arc<dyn ExternalShuffleClient>>,
		event_queue: Option<Arc<AsyncEventQueue<StorageEvent>>>,
	) -> Result<Arc<Self>, Error> {
		let info_manager = Arc::new(BlockInfoManager::new());
		let memory_store = Arc::new(MemoryStore::new(
			accountant.clone(),
			serializer.clone(),
			info_manager.clone(),
			conf.unroll_memory_threshold,
			conf.unroll_growth_factor,
		));
		let disk_store = Arc::new(DiskStore::new(
			conf.local_dirs.clone(),
			conf.sub_dirs_per_local_dir,
			conf.shuffle_service_enabled,
		)?);
		let temp_file_manager = Arc::new(RemoteBlockTempFileManager::new(
			conf.local_dirs[0].join("remote_blocks"),
		));

		let replicator = Replicator::new(
			replication_policy_from_config(&conf.replication_policy)?,
			conf.max_replication_failures,
			Duration::from_millis(conf.cached_peers_ttl_ms),
		);
		let fetcher = RemoteFetcher::new(
			conf.block_failures_before_location_refresh,
			conf.max_remote_block_size_fetch_to_mem,
		);

		let manager = Arc::new(Self {
			id: ArcSwap::from_pointee(id),
			endpoint_name: block_manager_endpoint_name(),
			info_manager,
			memory_store,
			disk_store,
			serializer,
			accountant,
			master,
			transport,
			shuffle_resolver,
			shuffle_client,
			replicator,
			fetcher,
			temp_file_manager,
			event_queue,
			metrics: BlockManagerMetrics::new(),
			local_dirs: conf.local_dirs.clone(),
			sub_dirs_per_local_dir: conf.sub_dirs_per_local_dir,
			shuffle_service_enabled: conf.shuffle_service_enabled,
			shuffle_service_port: conf.shuffle_service_port,
			shuffle_registration_timeout: Duration::from_millis(
				conf.shuffle_registration_timeout_ms,
			),
			shuffle_registration_max_attempts: conf.shuffle_registration_max_attempts,
			track_updated_block_statuses: conf.track_updated_block_statuses,
			reregistering: AtomicBool::new(false),
		});

		manager
			.memory_store
			.set_eviction_handler(Box::new(EvictionCallback {
				manager: Arc::downgrade(&manager),
			}));

		Ok(manager)
	}

	/// This node's identity, as canonicalized by the master
	pub fn id(&self) -> Arc<BlockManagerId> {
		self.id.load_full()
	}

	pub fn endpoint_name(&self) -> &str {
		&self.endpoint_name
	}

	/// Register with the master (and, when enabled, the external
	/// shuffle service). Must run before the first put.
	pub async fn initialize(self: &Arc<Self>) -> Result<(), Error> {
		self.register_with_master().await?;
		if self.shuffle_service_enabled {
			self.register_with_external_shuffle_server().await?;
		}
		Ok(())
	}

	async fn register_with_master(&self) -> Result<(), Error> {
		let id = self.id();
		let effective = self
			.master
			.register_block_manager(
				&id,
				self.accountant.max_storage_memory(MemoryMode::OnHeap),
				self.accountant.max_storage_memory(MemoryMode::OffHeap),
				&self.endpoint_name,
			)
			.await?;
		self.id.store(Arc::new(effective));
		Ok(())
	}

	/// Register this executor's shuffle files with the shuffle service
	/// colocated on this host, retrying a bounded number of times
	pub async fn register_with_external_shuffle_server(&self) -> Result<(), Error> {
		info!("Registering executor with local external shuffle service.");
		let client = self
			.shuffle_client
			.as_ref()
			.ok_or_message("External shuffle service enabled but no shuffle client configured")?;

		let shuffle_info = ExecutorShuffleInfo {
			local_dirs: self
				.local_dirs
				.iter()
				.map(|dir| dir.to_string_lossy().into_owned())
				.collect(),
			sub_dirs_per_local_dir: self.sub_dirs_per_local_dir,
			shuffle_manager: "sort".to_string(),
		};

		let id = self.id();
		let max_attempts = self.shuffle_registration_max_attempts;
		for attempt in 1..=max_attempts {
			let registration = client.register_with_shuffle_server(
				&id.host,
				self.shuffle_service_port,
				&id.executor_id,
				&shuffle_info,
			);
			let failure =
				match tokio::time::timeout(self.shuffle_registration_timeout, registration).await {
					Ok(Ok(())) => return Ok(()),
					Ok(Err(e)) => e,
					Err(_) => Error::Timeout,
				};
			if attempt == max_attempts {
				return Err(failure);
			}
			warn!(
				"Error registering with the external shuffle service (attempt {}/{}): {}",
				attempt, max_attempts, failure
			);
			tokio::time::sleep(SHUFFLE_REGISTRATION_BACKOFF).await;
		}
		unreachable!()
	}

	// ---- Put path ----

	/// Store already-serialized bytes at the given level; returns
	/// whether the block is available locally afterwards
	pub async fn put_bytes(
		self: &Arc<Self>,
		block_id: &BlockId,
		bytes: Bytes,
		level: StorageLevel,
		tag: DataTag,
		tell_master: bool,
	) -> Result<bool, Error> {
		if !level.is_valid() {
			return Err(Error::InvalidStorageLevel(level));
		}
		self.do_put_bytes(block_id, bytes, level, tag, tell_master, false)
			.await
	}

	/// Store a block from a record iterator; returns whether the whole
	/// block could be stored
	pub async fn put_values(
		self: &Arc<Self>,
		block_id: &BlockId,
		values: ValuesIter,
		level: StorageLevel,
		tag: DataTag,
		tell_master: bool,
	) -> Result<bool, Error> {
		if !level.is_valid() {
			return Err(Error::InvalidStorageLevel(level));
		}
		Ok(self
			.do_put_values(block_id, values, level, tag, tell_master, false)
			.await?
			.is_none())
	}

	/// Serve the block from cache, or compute, cache and serve it.
	/// When the store cannot hold the computed records, they are handed
	/// back as `Computed` so the caller can still consume them once.
	pub async fn get_or_else_update<F>(
		self: &Arc<Self>,
		block_id: &BlockId,
		level: StorageLevel,
		tag: DataTag,
		make: F,
	) -> Result<CachedOrComputed, Error>
	where
		F: FnOnce() -> ValuesIter,
	{
		if let Some(cached) = self.get(block_id, &tag).await? {
			return Ok(CachedOrComputed::Cached(cached));
		}
		match self
			.do_put_values(
				block_id,
				make(),
				level,
				tag,
				tell_master_default(block_id),
				true,
			)
			.await?
		{
			None => {
				// Stored (or raced with another writer who stored it);
				// we hold a read lock either way
				let cached = self.get_local_values(block_id).await?;
				self.info_manager.unlock(block_id, None);
				match cached {
					Some(values) => Ok(CachedOrComputed::Cached(values)),
					None => Err(Error::BlockNotFound(block_id.clone())),
				}
			}
			Some(leftover) => Ok(CachedOrComputed::Computed(leftover)),
		}
	}

	async fn do_put_bytes(
		self: &Arc<Self>,
		block_id: &BlockId,
		bytes: Bytes,
		level: StorageLevel,
		tag: DataTag,
		tell_master: bool,
		keep_read_lock: bool,
	) -> Result<bool, Error> {
		let new_info = BlockInfo::new(level, tag.clone(), tell_master);
		if !self
			.info_manager
			.lock_new_block_for_writing(block_id, new_info)
			.await
		{
			debug!(
				"Block {} already exists on this machine; not re-adding it",
				block_id
			);
			if !keep_read_lock {
				self.info_manager.unlock(block_id, None);
			}
			return Ok(true);
		}

		let start = Instant::now();

		// The bytes are ready to send as-is, so replication runs in
		// parallel with local placement; the put returns once both are
		// done
		let replication = if level.replication > 1 {
			let this = self.clone();
			let block_id = block_id.clone();
			let data = bytes.clone();
			let tag = tag.clone();
			Some(tokio::spawn(async move {
				this.replicator
					.replicate(
						&*this.master,
						&*this.transport,
						&this.id(),
						&block_id,
						data,
						level,
						tag,
						HashSet::new(),
					)
					.await
			}))
		} else {
			None
		};

		let size = bytes.len() as u64;
		let body = self.put_bytes_body(block_id, &bytes, level, &tag).await;
		let stored = self
			.finish_put(block_id, tell_master, keep_read_lock, body)
			.await?;

		if let Some(replication) = replication {
			match replication.await? {
				Ok(outcome) => {
					self.metrics.replication_counter.add(
						&Context::current(),
						outcome.peers_replicated_to.len() as u64,
						&[],
					);
					self.metrics.replication_failure_counter.add(
						&Context::current(),
						outcome.peers_failed_to_replicate_to.len() as u64,
						&[],
					);
				}
				Err(e) => warn!("Replication of {} failed: {}", block_id, e),
			}
		}

		if stored {
			self.metrics
				.bytes_written
				.add(&Context::current(), size, &[]);
		}
		self.metrics.block_put_duration.record(
			&Context::current(),
			start.elapsed().as_secs_f64(),
			&[],
		);
		Ok(stored)
	}

	async fn put_bytes_body(
		&self,
		block_id: &BlockId,
		bytes: &Bytes,
		level: StorageLevel,
		tag: &DataTag,
	) -> Result<(), Error> {
		if level.use_memory {
			let stored_in_memory = if level.deserialized {
				let values = self.serializer.deserialize_values(tag, bytes)?;
				self.memory_store
					.put_iterator_as_values(block_id, Box::new(values.into_iter()), tag.clone())
					.await
					.is_ok()
			} else {
				let data = bytes.clone();
				self.memory_store
					.put_bytes(
						block_id,
						bytes.len() as u64,
						level.memory_mode(),
						tag.clone(),
						move || Ok(data),
					)
					.await?
			};
			if !stored_in_memory && level.use_disk {
				warn!(
					"Persisting block {} to disk instead of keeping it in memory",
					block_id
				);
				self.disk_store.put_bytes(block_id, bytes).await?;
			}
		} else if level.use_disk {
			self.disk_store.put_bytes(block_id, bytes).await?;
		}
		Ok(())
	}

	/// Returns the leftover record iterator when the block could not be
	/// fully stored, `None` on success
	async fn do_put_values(
		self: &Arc<Self>,
		block_id: &BlockId,
		values: ValuesIter,
		level: StorageLevel,
		tag: DataTag,
		tell_master: bool,
		keep_read_lock: bool,
	) -> Result<Option<ValuesIter>, Error> {
		let new_info = BlockInfo::new(level, tag.clone(), tell_master);
		if !self
			.info_manager
			.lock_new_block_for_writing(block_id, new_info)
			.await
		{
			debug!(
				"Block {} already exists on this machine; not re-adding it",
				block_id
			);
			if !keep_read_lock {
				self.info_manager.unlock(block_id, None);
			}
			return Ok(None);
		}

		let start = Instant::now();
		match self.put_values_body(block_id, values, level, &tag).await {
			Ok(None) => {
				// Values must be serialized before they can travel, so
				// replication happens after local placement, reading
				// the serialized form back
				if level.replication > 1 {
					match self.read_local_bytes(block_id).await {
						Ok(data) => {
							let outcome = self
								.replicator
								.replicate(
									&*self.master,
									&*self.transport,
									&self.id(),
									block_id,
									data,
									level,
									tag.clone(),
									HashSet::new(),
								)
								.await?;
							self.metrics.replication_counter.add(
								&Context::current(),
								outcome.peers_replicated_to.len() as u64,
								&[],
							);
						}
						Err(e) => {
							warn!("Could not read {} back for replication: {}", block_id, e)
						}
					}
				}
				let stored = self
					.finish_put(block_id, tell_master, keep_read_lock, Ok(()))
					.await?;
				self.metrics.block_put_duration.record(
					&Context::current(),
					start.elapsed().as_secs_f64(),
					&[],
				);
				if stored {
					Ok(None)
				} else {
					Ok(Some(Box::new(std::iter::empty())))
				}
			}
			Ok(Some(leftover)) => {
				warn!(
					"Block {} could not be stored; returning its records to the caller",
					block_id
				);
				self.remove_block_internal(block_id, false).await?;
				Ok(Some(leftover))
			}
			Err(e) => self
				.finish_put(block_id, tell_master, keep_read_lock, Err(e))
				.await
				.map(|_| None),
		}
	}

	async fn put_values_body(
		&self,
		block_id: &BlockId,
		values: ValuesIter,
		level: StorageLevel,
		tag: &DataTag,
	) -> Result<Option<ValuesIter>, Error> {
		if level.use_memory {
			if level.deserialized {
				match self
					.memory_store
					.put_iterator_as_values(block_id, values, tag.clone())
					.await
				{
					Ok(_) => Ok(None),
					Err(partial) => {
						if level.use_disk {
							let mut encoded = Vec::new();
							for record in partial {
								self.serializer.serialize_one(tag, &record, &mut encoded)?;
							}
							self.disk_store.put_bytes(block_id, &encoded).await?;
							Ok(None)
						} else {
							Ok(Some(Box::new(partial)))
						}
					}
				}
			} else {
				match self
					.memory_store
					.put_iterator_as_bytes(block_id, values, tag.clone(), level.memory_mode())
					.await?
				{
					Ok(_) => Ok(None),
					Err(partial) => {
						if level.use_disk {
							let bytes = partial.finish_writing()?;
							self.disk_store.put_bytes(block_id, &bytes).await?;
							Ok(None)
						} else {
							Ok(Some(partial.values_iterator()?))
						}
					}
				}
			}
		} else if level.use_disk {
			let mut encoded = Vec::new();
			for record in values {
				self.serializer.serialize_one(tag, &record, &mut encoded)?;
			}
			self.disk_store.put_bytes(block_id, &encoded).await?;
			Ok(None)
		} else {
			Err(Error::InvalidStorageLevel(level))
		}
	}

	/// Close out a put whose body ran under the write lock: compute the
	/// resulting status, report it, release or downgrade the lock, and
	/// clean everything up if the body achieved nothing
	async fn finish_put(
		self: &Arc<Self>,
		block_id: &BlockId,
		tell_master: bool,
		keep_read_lock: bool,
		body: Result<(), Error>,
	) -> Result<bool, Error> {
		match body {
			Ok(()) => {
				let status = self.get_current_block_status(block_id).await;
				if status.storage_level.is_valid() {
					self.info_manager
						.set_size(block_id, cmp::max(status.mem_size, status.disk_size))?;
					if tell_master {
						self.report_block_status(block_id, status).await;
					}
					if keep_read_lock {
						self.info_manager.downgrade_lock(block_id)?;
					} else {
						self.info_manager.unlock(block_id, None);
					}
					debug!("Put block {} ({})", block_id, status.storage_level);
					Ok(true)
				} else {
					warn!(
						"Block {} could not be stored at the requested level",
						block_id
					);
					self.remove_block_internal(block_id, tell_master).await?;
					Ok(false)
				}
			}
			Err(e) => {
				warn!("Putting block {} failed with an exception", block_id);
				if let Err(cleanup) = self.remove_block_internal(block_id, tell_master).await {
					warn!(
						"Could not clean up {} after a failed put: {}",
						block_id, cleanup
					);
				}
				Err(e)
			}
		}
	}

	// ---- Get path ----

	/// Records of a locally stored block, or `None` if this node does
	/// not hold it. The returned iterator keeps a read lock until
	/// exhausted or dropped.
	pub async fn get_local_values(
		self: &Arc<Self>,
		block_id: &BlockId,
	) -> Result<Option<BlockValuesIterator>, Error> {
		let info = match self.info_manager.lock_for_reading(block_id, true).await {
			None => return Ok(None),
			Some(info) => info,
		};
		let guard = LockGuard {
			info_manager: self.info_manager.clone(),
			block_id: block_id.clone(),
			task: current_task_attempt_id(),
		};

		let read = self
			.read_local_values(block_id, &info)
			.bound_record_duration(&self.metrics.block_read_duration)
			.await;
		match read {
			Ok(values) => Ok(Some(BlockValuesIterator {
				values,
				guard: Some(guard),
			})),
			Err(e) => {
				drop(guard);
				Err(self.handle_local_read_failure(block_id, e).await)
			}
		}
	}

	async fn read_local_values(
		&self,
		block_id: &BlockId,
		info: &BlockInfo,
	) -> Result<ValuesIter, Error> {
		if let Some(entry) = self.memory_store.get_entry(block_id) {
			self.metrics
				.bytes_read_local
				.add(&Context::current(), entry.size(), &[]);
			return match entry {
				MemoryEntry::Deserialized { values, .. } => Ok(Box::new(values.into_iter())),
				MemoryEntry::Serialized { bytes, .. } => Ok(Box::new(
					self.serializer
						.deserialize_values(&info.tag, &bytes)?
						.into_iter(),
				)),
			};
		}

		if self.disk_store.contains(block_id).await {
			let bytes = self.disk_store.get_bytes(block_id).await?;
			self.metrics
				.bytes_read_local
				.add(&Context::current(), bytes.len() as u64, &[]);
			if info.level.deserialized {
				let values = self.serializer.deserialize_values(&info.tag, &bytes)?;
				let values = self
					.maybe_cache_disk_values_in_memory(block_id, info, values)
					.await;
				Ok(Box::new(values.into_iter()))
			} else {
				let bytes = self
					.maybe_cache_disk_bytes_in_memory(block_id, info, bytes)
					.await;
				Ok(Box::new(
					self.serializer
						.deserialize_values(&info.tag, &bytes)?
						.into_iter(),
				))
			}
		} else {
			Err(Error::BlockNotFound(block_id.clone()))
		}
	}

	/// Serialized bytes of a locally stored block.
	///
	/// Shuffle blocks come straight from the shuffle resolver, without
	/// touching the lock manager. For other blocks, the level decides
	/// the probing order: blocks stored deserialized are served from
	/// disk when possible (the disk copy is already serialized), the
	/// rest prefer memory.
	pub async fn get_local_bytes(
		self: &Arc<Self>,
		block_id: &BlockId,
	) -> Result<Option<BlockData>, Error> {
		if block_id.is_shuffle() {
			let resolver = self
				.shuffle_resolver
				.as_ref()
				.ok_or_message("No shuffle resolver configured")?;
			let bytes = resolver.get_block_data(block_id)?;
			return Ok(Some(BlockData { bytes, guard: None }));
		}

		if self
			.info_manager
			.lock_for_reading(block_id, true)
			.await
			.is_none()
		{
			return Ok(None);
		}
		let guard = LockGuard {
			info_manager: self.info_manager.clone(),
			block_id: block_id.clone(),
			task: current_task_attempt_id(),
		};

		match self.read_local_bytes(block_id).await {
			Ok(bytes) => Ok(Some(BlockData {
				bytes,
				guard: Some(guard),
			})),
			Err(e) => {
				drop(guard);
				Err(self.handle_local_read_failure(block_id, e).await)
			}
		}
	}

	async fn read_local_bytes(&self, block_id: &BlockId) -> Result<Bytes, Error> {
		let info = self
			.info_manager
			.get(block_id)
			.ok_or_else(|| Error::BlockNotFound(block_id.clone()))?;

		if info.level.deserialized {
			if self.disk_store.contains(block_id).await {
				self.disk_store.get_bytes(block_id).await
			} else if let Some(values) = self.memory_store.get_values(block_id) {
				self.serializer.serialize_values(&info.tag, &values)
			} else {
				Err(Error::BlockNotFound(block_id.clone()))
			}
		} else if let Some(bytes) = self.memory_store.get_bytes(block_id) {
			Ok(bytes)
		} else if self.disk_store.contains(block_id).await {
			let bytes = self.disk_store.get_bytes(block_id).await?;
			Ok(self
				.maybe_cache_disk_bytes_in_memory(block_id, &info, bytes)
				.await)
		} else {
			Err(Error::BlockNotFound(block_id.clone()))
		}
	}

	/// Records of a block, local or remote; `None` if nobody holds it
	pub async fn get(
		self: &Arc<Self>,
		block_id: &BlockId,
		tag: &DataTag,
	) -> Result<Option<BlockValuesIterator>, Error> {
		if let Some(local) = self.get_local_values(block_id).await? {
			return Ok(Some(local));
		}
		if let Some(buffer) = self.get_remote_bytes(block_id).await? {
			let bytes = buffer.into_bytes().await?;
			self.metrics
				.bytes_read_remote
				.add(&Context::current(), bytes.len() as u64, &[]);
			let values = self.serializer.deserialize_values(tag, &bytes)?;
			return Ok(Some(BlockValuesIterator {
				values: Box::new(values.into_iter()),
				guard: None,
			}));
		}
		Ok(None)
	}

	/// Fetch a block's bytes from a peer holding it
	pub async fn get_remote_bytes(
		&self,
		block_id: &BlockId,
	) -> Result<Option<ManagedBuffer>, Error> {
		let id = self.id();
		self.fetcher
			.fetch(
				&*self.master,
				&*self.transport,
				&*self.temp_file_manager,
				&id,
				block_id,
				&self.metrics,
			)
			.await
	}

	/// A block that was present could not be read back: drop it
	/// everywhere so nobody else trips over it, tell the master, and
	/// surface the corruption
	async fn handle_local_read_failure(
		self: &Arc<Self>,
		block_id: &BlockId,
		cause: Error,
	) -> Error {
		warn!(
			"Failed to read locally stored block {}: {}",
			block_id, cause
		);
		self.metrics
			.corruption_counter
			.add(&Context::current(), 1, &[]);
		if let Err(e) = self.remove_block(block_id, true).await {
			warn!("Could not remove unreadable block {}: {}", block_id, e);
		}
		Error::CorruptBlock(block_id.clone())
	}

	async fn maybe_cache_disk_values_in_memory(
		&self,
		block_id: &BlockId,
		info: &BlockInfo,
		values: Vec<Bytes>,
	) -> Vec<Bytes> {
		if !info.level.use_memory || self.memory_store.contains(block_id) {
			return values;
		}
		match self
			.memory_store
			.put_iterator_as_values(block_id, Box::new(values.into_iter()), info.tag.clone())
			.await
		{
			Ok(_) => self.memory_store.get_values(block_id).unwrap_or_default(),
			Err(partial) => partial.collect(),
		}
	}

	async fn maybe_cache_disk_bytes_in_memory(
		&self,
		block_id: &BlockId,
		info: &BlockInfo,
		bytes: Bytes,
	) -> Bytes {
		if !info.level.use_memory
			|| info.level.deserialized
			|| self.memory_store.contains(block_id)
		{
			return bytes;
		}
		let data = bytes.clone();
		let cached = self
			.memory_store
			.put_bytes(
				block_id,
				bytes.len() as u64,
				info.level.memory_mode(),
				info.tag.clone(),
				move || Ok(data),
			)
			.await
			.unwrap_or(false);
		if cached {
			self.memory_store.get_bytes(block_id).unwrap_or(bytes)
		} else {
			bytes
		}
	}

	// ---- Eviction ----

	/// Drop a block from the memory tier, spilling it to disk first
	/// when its level allows. Runs under the victim's write lock, held
	/// by the memory store's eviction loop.
	pub(crate) async fn drop_from_memory(
		self: &Arc<Self>,
		block_id: &BlockId,
		entry: &MemoryEntry,
	) -> Result<StorageLevel, Error> {
		info!("Dropping block {} from memory", block_id);
		let info = self
			.info_manager
			.assert_block_is_locked_for_writing(block_id)?;

		if info.level.use_disk && !self.disk_store.contains(block_id).await {
			debug!("Writing block {} to disk", block_id);
			let bytes = match entry {
				MemoryEntry::Serialized { bytes, .. } => bytes.clone(),
				MemoryEntry::Deserialized { values, .. } => {
					self.serializer.serialize_values(&info.tag, values)?
				}
			};
			self.disk_store.put_bytes(block_id, &bytes).await?;
			self.metrics
				.spilled_counter
				.add(&Context::current(), 1, &[]);
		}

		if self.memory_store.remove(block_id) {
			self.metrics
				.evicted_counter
				.add(&Context::current(), 1, &[]);
		}

		let status = self.get_current_block_status(block_id).await;
		if info.tell_master {
			self.report_block_status(block_id, status).await;
		}
		Ok(status.storage_level)
	}

	// ---- Status reporting ----

	/// Snapshot of where the block lives right now, synthesized from
	/// the stores; never trusts previously recorded sizes
	pub async fn get_current_block_status(&self, block_id: &BlockId) -> BlockStatus {
		let info = match self.info_manager.get(block_id) {
			None => return BlockStatus::empty(),
			Some(info) => info,
		};

		let in_mem = self.memory_store.contains(block_id);
		let on_disk = self.disk_store.contains(block_id).await;
		let mem_size = if in_mem {
			self.memory_store.get_size(block_id).unwrap_or(0)
		} else {
			0
		};
		let disk_size = if on_disk {
			self.disk_store.get_size(block_id).await.unwrap_or(0)
		} else {
			0
		};
		let replication = if in_mem || on_disk {
			info.level.replication
		} else {
			1
		};

		BlockStatus {
			storage_level: StorageLevel {
				use_disk: on_disk,
				use_memory: in_mem,
				use_off_heap: info.level.use_off_heap && in_mem,
				deserialized: info.level.deserialized && in_mem,
				replication,
			},
			mem_size,
			disk_size,
		}
	}

	/// Directory-style status of a block, if it is known here
	pub async fn get_status(&self, block_id: &BlockId) -> Option<BlockStatus> {
		self.info_manager.get(block_id)?;
		Some(self.get_current_block_status(block_id).await)
	}

	/// All block ids known to this node (in either store) passing the
	/// filter
	pub async fn get_matching_block_ids<F>(&self, filter: F) -> Result<Vec<BlockId>, Error>
	where
		F: Fn(&BlockId) -> bool,
	{
		let mut ids: HashSet<BlockId> = self
			.info_manager
			.entries()
			.into_iter()
			.map(|(id, _)| id)
			.collect();
		ids.extend(self.disk_store.list_blocks().await?);
		Ok(ids.into_iter().filter(|id| filter(id)).collect())
	}

	/// Report one block's status to the master; a negative reply means
	/// the master no longer knows us and triggers an asynchronous
	/// re-registration
	async fn report_block_status(self: &Arc<Self>, block_id: &BlockId, status: BlockStatus) {
		let acknowledged = self.try_to_report_block_status(block_id, &status).await;
		if !acknowledged {
			info!("Got told to re-register updating block {}", block_id);
			self.async_reregister();
		}
		self.post_event(StorageEvent::BlockUpdated {
			block_manager_id: (*self.id()).clone(),
			block_id: block_id.clone(),
			status,
		});
	}

	async fn try_to_report_block_status(&self, block_id: &BlockId, status: &BlockStatus) -> bool {
		let id = self.id();
		match self
			.master
			.update_block_info(
				&id,
				block_id,
				status.storage_level,
				status.mem_size,
				status.disk_size,
			)
			.await
		{
			Ok(acknowledged) => acknowledged,
			Err(e) => {
				// Best effort; the next heartbeat will retry
				warn!(
					"Failed to report status of {} to the master: {}",
					block_id, e
				);
				true
			}
		}
	}

	/// Re-report every block to the master. Re-entrant and idempotent;
	/// gives up silently on failure, the next heartbeat re-drives it.
	pub async fn report_all_blocks(self: &Arc<Self>) {
		let entries = self.info_manager.entries();
		info!("Reporting {} blocks to the master", entries.len());
		for (block_id, info) in entries {
			if !info.tell_master {
				continue;
			}
			let status = self.get_current_block_status(&block_id).await;
			if !self.try_to_report_block_status(&block_id, &status).await {
				error!("Failed to report {} to the master; giving up", block_id);
				return;
			}
		}
	}

	/// Re-register with the master and re-report all blocks
	pub async fn reregister(self: &Arc<Self>) -> Result<(), Error> {
		info!("{} re-registering with master", self.id());
		self.register_with_master().await?;
		self.report_all_blocks().await;
		Ok(())
	}

	fn async_reregister(self: &Arc<Self>) {
		if !self.reregistering.swap(true, Ordering::SeqCst) {
			let this = self.clone();
			tokio::spawn(async move {
				if let Err(e) = this.reregister().await {
					error!("Re-registration with the master failed: {}", e);
				}
				this.reregistering.store(false, Ordering::SeqCst);
			});
		}
	}

	fn post_event(&self, event: StorageEvent) {
		if !self.track_updated_block_statuses {
			return;
		}
		if let Some(queue) = &self.event_queue {
			queue.post(event);
		}
	}

	// ---- Removal ----

	/// Remove a block from both tiers and from the metadata, notifying
	/// the master when asked to (and when the block is reportable)
	pub async fn remove_block(
		self: &Arc<Self>,
		block_id: &BlockId,
		tell_master: bool,
	) -> Result<(), Error> {
		debug!("Removing block {}", block_id);
		match self.info_manager.lock_for_writing(block_id, true).await {
			None => {
				// Removals are routinely replayed by the master
				warn!("Asked to remove block {}, which does not exist", block_id);
				Ok(())
			}
			Some(info) => {
				self.remove_block_internal(block_id, tell_master && info.tell_master)
					.await?;
				self.metrics
					.removed_counter
					.add(&Context::current(), 1, &[]);
				self.post_event(StorageEvent::BlockRemoved {
					block_manager_id: (*self.id()).clone(),
					block_id: block_id.clone(),
				});
				Ok(())
			}
		}
	}

	/// Remove a block while holding its write lock
	async fn remove_block_internal(
		self: &Arc<Self>,
		block_id: &BlockId,
		tell_master: bool,
	) -> Result<(), Error> {
		let removed_from_memory = self.memory_store.remove(block_id);
		let removed_from_disk = self.disk_store.remove(block_id).await?;
		if !removed_from_memory && !removed_from_disk {
			debug!(
				"Block {} could not be removed as it was not found on disk or in memory",
				block_id
			);
		}
		self.info_manager.remove_block(block_id)?;
		if tell_master {
			self.report_block_status(block_id, BlockStatus::empty())
				.await;
		}
		Ok(())
	}

	/// Remove all blocks of a dataset; returns how many were dropped
	pub async fn remove_rdd(self: &Arc<Self>, rdd_id: u32) -> Result<usize, Error> {
		info!("Removing RDD {}", rdd_id);
		let blocks: Vec<BlockId> = self
			.info_manager
			.entries()
			.into_iter()
			.map(|(id, _)| id)
			.filter(|id| id.rdd_id() == Some(rdd_id))
			.collect();
		for block_id in blocks.iter() {
			self.remove_block(block_id, true).await?;
		}
		Ok(blocks.len())
	}

	/// Remove all pieces of a broadcast variable
	pub async fn remove_broadcast(self: &Arc<Self>, broadcast_id: u64) -> Result<usize, Error> {
		debug!("Removing broadcast {}", broadcast_id);
		let blocks: Vec<BlockId> = self
			.info_manager
			.entries()
			.into_iter()
			.map(|(id, _)| id)
			.filter(|id| id.broadcast_id() == Some(broadcast_id))
			.collect();
		for block_id in blocks.iter() {
			self.remove_block(block_id, true).await?;
		}
		Ok(blocks.len())
	}

	// ---- Task boundaries ----

	/// Release every block lock a finished or failed task still holds
	pub fn release_all_locks_for_task(&self, task: TaskAttemptId) -> Vec<BlockId> {
		self.info_manager.release_all_locks_for_task(task)
	}

	// ---- Shutdown ----

	pub async fn stop(&self) -> Result<(), Error> {
		debug!("Stopping block manager {}", self.id());
		self.temp_file_manager.stop().await?;
		self.memory_store.clear();
		self.disk_store.cleanup().await?;
		Ok(())
	}
}

// Broadcast pieces are managed by the driver and never reported
fn tell_master_default(block_id: &BlockId) -> bool {
	!block_id.is_broadcast()
}

#[async_trait]
impl EndpointHandler<BlockManagerRpc> for BlockManager {
	async fn handle(
		self: &Arc<Self>,
		message: &BlockManagerRpc,
		_from: BlockManagerId,
	) -> Result<BlockManagerRpc, Error> {
		match message {
			BlockManagerRpc::ReplicateBlock {
				block_id,
				data,
				level,
				tag,
			} => {
				self.put_bytes(
					block_id,
					Bytes::from(data.clone()),
					*level,
					tag.clone(),
					true,
				)
				.await?;
				Ok(BlockManagerRpc::Ok)
			}
			BlockManagerRpc::RemoveBlock(block_id) => {
				self.remove_block(block_id, true).await?;
				Ok(BlockManagerRpc::Ok)
			}
			BlockManagerRpc::RemoveRdd(rdd_id) => Ok(BlockManagerRpc::RemovedCount(
				self.remove_rdd(*rdd_id).await?,
			)),
			BlockManagerRpc::RemoveBroadcast(broadcast_id) => Ok(BlockManagerRpc::RemovedCount(
				self.remove_broadcast(*broadcast_id).await?,
			)),
			BlockManagerRpc::GetBlockStatus(block_id) => Ok(BlockManagerRpc::BlockStatusReply(
				self.get_status(block_id).await,
			)),
			m => Err(Error::unexpected_rpc_message(m)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use tempest_util::data;
	use tempest_util::memory::StaticMemoryAccountant;
	use tempest_util::values::{MsgPackSerializer, Record};

	use crate::testing::{MockMaster, MockTransport};

	struct Fixture {
		manager: Arc<BlockManager>,
		master: Arc<MockMaster>,
		transport: Arc<MockTransport>,
		_dir: mktemp::Temp,
	}

	async fn fixture(mem_budget: u64, peers: Vec<BlockManagerId>) -> Fixture {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut conf = Config::default();
		conf.local_dirs = vec![dir.to_path_buf()];
		conf.unroll_memory_threshold = 8;

		let master = Arc::new(MockMaster::new(peers));
		let transport = Arc::new(MockTransport::new());
		let manager = BlockManager::new(
			&conf,
			BlockManagerId::new("exec-0", "host-0", 7000),
			master.clone(),
			transport.clone(),
			Arc::new(StaticMemoryAccountant::new(mem_budget, 0)),
			Arc::new(MsgPackSerializer),
			None,
			None,
			None,
		)
		.unwrap();
		manager.initialize().await.unwrap();

		Fixture {
			manager,
			master,
			transport,
			_dir: dir,
		}
	}

	fn rdd(rdd_id: u32, split_index: u32) -> BlockId {
		BlockId::Rdd { rdd_id, split_index }
	}

	fn tag() -> DataTag {
		DataTag::of("test")
	}

	fn records() -> Vec<Record> {
		vec![
			Bytes::from_static(b"aaaa"),
			Bytes::from_static(b"bbbb"),
			Bytes::from_static(b"cccc"),
		]
	}

	#[tokio::test]
	async fn test_memory_only_put_and_get() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);

		let stored = f
			.manager
			.put_bytes(
				&id,
				Bytes::from_static(b"\x01\x02\x03"),
				data::MEMORY_ONLY_SER,
				tag(),
				true,
			)
			.await
			.unwrap();
		assert!(stored);

		let read = f.manager.get_local_bytes(&id).await.unwrap().unwrap();
		assert_eq!(read.bytes(), &Bytes::from_static(b"\x01\x02\x03"));
		drop(read);

		let status = f.manager.get_status(&id).await.unwrap();
		assert!(status.storage_level.is_valid());
		assert_eq!(status.mem_size, 3);
		assert_eq!(status.disk_size, 0);

		assert_eq!(
			f.master.last_update_for(&id).map(|(_, mem, disk)| (mem, disk)),
			Some((3, 0))
		);
	}

	#[tokio::test]
	async fn test_values_roundtrip_and_lock_release() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);

		assert!(f
			.manager
			.put_values(
				&id,
				Box::new(records().into_iter()),
				data::MEMORY_ONLY,
				tag(),
				true,
			)
			.await
			.unwrap());

		let values = f.manager.get_local_values(&id).await.unwrap().unwrap();
		assert_eq!(values.collect::<Vec<_>>(), records());

		use tempest_util::task::NON_TASK_WRITER;
		assert_eq!(f.manager.info_manager.task_lock_count(NON_TASK_WRITER), 0);
	}

	#[tokio::test]
	async fn test_spill_under_pressure() {
		// 10 bytes of memory; the second 8-byte block pushes the first
		// one out, and its level says spill to disk
		let f = fixture(10, vec![]).await;
		let first = rdd(1, 0);
		let second = rdd(2, 0);

		for (id, data) in &[(&first, b"aaaaaaaa"), (&second, b"bbbbbbbb")] {
			assert!(f
				.manager
				.put_bytes(
					id,
					Bytes::from_static(*data),
					data::MEMORY_AND_DISK_SER,
					tag(),
					true,
				)
				.await
				.unwrap());
		}

		let first_status = f.manager.get_status(&first).await.unwrap();
		assert_eq!(first_status.mem_size, 0);
		assert_eq!(first_status.disk_size, 8);
		assert!(first_status.storage_level.use_disk);
		assert!(!first_status.storage_level.use_memory);

		let second_status = f.manager.get_status(&second).await.unwrap();
		assert_eq!(second_status.mem_size, 8);
		assert_eq!(second_status.disk_size, 0);

		// The master sees the spill as one consistent update
		assert_eq!(
			f.master
				.last_update_for(&first)
				.map(|(_, mem, disk)| (mem, disk)),
			Some((0, 8))
		);

		for (id, data) in &[(&first, b"aaaaaaaa"), (&second, b"bbbbbbbb")] {
			let read = f.manager.get_local_bytes(id).await.unwrap().unwrap();
			assert_eq!(read.bytes(), &Bytes::from_static(*data));
		}
	}

	#[tokio::test]
	async fn test_memory_only_eviction_loses_block() {
		let f = fixture(10, vec![]).await;
		let first = rdd(1, 0);
		let second = rdd(2, 0);

		for id in &[&first, &second] {
			assert!(f
				.manager
				.put_bytes(
					id,
					Bytes::from_static(b"xxxxxxxx"),
					data::MEMORY_ONLY_SER,
					tag(),
					true,
				)
				.await
				.unwrap());
		}

		// No disk fallback: the first block is gone entirely
		assert!(f.manager.get_status(&first).await.is_none());
		assert!(!f.manager.memory_store.contains(&first));
		assert!(!f.manager.disk_store.contains(&first).await);
		let (level, mem, disk) = f.master.last_update_for(&first).unwrap();
		assert!(!level.is_valid());
		assert_eq!((mem, disk), (0, 0));

		assert!(f.manager.get_status(&second).await.is_some());
	}

	#[tokio::test]
	async fn test_remove_block() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);

		assert!(f
			.manager
			.put_bytes(
				&id,
				Bytes::from_static(b"data"),
				data::MEMORY_AND_DISK_SER,
				tag(),
				true,
			)
			.await
			.unwrap());
		f.manager.remove_block(&id, true).await.unwrap();

		assert!(!f.manager.memory_store.contains(&id));
		assert!(!f.manager.disk_store.contains(&id).await);
		assert!(f
			.manager
			.info_manager
			.lock_for_reading(&id, true)
			.await
			.is_none());
		let (level, mem, disk) = f.master.last_update_for(&id).unwrap();
		assert!(!level.is_valid());
		assert_eq!((mem, disk), (0, 0));

		// Removing again is fine
		f.manager.remove_block(&id, true).await.unwrap();
	}

	#[tokio::test]
	async fn test_put_existing_block_is_a_no_op() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);

		for _ in 0..2 {
			assert!(f
				.manager
				.put_bytes(
					&id,
					Bytes::from_static(b"data"),
					data::MEMORY_ONLY_SER,
					tag(),
					true,
				)
				.await
				.unwrap());
		}

		let updates = f
			.master
			.updates
			.lock()
			.unwrap()
			.iter()
			.filter(|(block, _, _, _)| block == &id)
			.count();
		assert_eq!(updates, 1);
	}

	#[tokio::test]
	async fn test_rejected_update_triggers_reregistration() {
		let f = fixture(1000, vec![]).await;
		assert_eq!(f.master.registrations(), 1);
		f.master.reject_updates();

		assert!(f
			.manager
			.put_bytes(
				&rdd(1, 0),
				Bytes::from_static(b"data"),
				data::MEMORY_ONLY_SER,
				tag(),
				true,
			)
			.await
			.unwrap());

		for _ in 0..100 {
			if f.master.registrations() >= 2 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(f.master.registrations() >= 2);
		f.master.accept_updates();
	}

	#[tokio::test]
	async fn test_byte_put_replicates_to_peer() {
		let peer = BlockManagerId::new("exec-1", "host-1", 7001);
		let f = fixture(1000, vec![peer]).await;
		let id = rdd(1, 0);

		assert!(f
			.manager
			.put_bytes(
				&id,
				Bytes::from_static(b"replicated"),
				data::MEMORY_ONLY_SER.with_replication(2),
				tag(),
				true,
			)
			.await
			.unwrap());

		let uploads = f.transport.uploads();
		assert_eq!(uploads.len(), 1);
		assert_eq!(uploads[0].0, "exec-1");
		assert_eq!(uploads[0].2, Bytes::from_static(b"replicated"));
		// Peers store their copy without replicating further
		assert_eq!(uploads[0].3.replication, 1);
	}

	#[tokio::test]
	async fn test_value_put_replicates_serialized_form() {
		let peer = BlockManagerId::new("exec-1", "host-1", 7001);
		let f = fixture(1000, vec![peer]).await;
		let id = rdd(1, 0);

		assert!(f
			.manager
			.put_values(
				&id,
				Box::new(records().into_iter()),
				data::MEMORY_ONLY.with_replication(2),
				tag(),
				true,
			)
			.await
			.unwrap());

		let uploads = f.transport.uploads();
		assert_eq!(uploads.len(), 1);
		let expected = MsgPackSerializer
			.serialize_values(&tag(), &records())
			.unwrap();
		assert_eq!(uploads[0].2, expected);
	}

	#[tokio::test]
	async fn test_disk_only_put_values() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);

		assert!(f
			.manager
			.put_values(
				&id,
				Box::new(records().into_iter()),
				data::DISK_ONLY,
				tag(),
				true,
			)
			.await
			.unwrap());

		assert!(!f.manager.memory_store.contains(&id));
		assert!(f.manager.disk_store.contains(&id).await);

		let values = f.manager.get_local_values(&id).await.unwrap().unwrap();
		assert_eq!(values.collect::<Vec<_>>(), records());
	}

	#[tokio::test]
	async fn test_get_or_else_update() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);

		let outcome = f
			.manager
			.get_or_else_update(&id, data::MEMORY_ONLY, tag(), || {
				Box::new(records().into_iter())
			})
			.await
			.unwrap();
		match outcome {
			CachedOrComputed::Cached(values) => {
				assert_eq!(values.collect::<Vec<_>>(), records())
			}
			CachedOrComputed::Computed(_) => panic!("block should have been cached"),
		}
		assert!(f.manager.memory_store.contains(&id));

		// Second call is served from the cache; the compute closure
		// must not run
		let outcome = f
			.manager
			.get_or_else_update(&id, data::MEMORY_ONLY, tag(), || {
				panic!("computed a cached block")
			})
			.await
			.unwrap();
		match outcome {
			CachedOrComputed::Cached(values) => {
				assert_eq!(values.collect::<Vec<_>>(), records())
			}
			CachedOrComputed::Computed(_) => panic!("block should have been cached"),
		}

		use tempest_util::task::NON_TASK_WRITER;
		assert_eq!(f.manager.info_manager.task_lock_count(NON_TASK_WRITER), 0);
	}

	#[tokio::test]
	async fn test_remove_rdd_removes_only_matching_blocks() {
		let f = fixture(1000, vec![]).await;
		for id in &[rdd(1, 0), rdd(1, 1), rdd(2, 0)] {
			assert!(f
				.manager
				.put_bytes(
					id,
					Bytes::from_static(b"data"),
					data::MEMORY_ONLY_SER,
					tag(),
					true,
				)
				.await
				.unwrap());
		}

		assert_eq!(f.manager.remove_rdd(1).await.unwrap(), 2);
		assert!(f.manager.get_status(&rdd(1, 0)).await.is_none());
		assert!(f.manager.get_status(&rdd(1, 1)).await.is_none());
		assert!(f.manager.get_status(&rdd(2, 0)).await.is_some());
	}

	#[tokio::test]
	async fn test_get_matching_block_ids() {
		let f = fixture(1000, vec![]).await;
		for id in &[rdd(1, 0), rdd(2, 0)] {
			assert!(f
				.manager
				.put_bytes(
					id,
					Bytes::from_static(b"data"),
					data::MEMORY_AND_DISK_SER,
					tag(),
					true,
				)
				.await
				.unwrap());
		}

		let mut matching = f
			.manager
			.get_matching_block_ids(|id| id.rdd_id() == Some(1))
			.await
			.unwrap();
		matching.sort();
		assert_eq!(matching, vec![rdd(1, 0)]);
	}

	#[tokio::test]
	async fn test_block_updates_reach_the_scheduler_event_queue() {
		use std::sync::Mutex;

		struct Recorder {
			seen: Mutex<Vec<String>>,
		}
		impl tempest_util::event_queue::EventListener<StorageEvent> for Recorder {
			fn on_event(&self, event: &StorageEvent) {
				let line = match event {
					StorageEvent::BlockUpdated { block_id, status, .. } => {
						format!("updated {} mem={}", block_id, status.mem_size)
					}
					StorageEvent::BlockRemoved { block_id, .. } => {
						format!("removed {}", block_id)
					}
				};
				self.seen.lock().unwrap().push(line);
			}
		}

		let dir = mktemp::Temp::new_dir().unwrap();
		let mut conf = Config::default();
		conf.local_dirs = vec![dir.to_path_buf()];
		conf.track_updated_block_statuses = true;

		let queue = Arc::new(AsyncEventQueue::new("storage", 100));
		let recorder = Arc::new(Recorder {
			seen: Mutex::new(Vec::new()),
		});
		queue.add_listener(recorder.clone());
		queue.start().unwrap();

		let manager = BlockManager::new(
			&conf,
			BlockManagerId::new("exec-0", "host-0", 7000),
			Arc::new(MockMaster::new(vec![])),
			Arc::new(MockTransport::new()),
			Arc::new(StaticMemoryAccountant::new(1000, 0)),
			Arc::new(MsgPackSerializer),
			None,
			None,
			Some(queue.clone()),
		)
		.unwrap();
		manager.initialize().await.unwrap();

		let id = rdd(1, 0);
		assert!(manager
			.put_bytes(
				&id,
				Bytes::from_static(b"xyz"),
				data::MEMORY_ONLY_SER,
				tag(),
				true,
			)
			.await
			.unwrap());
		manager.remove_block(&id, true).await.unwrap();

		assert!(queue.wait_until_empty(Duration::from_secs(5)).await);
		let seen = recorder.seen.lock().unwrap().clone();
		assert_eq!(
			seen,
			vec![
				"updated rdd_1_0 mem=3".to_string(),
				"updated rdd_1_0 mem=0".to_string(),
				"removed rdd_1_0".to_string(),
			]
		);
		queue.stop().await.unwrap();
	}

	#[tokio::test]
	async fn test_endpoint_directives_are_idempotent() {
		let f = fixture(1000, vec![]).await;
		let id = rdd(1, 0);
		let peer = BlockManagerId::new("exec-9", "host-9", 7009);

		let replicate = BlockManagerRpc::ReplicateBlock {
			block_id: id.clone(),
			data: b"pushed".to_vec(),
			level: data::MEMORY_ONLY_SER,
			tag: tag(),
		};
		for _ in 0..2 {
			let reply = f.manager.handle(&replicate, peer.clone()).await.unwrap();
			assert!(matches!(reply, BlockManagerRpc::Ok));
		}
		assert!(f.manager.memory_store.contains(&id));

		let reply = f
			.manager
			.handle(&BlockManagerRpc::GetBlockStatus(id.clone()), peer.clone())
			.await
			.unwrap();
		match reply {
			BlockManagerRpc::BlockStatusReply(Some(status)) => assert_eq!(status.mem_size, 6),
			other => panic!("unexpected reply: {:?}", other),
		}

		for _ in 0..2 {
			let reply = f
				.manager
				.handle(&BlockManagerRpc::RemoveBlock(id.clone()), peer.clone())
				.await
				.unwrap();
			assert!(matches!(reply, BlockManagerRpc::Ok));
		}
		assert!(!f.manager.memory_store.contains(&id));
	}
}
