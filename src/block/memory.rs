//! Bounded in-memory block tier

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;

use tempest_util::data::*;
use tempest_util::error::Error;
use tempest_util::memory::MemoryAccountant;
use tempest_util::values::{BlockSerializer, Record, ValuesIter};

use crate::info::BlockInfoManager;

/// How a block is held in memory
#[derive(Clone)]
pub enum MemoryEntry {
	Serialized {
		bytes: Bytes,
		mode: MemoryMode,
		tag: DataTag,
	},
	Deserialized {
		values: Vec<Record>,
		size: u64,
		tag: DataTag,
	},
}

impl MemoryEntry {
	pub fn size(&self) -> u64 {
		match self {
			MemoryEntry::Serialized { bytes, .. } => bytes.len() as u64,
			MemoryEntry::Deserialized { size, .. } => *size,
		}
	}

	pub fn mode(&self) -> MemoryMode {
		match self {
			MemoryEntry::Serialized { mode, .. } => *mode,
			// Values are never stored off-heap
			MemoryEntry::Deserialized { .. } => MemoryMode::OnHeap,
		}
	}

	pub fn tag(&self) -> &DataTag {
		match self {
			MemoryEntry::Serialized { tag, .. } => tag,
			MemoryEntry::Deserialized { tag, .. } => tag,
		}
	}
}

/// Owner-side callback invoked for each eviction victim, while the
/// store holds the victim's write lock. Returns the level the block
/// effectively has afterwards (`NONE` if it is fully lost).
#[async_trait]
pub trait EvictionHandler: Send + Sync {
	async fn drop_from_memory(&self, id: &BlockId, entry: &MemoryEntry)
		-> Result<StorageLevel, Error>;
}

struct Entries {
	map: HashMap<BlockId, MemoryEntry>,
	// Insertion order; the front is the eviction candidate
	order: VecDeque<BlockId>,
}

/// In-memory tier, bounded by the memory accountant's storage budget.
///
/// Blocks are admitted only when the accountant grants a reservation;
/// when it declines, least-recently-inserted victims are dropped
/// through the owner's `EvictionHandler` (which may spill them to
/// disk) and the reservation is retried once.
pub struct MemoryStore {
	accountant: Arc<dyn MemoryAccountant>,
	serializer: Arc<dyn BlockSerializer>,
	info_manager: Arc<BlockInfoManager>,
	eviction_handler: ArcSwapOption<Box<dyn EvictionHandler>>,
	entries: Mutex<Entries>,

	unroll_memory_threshold: u64,
	unroll_growth_factor: f64,
}

// Reservation checks happen every that many records while unrolling
const UNROLL_CHECK_PERIOD: u64 = 16;

impl MemoryStore {
	pub fn new(
		accountant: Arc<dyn MemoryAccountant>,
		serializer: Arc<dyn BlockSerializer>,
		info_manager: Arc<BlockInfoManager>,
		unroll_memory_threshold: u64,
		unroll_growth_factor: f64,
	) -> Self {
		Self {
			accountant,
			serializer,
			info_manager,
			eviction_handler: ArcSwapOption::new(None),
			entries: Mutex::new(Entries {
				map: HashMap::new(),
				order: VecDeque::new(),
			}),
			unroll_memory_threshold,
			unroll_growth_factor,
		}
	}

	/// Install the owner's eviction callback; must happen before the
	/// first put
	pub fn set_eviction_handler(&self, handler: Box<dyn EvictionHandler>) {
		self.eviction_handler.store(Some(Arc::new(handler)));
	}

	// ---- Writing blocks ----

	/// Store a block of known size. `materialize` is invoked exactly
	/// once, only after the reservation was granted, so that an
	/// oversize block is never brought into memory at all.
	pub async fn put_bytes<F>(
		&self,
		id: &BlockId,
		size: u64,
		mode: MemoryMode,
		tag: DataTag,
		materialize: F,
	) -> Result<bool, Error>
	where
		F: FnOnce() -> Result<Bytes, Error>,
	{
		if !self.reserve_with_eviction(id, size, mode).await {
			return Ok(false);
		}

		let bytes = match materialize() {
			Ok(bytes) => bytes,
			Err(e) => {
				self.accountant.release_storage_memory(size, mode);
				return Err(e);
			}
		};
		debug_assert_eq!(bytes.len() as u64, size);

		self.insert(id, MemoryEntry::Serialized { bytes, mode, tag });
		trace!("Block {} stored as {} bytes in memory", id, size);
		Ok(true)
	}

	/// Unroll an iterator of records into memory, growing the
	/// reservation as the data arrives. On decline, the records read so
	/// far are handed back in front of the rest of the iterator.
	pub async fn put_iterator_as_values(
		&self,
		id: &BlockId,
		mut values: ValuesIter,
		tag: DataTag,
	) -> Result<u64, PartiallyUnrolledValues> {
		let mode = MemoryMode::OnHeap;
		let mut reserved = self.unroll_memory_threshold;
		if !self.reserve_with_eviction(id, reserved, mode).await {
			return Err(PartiallyUnrolledValues {
				accountant: self.accountant.clone(),
				mode,
				reserved: 0,
				unrolled: Vec::new().into_iter(),
				rest: Some(values),
			});
		}

		let mut unrolled: Vec<Record> = Vec::new();
		let mut used: u64 = 0;
		let mut count: u64 = 0;

		while let Some(record) = values.next() {
			used += record.len() as u64;
			unrolled.push(record);
			count += 1;

			if count % UNROLL_CHECK_PERIOD == 0 && used > reserved {
				let target = std::cmp::max(
					used,
					(reserved as f64 * self.unroll_growth_factor) as u64,
				);
				if !self.reserve_with_eviction(id, target - reserved, mode).await {
					return Err(PartiallyUnrolledValues {
						accountant: self.accountant.clone(),
						mode,
						reserved,
						unrolled: unrolled.into_iter(),
						rest: Some(values),
					});
				}
				reserved = target;
			}
		}

		// Trim the reservation to the actual size of the block
		if used > reserved {
			if !self.reserve_with_eviction(id, used - reserved, mode).await {
				return Err(PartiallyUnrolledValues {
					accountant: self.accountant.clone(),
					mode,
					reserved,
					unrolled: unrolled.into_iter(),
					rest: Some(values),
				});
			}
		} else {
			self.accountant.release_storage_memory(reserved - used, mode);
		}

		self.insert(
			id,
			MemoryEntry::Deserialized {
				values: unrolled,
				size: used,
				tag,
			},
		);
		trace!("Block {} stored as {} unrolled bytes in memory", id, used);
		Ok(used)
	}

	/// Like `put_iterator_as_values`, but encoding the records on the
	/// fly so the block ends up in serialized form. Serializer failures
	/// propagate; running out of memory does not.
	pub async fn put_iterator_as_bytes(
		&self,
		id: &BlockId,
		mut values: ValuesIter,
		tag: DataTag,
		mode: MemoryMode,
	) -> Result<Result<u64, PartiallySerializedValues>, Error> {
		let mut reserved = self.unroll_memory_threshold;
		if !self.reserve_with_eviction(id, reserved, mode).await {
			return Ok(Err(PartiallySerializedValues {
				accountant: self.accountant.clone(),
				serializer: self.serializer.clone(),
				mode,
				tag,
				reserved: 0,
				encoded: Vec::new(),
				rest: Some(values),
			}));
		}

		let mut encoded: Vec<u8> = Vec::new();
		let mut count: u64 = 0;

		loop {
			let record = match values.next() {
				Some(record) => record,
				None => break,
			};
			if let Err(e) = self.serializer.serialize_one(&tag, &record, &mut encoded) {
				self.accountant.release_storage_memory(reserved, mode);
				return Err(e);
			}
			count += 1;

			let used = encoded.len() as u64;
			if count % UNROLL_CHECK_PERIOD == 0 && used > reserved {
				let target = std::cmp::max(
					used,
					(reserved as f64 * self.unroll_growth_factor) as u64,
				);
				if !self.reserve_with_eviction(id, target - reserved, mode).await {
					return Ok(Err(PartiallySerializedValues {
						accountant: self.accountant.clone(),
						serializer: self.serializer.clone(),
						mode,
						tag,
						reserved,
						encoded,
						rest: Some(values),
					}));
				}
				reserved = target;
			}
		}

		let used = encoded.len() as u64;
		if used > reserved {
			if !self.reserve_with_eviction(id, used - reserved, mode).await {
				return Ok(Err(PartiallySerializedValues {
					accountant: self.accountant.clone(),
					serializer: self.serializer.clone(),
					mode,
					tag,
					reserved,
					encoded,
					rest: Some(values),
				}));
			}
		} else {
			self.accountant.release_storage_memory(reserved - used, mode);
		}

		self.insert(
			id,
			MemoryEntry::Serialized {
				bytes: encoded.into(),
				mode,
				tag,
			},
		);
		Ok(Ok(used))
	}

	// ---- Reading blocks ----

	pub fn get_entry(&self, id: &BlockId) -> Option<MemoryEntry> {
		self.entries.lock().unwrap().map.get(id).cloned()
	}

	/// Records of a block stored in deserialized form
	pub fn get_values(&self, id: &BlockId) -> Option<Vec<Record>> {
		match self.get_entry(id) {
			Some(MemoryEntry::Deserialized { values, .. }) => Some(values),
			_ => None,
		}
	}

	/// Bytes of a block stored in serialized form
	pub fn get_bytes(&self, id: &BlockId) -> Option<Bytes> {
		match self.get_entry(id) {
			Some(MemoryEntry::Serialized { bytes, .. }) => Some(bytes),
			_ => None,
		}
	}

	pub fn contains(&self, id: &BlockId) -> bool {
		self.entries.lock().unwrap().map.contains_key(id)
	}

	pub fn get_size(&self, id: &BlockId) -> Option<u64> {
		self.entries.lock().unwrap().map.get(id).map(|e| e.size())
	}

	/// Drop a block and give its reservation back. Returns whether it
	/// was present.
	pub fn remove(&self, id: &BlockId) -> bool {
		let mut entries = self.entries.lock().unwrap();
		match entries.map.remove(id) {
			Some(entry) => {
				entries.order.retain(|other| other != id);
				drop(entries);
				self.accountant
					.release_storage_memory(entry.size(), entry.mode());
				true
			}
			None => false,
		}
	}

	/// Drop everything, e.g. at shutdown
	pub fn clear(&self) {
		let mut entries = self.entries.lock().unwrap();
		for (_, entry) in entries.map.drain() {
			self.accountant
				.release_storage_memory(entry.size(), entry.mode());
		}
		entries.order.clear();
	}

	fn insert(&self, id: &BlockId, entry: MemoryEntry) {
		let replaced = {
			let mut entries = self.entries.lock().unwrap();
			let replaced = entries.map.insert(id.clone(), entry);
			if replaced.is_none() {
				entries.order.push_back(id.clone());
			}
			replaced
		};
		// Two readers may race to re-admit the same disk block; only
		// one reservation survives
		if let Some(old) = replaced {
			self.accountant
				.release_storage_memory(old.size(), old.mode());
		}
	}

	// ---- Eviction ----

	/// Try to reserve `bytes` more storage memory, evicting other
	/// blocks if the accountant declines at first
	async fn reserve_with_eviction(&self, id: &BlockId, bytes: u64, mode: MemoryMode) -> bool {
		if self.accountant.acquire_storage_memory(bytes, mode) {
			return true;
		}

		let needed = bytes.saturating_sub(self.accountant.storage_memory_free(mode));
		match self.evict_blocks_to_free_space(id, needed, mode).await {
			Ok(freed) => {
				trace!("Evicted {} bytes to admit block {}", freed, id);
			}
			Err(e) => {
				warn!("Eviction on behalf of block {} failed: {}", id, e);
				return false;
			}
		}
		self.accountant.acquire_storage_memory(bytes, mode)
	}

	/// Select victims in insertion order until `needed` bytes can be
	/// freed, then drop each through the eviction handler.
	///
	/// The block being admitted is never selected, and when it is a
	/// dataset partition, neither is any other partition of the same
	/// dataset. Victims that cannot be write-locked immediately are
	/// skipped. If the candidates cannot cover `needed`, nothing is
	/// evicted.
	async fn evict_blocks_to_free_space(
		&self,
		admitting: &BlockId,
		needed: u64,
		mode: MemoryMode,
	) -> Result<u64, Error> {
		let handler = match self.eviction_handler.load_full() {
			Some(handler) => handler,
			None => return Ok(0),
		};

		let candidates: Vec<BlockId> = {
			let entries = self.entries.lock().unwrap();
			entries.order.iter().cloned().collect()
		};

		let mut selected: Vec<(BlockId, MemoryEntry)> = Vec::new();
		let mut selected_bytes: u64 = 0;

		for victim in candidates {
			if selected_bytes >= needed {
				break;
			}
			if victim == *admitting {
				continue;
			}
			if admitting.rdd_id().is_some() && victim.rdd_id() == admitting.rdd_id() {
				continue;
			}
			if self.info_manager.lock_for_writing(&victim, false).await.is_none() {
				continue;
			}
			match self.get_entry(&victim) {
				Some(entry) if entry.mode() == mode => {
					selected_bytes += entry.size();
					selected.push((victim, entry));
				}
				_ => {
					self.info_manager.unlock(&victim, None);
				}
			}
		}

		if selected_bytes < needed {
			for (victim, _) in selected {
				self.info_manager.unlock(&victim, None);
			}
			return Ok(0);
		}

		let mut freed = 0;
		let mut iter = selected.into_iter();
		while let Some((victim, entry)) = iter.next() {
			match handler.drop_from_memory(&victim, &entry).await {
				Ok(new_level) => {
					if new_level.is_valid() {
						self.info_manager.unlock(&victim, None);
					} else {
						let _ = self.info_manager.remove_block(&victim);
					}
					freed += entry.size();
				}
				Err(e) => {
					self.info_manager.unlock(&victim, None);
					for (remaining, _) in iter {
						self.info_manager.unlock(&remaining, None);
					}
					return Err(e);
				}
			}
		}
		Ok(freed)
	}
}

/// Iterator handed back when unrolling to values ran out of memory:
/// first the records already unrolled, then the untouched rest of the
/// source. The unroll reservation is released once the unrolled part is
/// exhausted, or when the iterator is dropped.
pub struct PartiallyUnrolledValues {
	accountant: Arc<dyn MemoryAccountant>,
	mode: MemoryMode,
	reserved: u64,
	unrolled: std::vec::IntoIter<Record>,
	rest: Option<ValuesIter>,
}

impl std::fmt::Debug for PartiallyUnrolledValues {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PartiallyUnrolledValues")
			.field("mode", &self.mode)
			.field("reserved", &self.reserved)
			.finish()
	}
}

impl PartiallyUnrolledValues {
	fn release(&mut self) {
		if self.reserved > 0 {
			self.accountant
				.release_storage_memory(self.reserved, self.mode);
			self.reserved = 0;
		}
	}
}

impl Iterator for PartiallyUnrolledValues {
	type Item = Record;

	fn next(&mut self) -> Option<Record> {
		if let Some(record) = self.unrolled.next() {
			return Some(record);
		}
		self.release();
		self.rest.as_mut().and_then(|rest| rest.next())
	}
}

impl Drop for PartiallyUnrolledValues {
	fn drop(&mut self) {
		self.release();
	}
}

/// State handed back when unrolling to bytes ran out of memory: the
/// records encoded so far plus the untouched rest of the source. It can
/// either finish the encoding (to spill the block to disk) or be turned
/// back into a record iterator.
pub struct PartiallySerializedValues {
	accountant: Arc<dyn MemoryAccountant>,
	serializer: Arc<dyn BlockSerializer>,
	mode: MemoryMode,
	tag: DataTag,
	reserved: u64,
	encoded: Vec<u8>,
	rest: Option<ValuesIter>,
}

impl std::fmt::Debug for PartiallySerializedValues {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PartiallySerializedValues")
			.field("mode", &self.mode)
			.field("tag", &self.tag)
			.field("reserved", &self.reserved)
			.field("encoded_len", &self.encoded.len())
			.finish()
	}
}

impl PartiallySerializedValues {
	fn release(&mut self) {
		if self.reserved > 0 {
			self.accountant
				.release_storage_memory(self.reserved, self.mode);
			self.reserved = 0;
		}
	}

	/// Encode the remaining records and return the whole serialized
	/// block
	pub fn finish_writing(mut self) -> Result<Bytes, Error> {
		let mut encoded = std::mem::take(&mut self.encoded);
		if let Some(rest) = self.rest.take() {
			for record in rest {
				self.serializer.serialize_one(&self.tag, &record, &mut encoded)?;
			}
		}
		self.release();
		Ok(encoded.into())
	}

	/// Give the records back to the caller, decoded
	pub fn values_iterator(mut self) -> Result<ValuesIter, Error> {
		let encoded = std::mem::take(&mut self.encoded);
		let decoded = self.serializer.deserialize_values(&self.tag, &encoded)?;
		let rest = self.rest.take();
		self.release();
		match rest {
			Some(rest) => Ok(Box::new(decoded.into_iter().chain(rest))),
			None => Ok(Box::new(decoded.into_iter())),
		}
	}
}

impl Drop for PartiallySerializedValues {
	fn drop(&mut self) {
		self.release();
	}
}
