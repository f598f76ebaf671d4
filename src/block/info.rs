//! Per-block metadata and locking

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::Notify;

use tempest_util::data::*;
use tempest_util::error::Error;
use tempest_util::task::{current_task_attempt_id, TaskAttemptId};

/// Metadata of one block tracked by the info manager.
///
/// At any moment a block has either readers (`reader_count > 0`,
/// `writer_task = None`), one writer (`writer_task = Some`,
/// `reader_count = 0`), or neither.
#[derive(Debug, Clone)]
pub struct BlockInfo {
	/// Storage level the block was put with (where it *may* live, not
	/// where it currently lives)
	pub level: StorageLevel,
	/// Tag handed to the serializer for this block's records
	pub tag: DataTag,
	/// Whether status changes of this block are reported to the master
	pub tell_master: bool,
	pub size: u64,
	pub reader_count: usize,
	pub writer_task: Option<TaskAttemptId>,
}

impl BlockInfo {
	pub fn new(level: StorageLevel, tag: DataTag, tell_master: bool) -> Self {
		Self {
			level,
			tag,
			tell_master,
			size: 0,
			reader_count: 0,
			writer_task: None,
		}
	}
}

struct State {
	infos: HashMap<BlockId, BlockInfo>,
	read_locks_by_task: HashMap<TaskAttemptId, HashMap<BlockId, usize>>,
	write_locks_by_task: HashMap<TaskAttemptId, HashSet<BlockId>>,
}

impl State {
	fn record_read(&mut self, task: TaskAttemptId, id: &BlockId) {
		*self
			.read_locks_by_task
			.entry(task)
			.or_default()
			.entry(id.clone())
			.or_insert(0) += 1;
	}

	fn forget_read(&mut self, task: TaskAttemptId, id: &BlockId) {
		if let Some(per_task) = self.read_locks_by_task.get_mut(&task) {
			if let Some(count) = per_task.get_mut(id) {
				*count -= 1;
				if *count == 0 {
					per_task.remove(id);
				}
			}
			if per_task.is_empty() {
				self.read_locks_by_task.remove(&task);
			}
		}
	}

	fn record_write(&mut self, task: TaskAttemptId, id: &BlockId) {
		self.write_locks_by_task
			.entry(task)
			.or_default()
			.insert(id.clone());
	}

	fn forget_write(&mut self, task: TaskAttemptId, id: &BlockId) {
		if let Some(per_task) = self.write_locks_by_task.get_mut(&task) {
			per_task.remove(id);
			if per_task.is_empty() {
				self.write_locks_by_task.remove(&task);
			}
		}
	}
}

enum Acquire {
	Acquired(BlockInfo),
	Busy,
	Absent,
}

/// Tracks metadata for every block on this node and arbitrates access
/// with one multi-reader/single-writer lock per block.
///
/// Lock ownership is recorded against the task attempt that took it
/// (`tempest_util::task`), so a finished or failed task can be stripped
/// of everything it still holds. Acquisition may wait; release never
/// does, so guards can unlock from `Drop`.
pub struct BlockInfoManager {
	state: Mutex<State>,
	// Signaled on every release or removal; waiters re-check the state
	released: Notify,
}

impl Default for BlockInfoManager {
	fn default() -> Self {
		Self::new()
	}
}

impl BlockInfoManager {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(State {
				infos: HashMap::new(),
				read_locks_by_task: HashMap::new(),
				write_locks_by_task: HashMap::new(),
			}),
			released: Notify::new(),
		}
	}

	/// Acquire a read lock and return a snapshot of the block's info.
	///
	/// Returns `None` if the block does not exist, or if it is
	/// write-locked and `blocking` is false.
	pub async fn lock_for_reading(&self, id: &BlockId, blocking: bool) -> Option<BlockInfo> {
		let task = current_task_attempt_id();
		loop {
			let notified = self.released.notified();
			tokio::pin!(notified);
			{
				let mut state = self.state.lock().unwrap();
				let acquire = match state.infos.get_mut(id) {
					None => Acquire::Absent,
					Some(info) if info.writer_task.is_none() => {
						info.reader_count += 1;
						Acquire::Acquired(info.clone())
					}
					Some(_) => Acquire::Busy,
				};
				match acquire {
					Acquire::Absent => return None,
					Acquire::Acquired(info) => {
						state.record_read(task, id);
						return Some(info);
					}
					Acquire::Busy => {
						if !blocking {
							return None;
						}
						notified.as_mut().enable();
					}
				}
			}
			notified.await;
		}
	}

	/// Acquire the write lock and return a snapshot of the block's info.
	///
	/// Returns `None` if the block does not exist, or if it is locked in
	/// any way and `blocking` is false.
	pub async fn lock_for_writing(&self, id: &BlockId, blocking: bool) -> Option<BlockInfo> {
		let task = current_task_attempt_id();
		loop {
			let notified = self.released.notified();
			tokio::pin!(notified);
			{
				let mut state = self.state.lock().unwrap();
				let acquire = match state.infos.get_mut(id) {
					None => Acquire::Absent,
					Some(info) if info.writer_task.is_none() && info.reader_count == 0 => {
						info.writer_task = Some(task);
						Acquire::Acquired(info.clone())
					}
					Some(_) => Acquire::Busy,
				};
				match acquire {
					Acquire::Absent => return None,
					Acquire::Acquired(info) => {
						state.record_write(task, id);
						return Some(info);
					}
					Acquire::Busy => {
						if !blocking {
							return None;
						}
						notified.as_mut().enable();
					}
				}
			}
			notified.await;
		}
	}

	/// Insert `new_info` and acquire its write lock, atomically.
	///
	/// If the block already exists, a read lock on the existing entry is
	/// acquired instead and `false` is returned.
	pub async fn lock_new_block_for_writing(&self, id: &BlockId, new_info: BlockInfo) -> bool {
		let task = current_task_attempt_id();
		loop {
			let notified = self.released.notified();
			tokio::pin!(notified);
			{
				let mut state = self.state.lock().unwrap();
				let acquire = match state.infos.get_mut(id) {
					None => Acquire::Absent,
					Some(info) if info.writer_task.is_none() => {
						info.reader_count += 1;
						Acquire::Acquired(info.clone())
					}
					Some(_) => Acquire::Busy,
				};
				match acquire {
					Acquire::Absent => {
						let mut info = new_info;
						info.writer_task = Some(task);
						state.infos.insert(id.clone(), info);
						state.record_write(task, id);
						return true;
					}
					Acquire::Acquired(_) => {
						state.record_read(task, id);
						return false;
					}
					Acquire::Busy => {
						notified.as_mut().enable();
					}
				}
			}
			notified.await;
		}
	}

	/// Release one lock held on `id` by the current task (or by `task`
	/// when given, for guards outliving the task scope)
	pub fn unlock(&self, id: &BlockId, task: Option<TaskAttemptId>) {
		let task = task.unwrap_or_else(current_task_attempt_id);
		let mut state = self.state.lock().unwrap();
		match state.infos.get_mut(id) {
			None => {
				debug!("Unlock of {} which is no longer tracked", id);
			}
			Some(info) => {
				if info.writer_task.is_some() {
					info.writer_task = None;
					state.forget_write(task, id);
				} else {
					assert!(info.reader_count > 0, "unlock of a lock not held");
					info.reader_count -= 1;
					state.forget_read(task, id);
				}
			}
		}
		drop(state);
		self.released.notify_waiters();
	}

	/// Atomically turn the write lock held by the current task into a
	/// read lock; no other writer can slip in between
	pub fn downgrade_lock(&self, id: &BlockId) -> Result<(), Error> {
		let task = current_task_attempt_id();
		let mut state = self.state.lock().unwrap();
		match state.infos.get_mut(id) {
			Some(info) if info.writer_task == Some(task) => {
				info.writer_task = None;
				info.reader_count += 1;
				state.forget_write(task, id);
				state.record_read(task, id);
			}
			_ => {
				return Err(Error::Message(format!(
					"Cannot downgrade lock on {}: not write-locked by {}",
					id, task
				)));
			}
		}
		drop(state);
		self.released.notify_waiters();
		Ok(())
	}

	/// Release every lock still recorded against `task`; returns the
	/// blocks that were unlocked
	pub fn release_all_locks_for_task(&self, task: TaskAttemptId) -> Vec<BlockId> {
		let mut state = self.state.lock().unwrap();
		let mut released = Vec::new();

		if let Some(write_locked) = state.write_locks_by_task.remove(&task) {
			for id in write_locked {
				if let Some(info) = state.infos.get_mut(&id) {
					info.writer_task = None;
				}
				released.push(id);
			}
		}
		if let Some(read_locked) = state.read_locks_by_task.remove(&task) {
			for (id, count) in read_locked {
				if let Some(info) = state.infos.get_mut(&id) {
					info.reader_count = info.reader_count.saturating_sub(count);
				}
				released.push(id);
			}
		}

		drop(state);
		if !released.is_empty() {
			self.released.notify_waiters();
		}
		released
	}

	/// Erase the entry of `id`. The current task must hold its write
	/// lock; waiters are woken and observe the absence.
	pub fn remove_block(&self, id: &BlockId) -> Result<(), Error> {
		let task = current_task_attempt_id();
		let mut state = self.state.lock().unwrap();
		match state.infos.get(id) {
			Some(info) if info.writer_task == Some(task) => {
				state.infos.remove(id);
				state.forget_write(task, id);
			}
			_ => {
				return Err(Error::Message(format!(
					"Cannot remove {}: not write-locked by {}",
					id, task
				)));
			}
		}
		drop(state);
		self.released.notify_waiters();
		Ok(())
	}

	/// Invariant check used on paths that require the write lock
	pub fn assert_block_is_locked_for_writing(&self, id: &BlockId) -> Result<BlockInfo, Error> {
		let task = current_task_attempt_id();
		let state = self.state.lock().unwrap();
		match state.infos.get(id) {
			Some(info) if info.writer_task == Some(task) => Ok(info.clone()),
			_ => Err(Error::Message(format!(
				"Block {} is not write-locked by {}",
				id, task
			))),
		}
	}

	/// Record the size of the block's stored form; requires the write
	/// lock
	pub fn set_size(&self, id: &BlockId, size: u64) -> Result<(), Error> {
		let task = current_task_attempt_id();
		let mut state = self.state.lock().unwrap();
		match state.infos.get_mut(id) {
			Some(info) if info.writer_task == Some(task) => {
				info.size = size;
				Ok(())
			}
			_ => Err(Error::Message(format!(
				"Block {} is not write-locked by {}",
				id, task
			))),
		}
	}

	/// Snapshot of one block's info, without taking any lock
	pub fn get(&self, id: &BlockId) -> Option<BlockInfo> {
		self.state.lock().unwrap().infos.get(id).cloned()
	}

	/// Snapshot of all tracked blocks
	pub fn entries(&self) -> Vec<(BlockId, BlockInfo)> {
		self.state
			.lock()
			.unwrap()
			.infos
			.iter()
			.map(|(id, info)| (id.clone(), info.clone()))
			.collect()
	}

	pub fn size(&self) -> usize {
		self.state.lock().unwrap().infos.len()
	}

	/// Number of lock registrations still recorded against `task`
	pub fn task_lock_count(&self, task: TaskAttemptId) -> usize {
		let state = self.state.lock().unwrap();
		let reads: usize = state
			.read_locks_by_task
			.get(&task)
			.map(|m| m.values().sum())
			.unwrap_or(0);
		let writes = state
			.write_locks_by_task
			.get(&task)
			.map(|s| s.len())
			.unwrap_or(0);
		reads + writes
	}
}
