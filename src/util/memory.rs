//! Interface to the memory accountant shared with task execution

use std::sync::atomic::{AtomicU64, Ordering};

use crate::data::MemoryMode;

/// Arbiter of the storage memory budget.
///
/// The real accountant lives outside this subsystem and shares its budget
/// with task execution memory; the store only ever asks it for
/// reservations and reports releases. Declining a reservation is a
/// signal, not an error: the caller decides between eviction, spill, or
/// giving the data back.
pub trait MemoryAccountant: Send + Sync {
	/// Maximum bytes the storage tier may ever hold in this mode
	fn max_storage_memory(&self, mode: MemoryMode) -> u64;

	/// Bytes currently reserved in this mode
	fn storage_memory_used(&self, mode: MemoryMode) -> u64;

	/// Try to reserve `bytes` more; false if the budget does not allow it
	fn acquire_storage_memory(&self, bytes: u64, mode: MemoryMode) -> bool;

	/// Give back a previous reservation
	fn release_storage_memory(&self, bytes: u64, mode: MemoryMode);

	fn storage_memory_free(&self, mode: MemoryMode) -> u64 {
		self.max_storage_memory(mode)
			.saturating_sub(self.storage_memory_used(mode))
	}
}

/// Accountant over fixed on-heap and off-heap budgets.
///
/// Used in tests and in deployments without a unified execution/storage
/// budget.
pub struct StaticMemoryAccountant {
	on_heap_max: u64,
	off_heap_max: u64,
	on_heap_used: AtomicU64,
	off_heap_used: AtomicU64,
}

impl StaticMemoryAccountant {
	pub fn new(on_heap_max: u64, off_heap_max: u64) -> Self {
		Self {
			on_heap_max,
			off_heap_max,
			on_heap_used: AtomicU64::new(0),
			off_heap_used: AtomicU64::new(0),
		}
	}

	fn cell(&self, mode: MemoryMode) -> (&AtomicU64, u64) {
		match mode {
			MemoryMode::OnHeap => (&self.on_heap_used, self.on_heap_max),
			MemoryMode::OffHeap => (&self.off_heap_used, self.off_heap_max),
		}
	}
}

impl MemoryAccountant for StaticMemoryAccountant {
	fn max_storage_memory(&self, mode: MemoryMode) -> u64 {
		self.cell(mode).1
	}

	fn storage_memory_used(&self, mode: MemoryMode) -> u64 {
		self.cell(mode).0.load(Ordering::SeqCst)
	}

	fn acquire_storage_memory(&self, bytes: u64, mode: MemoryMode) -> bool {
		let (used, max) = self.cell(mode);
		let mut cur = used.load(Ordering::SeqCst);
		loop {
			if cur + bytes > max {
				return false;
			}
			match used.compare_exchange(cur, cur + bytes, Ordering::SeqCst, Ordering::SeqCst) {
				Ok(_) => return true,
				Err(actual) => cur = actual,
			}
		}
	}

	fn release_storage_memory(&self, bytes: u64, mode: MemoryMode) {
		let (used, _) = self.cell(mode);
		let mut cur = used.load(Ordering::SeqCst);
		loop {
			let next = cur.saturating_sub(bytes);
			match used.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
				Ok(_) => return,
				Err(actual) => cur = actual,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_static_accountant() {
		let acct = StaticMemoryAccountant::new(10, 0);
		assert!(acct.acquire_storage_memory(8, MemoryMode::OnHeap));
		assert!(!acct.acquire_storage_memory(3, MemoryMode::OnHeap));
		assert_eq!(acct.storage_memory_free(MemoryMode::OnHeap), 2);
		acct.release_storage_memory(8, MemoryMode::OnHeap);
		assert!(acct.acquire_storage_memory(10, MemoryMode::OnHeap));
		assert!(!acct.acquire_storage_memory(1, MemoryMode::OffHeap));
	}
}
