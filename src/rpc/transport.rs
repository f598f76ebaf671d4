//! Interface to the inter-node block transfer service

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use tempest_util::data::*;
use tempest_util::error::Error;

/// A file absorbing a fetched block too large to hold in memory.
///
/// The file lives as long as this handle: dropping it hands the path to
/// the cleaner it was registered with (or deletes in place when it was
/// never registered), and `dispose` deletes it synchronously.
pub struct DownloadFile {
	path: PathBuf,
	cleaner: Option<mpsc::UnboundedSender<PathBuf>>,
}

impl DownloadFile {
	pub fn new(path: PathBuf) -> Self {
		Self {
			path,
			cleaner: None,
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Route deletion-on-drop through `cleaner` from now on
	pub fn set_cleaner(&mut self, cleaner: mpsc::UnboundedSender<PathBuf>) {
		self.cleaner = Some(cleaner);
	}

	/// Delete the file now instead of waiting for the handle to drop
	pub fn dispose(mut self) {
		self.cleaner = None;
		if let Err(e) = std::fs::remove_file(&self.path) {
			debug!("Could not dispose of {}: {}", self.path.display(), e);
		}
		self.path = PathBuf::new();
	}
}

impl Drop for DownloadFile {
	fn drop(&mut self) {
		if self.path.as_os_str().is_empty() {
			return;
		}
		match &self.cleaner {
			Some(cleaner) => {
				let _ = cleaner.send(std::mem::take(&mut self.path));
			}
			None => {
				if let Err(e) = std::fs::remove_file(&self.path) {
					debug!("Could not remove {}: {}", self.path.display(), e);
				}
			}
		}
	}
}

/// Hands out temporary files for oversize fetches and takes over their
/// deletion
pub trait DownloadFileManager: Send + Sync {
	fn create_temp_file(&self) -> Result<DownloadFile, Error>;

	/// Tie the file's lifetime to its handle. Returns false when the
	/// manager is already stopped, in which case the caller keeps
	/// responsibility for the file.
	fn register_temp_file_to_clean(&self, file: &mut DownloadFile) -> bool;
}

/// Bytes of a fetched block, either in memory or spilled to a temporary
/// file by the transfer service
pub enum ManagedBuffer {
	Memory(Bytes),
	File(DownloadFile),
}

impl ManagedBuffer {
	/// Bring the whole buffer into memory, releasing the backing file
	/// if there was one
	pub async fn into_bytes(self) -> Result<Bytes, Error> {
		match self {
			ManagedBuffer::Memory(bytes) => Ok(bytes),
			ManagedBuffer::File(file) => {
				let data = tokio::fs::read(file.path()).await?;
				Ok(data.into())
			}
		}
	}
}

/// Client of the block transfer services running on other nodes.
///
/// Both calls are synchronous with respect to the transfer: they return
/// once the bytes have fully arrived (or failed to).
#[async_trait]
pub trait BlockTransferService: Send + Sync {
	/// Fetch one block from the given node. When a download file manager
	/// is passed, the service may spill the block to a temporary file
	/// instead of buffering it.
	async fn fetch_block_sync(
		&self,
		host: &str,
		port: u16,
		executor_id: &str,
		block_id: &BlockId,
		temp_file_manager: Option<&dyn DownloadFileManager>,
	) -> Result<ManagedBuffer, Error>;

	/// Push one block to the given node, to be stored at `level`
	async fn upload_block_sync(
		&self,
		host: &str,
		port: u16,
		executor_id: &str,
		block_id: &BlockId,
		data: Bytes,
		level: StorageLevel,
		tag: DataTag,
	) -> Result<(), Error>;
}
