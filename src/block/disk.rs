//! On-disk block tier

use std::path::PathBuf;

use bytes::Bytes;
use rand::prelude::*;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use xxhash_rust::xxh3::xxh3_64;

use tempest_util::data::BlockId;
use tempest_util::error::Error;

/// Disk tier of the block store.
///
/// Blocks live as one file each under a set of local directories, each
/// subdivided into hashed shards; block id to path is a pure function
/// so no index is needed. Writes go through a temporary file and a
/// rename, so a block file is only ever observed complete.
pub struct DiskStore {
	local_dirs: Vec<PathBuf>,
	sub_dirs_per_local_dir: usize,
	// When the external shuffle service serves our files, they outlive us
	shuffle_service_owns_files: bool,
}

impl DiskStore {
	pub fn new(
		local_dirs: Vec<PathBuf>,
		sub_dirs_per_local_dir: usize,
		shuffle_service_owns_files: bool,
	) -> Result<Self, Error> {
		if local_dirs.is_empty() {
			return Err(Error::Message(
				"At least one local directory is required for the disk store".to_string(),
			));
		}
		Ok(Self {
			local_dirs,
			sub_dirs_per_local_dir,
			shuffle_service_owns_files,
		})
	}

	/// The file a block is stored in, whether or not it exists yet
	pub fn block_file(&self, id: &BlockId) -> PathBuf {
		let name = id.name();
		let hash = xxh3_64(name.as_bytes());
		let dir_id = (hash % self.local_dirs.len() as u64) as usize;
		let sub_dir_id =
			((hash / self.local_dirs.len() as u64) % self.sub_dirs_per_local_dir as u64) as usize;

		let mut path = self.local_dirs[dir_id].clone();
		path.push(format!("{:02x}", sub_dir_id));
		path.push(name);
		path
	}

	pub async fn contains(&self, id: &BlockId) -> bool {
		fs::metadata(self.block_file(id)).await.is_ok()
	}

	pub async fn get_size(&self, id: &BlockId) -> Result<u64, Error> {
		Ok(fs::metadata(self.block_file(id)).await?.len())
	}

	/// Write a block to disk; overwrites any previous version
	pub async fn put_bytes(&self, id: &BlockId, data: &[u8]) -> Result<(), Error> {
		let path = self.block_file(id);
		let directory = path.parent().expect("block file has a parent").to_path_buf();
		fs::create_dir_all(&directory).await?;

		let mut path_tmp = path.clone();
		let tmp_extension = format!("tmp{}", hex::encode(thread_rng().gen::<[u8; 4]>()));
		path_tmp.set_extension(tmp_extension);

		let mut delete_on_drop = DeleteOnDrop(Some(path_tmp.clone()));

		let mut f = fs::File::create(&path_tmp).await?;
		f.write_all(data).await?;
		f.sync_all().await?;
		drop(f);

		fs::rename(path_tmp, path).await?;

		delete_on_drop.cancel();

		// The sync_all above persists the data file itself; an fsync on
		// the containing directory is also needed for the rename to
		// survive a crash. See:
		// http://thedjbway.b0llix.net/qmail/syncdir.html
		let dir = fs::OpenOptions::new().read(true).open(&directory).await?;
		dir.sync_all().await?;
		drop(dir);

		Ok(())
	}

	pub async fn get_bytes(&self, id: &BlockId) -> Result<Bytes, Error> {
		match fs::read(self.block_file(id)).await {
			Ok(data) => Ok(data.into()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				Err(Error::BlockNotFound(id.clone()))
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Delete a block's file. Returns whether it was present.
	pub async fn remove(&self, id: &BlockId) -> Result<bool, Error> {
		match fs::remove_file(self.block_file(id)).await {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e.into()),
		}
	}

	/// All block ids with a file on disk, in no particular order
	pub async fn list_blocks(&self) -> Result<Vec<BlockId>, Error> {
		let mut blocks = Vec::new();
		for dir in self.local_dirs.iter() {
			let mut sub_dirs = match fs::read_dir(dir).await {
				Ok(rd) => rd,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
				Err(e) => return Err(e.into()),
			};
			while let Some(sub_dir) = sub_dirs.next_entry().await? {
				if !sub_dir.file_type().await?.is_dir() {
					continue;
				}
				let mut files = fs::read_dir(sub_dir.path()).await?;
				while let Some(file) = files.next_entry().await? {
					let name = match file.file_name().into_string() {
						Ok(name) => name,
						Err(_) => continue,
					};
					if let Ok(id) = name.parse::<BlockId>() {
						blocks.push(id);
					}
				}
			}
		}
		Ok(blocks)
	}

	/// Delete the local directories, unless the external shuffle
	/// service keeps serving files out of them
	pub async fn cleanup(&self) -> Result<(), Error> {
		if self.shuffle_service_owns_files {
			debug!("Leaving local directories in place for the external shuffle service");
			return Ok(());
		}
		for dir in self.local_dirs.iter() {
			match fs::remove_dir_all(dir).await {
				Ok(()) => (),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
				Err(e) => return Err(e.into()),
			}
		}
		Ok(())
	}
}

struct DeleteOnDrop(Option<PathBuf>);

impl DeleteOnDrop {
	fn cancel(&mut self) {
		drop(self.0.take());
	}
}

impl Drop for DeleteOnDrop {
	fn drop(&mut self) {
		if let Some(path) = self.0.take() {
			tokio::spawn(async move {
				if let Err(e) = fs::remove_file(&path).await {
					debug!("DeleteOnDrop failed for {}: {}", path.display(), e);
				}
			});
		}
	}
}
