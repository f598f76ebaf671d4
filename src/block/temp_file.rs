//! Temporary files backing oversize remote fetches

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::prelude::*;
use tokio::fs;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use tempest_util::error::Error;

use tempest_rpc::transport::{DownloadFile, DownloadFileManager};

/// Tracks the temporary files the transfer service spills oversize
/// fetched blocks into.
///
/// Such a file must live exactly as long as the in-memory consumer
/// reading from it, so registered handles delete through a background
/// cleaner when dropped, and `DownloadFile::dispose` remains available
/// for eager deletion. `stop` drains the cleaner and ends it.
pub struct RemoteBlockTempFileManager {
	dir: PathBuf,
	tx: mpsc::UnboundedSender<PathBuf>,
	stop_tx: watch::Sender<bool>,
	stopped: AtomicBool,
	cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteBlockTempFileManager {
	pub fn new(dir: PathBuf) -> Self {
		let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
		let (stop_tx, mut stop_rx) = watch::channel(false);

		let cleaner = tokio::spawn(async move {
			loop {
				tokio::select! {
					path = rx.recv() => match path {
						Some(path) => delete_file(&path).await,
						None => break,
					},
					_ = stop_rx.changed() => break,
				}
			}
			// Files already handed over are still ours to delete
			while let Ok(path) = rx.try_recv() {
				delete_file(&path).await;
			}
		});

		Self {
			dir,
			tx,
			stop_tx,
			stopped: AtomicBool::new(false),
			cleaner: Mutex::new(Some(cleaner)),
		}
	}

	pub async fn stop(&self) -> Result<(), Error> {
		if self.stopped.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		self.stop_tx.send(true)?;
		let handle = self.cleaner.lock().unwrap().take();
		if let Some(handle) = handle {
			handle.await?;
		}
		Ok(())
	}
}

impl DownloadFileManager for RemoteBlockTempFileManager {
	fn create_temp_file(&self) -> Result<DownloadFile, Error> {
		std::fs::create_dir_all(&self.dir)?;
		let name = format!("temp_remote_{}", hex::encode(thread_rng().gen::<[u8; 8]>()));
		Ok(DownloadFile::new(self.dir.join(name)))
	}

	fn register_temp_file_to_clean(&self, file: &mut DownloadFile) -> bool {
		if self.stopped.load(Ordering::SeqCst) {
			return false;
		}
		file.set_cleaner(self.tx.clone());
		true
	}
}

async fn delete_file(path: &PathBuf) {
	if let Err(e) = fs::remove_file(path).await {
		debug!("Could not delete temp file {}: {}", path.display(), e);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::io::Write;
	use std::time::Duration;

	#[tokio::test]
	async fn test_registered_file_deleted_after_drop() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = RemoteBlockTempFileManager::new(dir.to_path_buf());

		let mut file = mgr.create_temp_file().unwrap();
		std::fs::File::create(file.path())
			.unwrap()
			.write_all(b"big block")
			.unwrap();
		assert!(mgr.register_temp_file_to_clean(&mut file));

		let path = file.path().to_path_buf();
		drop(file);

		for _ in 0..100 {
			if !path.exists() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(!path.exists());

		mgr.stop().await.unwrap();
	}

	#[tokio::test]
	async fn test_dispose_deletes_synchronously() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = RemoteBlockTempFileManager::new(dir.to_path_buf());

		let mut file = mgr.create_temp_file().unwrap();
		std::fs::File::create(file.path()).unwrap();
		assert!(mgr.register_temp_file_to_clean(&mut file));

		let path = file.path().to_path_buf();
		file.dispose();
		assert!(!path.exists());

		mgr.stop().await.unwrap();
	}

	#[tokio::test]
	async fn test_no_registration_after_stop() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mgr = RemoteBlockTempFileManager::new(dir.to_path_buf());
		mgr.stop().await.unwrap();
		mgr.stop().await.unwrap();

		let mut file = mgr.create_temp_file().unwrap();
		assert!(!mgr.register_temp_file_to_clean(&mut file));
	}
}
