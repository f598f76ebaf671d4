//! Contains type and functions related to Tempest configuration file
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Directories in which blocks spilled or persisted to disk are stored
	pub local_dirs: Vec<PathBuf>,

	/// Number of hashed subdirectories under each local directory
	#[serde(default = "default_sub_dirs_per_local_dir")]
	pub sub_dirs_per_local_dir: usize,

	/// Serve shuffle files through the external shuffle service instead of
	/// the block transfer service
	#[serde(default)]
	pub shuffle_service_enabled: bool,
	/// Port of the external shuffle service on this host
	#[serde(default = "default_shuffle_service_port")]
	pub shuffle_service_port: u16,
	/// Milliseconds to wait for one registration attempt with the external
	/// shuffle service
	#[serde(default = "default_shuffle_registration_timeout_ms")]
	pub shuffle_registration_timeout_ms: u64,
	/// Number of registration attempts before giving up
	#[serde(default = "default_shuffle_registration_max_attempts")]
	pub shuffle_registration_max_attempts: u32,
	/// Wait for shuffle output to reach disk before acknowledging writes
	#[serde(default)]
	pub shuffle_sync: bool,

	/// Consecutive fetch failures on one location before the location list
	/// is refreshed from the master
	#[serde(default = "default_block_failures_before_location_refresh")]
	pub block_failures_before_location_refresh: u32,

	/// Which replication policy orders candidate peers. Supported values:
	/// - random (default)
	/// - topology
	#[serde(default = "default_replication_policy")]
	pub replication_policy: String,
	/// Milliseconds during which the fetched peer list stays valid
	#[serde(default = "default_cached_peers_ttl_ms")]
	pub cached_peers_ttl_ms: u64,
	/// Replication attempts abandoned after this many failed peers
	#[serde(default = "default_max_replication_failures")]
	pub max_replication_failures: u32,

	/// Remote blocks larger than this are fetched through a temporary file
	/// instead of memory
	#[serde(default = "default_max_remote_block_size_fetch_to_mem")]
	pub max_remote_block_size_fetch_to_mem: u64,

	/// Capacity of the scheduler event queue
	#[serde(default = "default_event_queue_capacity")]
	pub event_queue_capacity: usize,
	/// Forward block status updates to the scheduler event queue
	#[serde(default)]
	pub track_updated_block_statuses: bool,

	/// Initial memory reservation when unrolling an iterator
	#[serde(default = "default_unroll_memory_threshold")]
	pub unroll_memory_threshold: u64,
	/// Factor by which the unroll reservation grows when exceeded
	#[serde(default = "default_unroll_growth_factor")]
	pub unroll_growth_factor: f64,
}

fn default_sub_dirs_per_local_dir() -> usize {
	64
}
fn default_shuffle_service_port() -> u16 {
	7337
}
fn default_shuffle_registration_timeout_ms() -> u64 {
	5000
}
fn default_shuffle_registration_max_attempts() -> u32 {
	3
}
fn default_block_failures_before_location_refresh() -> u32 {
	5
}
fn default_replication_policy() -> String {
	"random".to_string()
}
fn default_cached_peers_ttl_ms() -> u64 {
	60_000
}
fn default_max_replication_failures() -> u32 {
	1
}
fn default_max_remote_block_size_fetch_to_mem() -> u64 {
	200 * 1024 * 1024
}
fn default_event_queue_capacity() -> usize {
	10_000
}
fn default_unroll_memory_threshold() -> u64 {
	1024 * 1024
}
fn default_unroll_growth_factor() -> f64 {
	1.5
}

impl Default for Config {
	fn default() -> Self {
		toml::from_str("local_dirs = []").expect("infallible: all other fields have defaults")
	}
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}
