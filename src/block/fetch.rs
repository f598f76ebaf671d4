//! Retrieval of blocks from other nodes

use std::collections::{HashSet, VecDeque};
use std::cmp;

use opentelemetry::Context;
use rand::prelude::*;

use tempest_util::data::*;
use tempest_util::error::Error;

use tempest_rpc::master::MasterClient;
use tempest_rpc::node::BlockManagerId;
use tempest_rpc::transport::{BlockTransferService, DownloadFileManager, ManagedBuffer};

use crate::metrics::BlockManagerMetrics;

/// Fetches a block from whichever peer holds it, preferring nearby
/// ones.
///
/// Locations come from the master and are walked in affinity order;
/// repeated failures trigger a refresh of the location list, on the
/// assumption that it went stale. One call issues at most as many
/// fetch attempts as there are known locations.
pub struct RemoteFetcher {
	max_failures_before_location_refresh: u32,
	max_remote_block_size_fetch_to_mem: u64,
}

impl RemoteFetcher {
	pub fn new(
		max_failures_before_location_refresh: u32,
		max_remote_block_size_fetch_to_mem: u64,
	) -> Self {
		Self {
			max_failures_before_location_refresh,
			max_remote_block_size_fetch_to_mem,
		}
	}

	/// Fetch the block's bytes, or `None` when no known location could
	/// provide them
	pub async fn fetch(
		&self,
		master: &dyn MasterClient,
		transport: &dyn BlockTransferService,
		temp_file_manager: &dyn DownloadFileManager,
		self_id: &BlockManagerId,
		block_id: &BlockId,
		metrics: &BlockManagerMetrics,
	) -> Result<Option<ManagedBuffer>, Error> {
		let locations_and_status = match master.get_locations_and_status(block_id).await? {
			Some(las) => las,
			None => return Ok(None),
		};
		let block_size = cmp::max(
			locations_and_status.status.disk_size,
			locations_and_status.status.mem_size,
		);
		// Oversize blocks go through a temp file instead of memory
		let temp_file_manager = if block_size > self.max_remote_block_size_fetch_to_mem {
			Some(temp_file_manager)
		} else {
			None
		};

		let mut known: HashSet<BlockManagerId> =
			locations_and_status.locations.iter().cloned().collect();
		let mut queue = sort_locations(locations_and_status.locations, self_id);

		let mut total_failures: u32 = 0;
		let mut failures_since_refresh: u32 = 0;

		while let Some(location) = queue.pop_front() {
			trace!("Getting remote block {} from {}", block_id, location);
			match transport
				.fetch_block_sync(
					&location.host,
					location.port,
					&location.executor_id,
					block_id,
					temp_file_manager,
				)
				.await
			{
				Ok(buffer) => return Ok(Some(buffer)),
				Err(e) => {
					warn!(
						"Failed to fetch remote block {} from {} (failure {}): {}",
						block_id,
						location,
						total_failures + 1,
						e
					);
					total_failures += 1;
					failures_since_refresh += 1;
					metrics.fetch_failure_counter.add(&Context::current(), 1, &[]);

					if failures_since_refresh >= self.max_failures_before_location_refresh {
						let refreshed = master.get_locations(block_id).await?;
						debug!(
							"Refreshed locations of {} from the master: {} location(s)",
							block_id,
							refreshed.len()
						);
						metrics
							.location_refresh_counter
							.add(&Context::current(), 1, &[]);
						known.extend(refreshed.iter().cloned());
						queue = sort_locations(refreshed, self_id);
						failures_since_refresh = 0;
					}

					if total_failures as usize >= known.len() {
						warn!(
							"Failed to fetch block {} after {} fetch failures; giving up",
							block_id, total_failures
						);
						return Ok(None);
					}
				}
			}
		}

		Ok(None)
	}
}

/// Order locations by affinity to this node: same host first, then
/// same rack, then the rest, shuffled within each group
fn sort_locations(
	locations: Vec<BlockManagerId>,
	self_id: &BlockManagerId,
) -> VecDeque<BlockManagerId> {
	let mut rng = thread_rng();

	let (mut local, others): (Vec<_>, Vec<_>) = locations
		.into_iter()
		.partition(|location| location.same_host(self_id));
	let (mut same_rack, mut rest): (Vec<_>, Vec<_>) = others
		.into_iter()
		.partition(|location| location.same_rack(self_id));

	local.shuffle(&mut rng);
	same_rack.shuffle(&mut rng);
	rest.shuffle(&mut rng);

	let mut ordered = VecDeque::with_capacity(local.len() + same_rack.len() + rest.len());
	ordered.extend(local);
	ordered.extend(same_rack);
	ordered.extend(rest);
	ordered
}
