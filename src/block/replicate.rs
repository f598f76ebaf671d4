//! Replication of blocks to peer nodes

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::prelude::*;

use tempest_util::data::*;
use tempest_util::error::Error;

use tempest_rpc::master::MasterClient;
use tempest_rpc::node::BlockManagerId;
use tempest_rpc::transport::BlockTransferService;

/// Orders candidate peers for replication and picks how many to try
pub trait BlockReplicationPolicy: Send + Sync {
	/// Return at most `num_replicas` peers, best candidates first.
	/// `peers` never contains this node, peers that already hold a
	/// replica, or peers that already failed.
	fn prioritize(
		&self,
		self_id: &BlockManagerId,
		peers: &[BlockManagerId],
		block_id: &BlockId,
		num_replicas: usize,
	) -> Vec<BlockManagerId>;
}

/// Uniformly random peer choice
pub struct RandomReplicationPolicy;

impl BlockReplicationPolicy for RandomReplicationPolicy {
	fn prioritize(
		&self,
		_self_id: &BlockManagerId,
		peers: &[BlockManagerId],
		_block_id: &BlockId,
		num_replicas: usize,
	) -> Vec<BlockManagerId> {
		let mut peers = peers.to_vec();
		peers.shuffle(&mut thread_rng());
		peers.truncate(num_replicas);
		peers
	}
}

/// Random choice preferring peers outside this node's rack, so a rack
/// failure does not take out every replica
pub struct TopologyAwareReplicationPolicy;

impl BlockReplicationPolicy for TopologyAwareReplicationPolicy {
	fn prioritize(
		&self,
		self_id: &BlockManagerId,
		peers: &[BlockManagerId],
		_block_id: &BlockId,
		num_replicas: usize,
	) -> Vec<BlockManagerId> {
		let mut rng = thread_rng();
		let (mut same_rack, mut off_rack): (Vec<_>, Vec<_>) = peers
			.iter()
			.cloned()
			.partition(|peer| peer.same_rack(self_id));
		off_rack.shuffle(&mut rng);
		same_rack.shuffle(&mut rng);

		let mut ordered = off_rack;
		ordered.extend(same_rack);
		ordered.truncate(num_replicas);
		ordered
	}
}

/// Resolve the policy named in the configuration
pub fn replication_policy_from_config(
	name: &str,
) -> Result<Box<dyn BlockReplicationPolicy>, Error> {
	match name {
		"random" => Ok(Box::new(RandomReplicationPolicy)),
		"topology" => Ok(Box::new(TopologyAwareReplicationPolicy)),
		other => Err(Error::Message(format!(
			"Unknown replication policy: {}",
			other
		))),
	}
}

/// What one replication call achieved
#[derive(Debug, Default)]
pub struct ReplicationOutcome {
	pub peers_replicated_to: Vec<BlockManagerId>,
	pub peers_failed_to_replicate_to: Vec<BlockManagerId>,
}

struct CachedPeers {
	peers: Vec<BlockManagerId>,
	fetched_at: Instant,
}

/// Pushes replicas of a block to peers, retrying on a bounded number of
/// failures.
///
/// Reaching fewer peers than the level asked for is reported in the
/// outcome and logged, but never fails the put that triggered it.
pub struct Replicator {
	policy: Box<dyn BlockReplicationPolicy>,
	max_replication_failures: u32,
	cached_peers_ttl: Duration,
	peer_cache: Mutex<Option<CachedPeers>>,
}

impl Replicator {
	pub fn new(
		policy: Box<dyn BlockReplicationPolicy>,
		max_replication_failures: u32,
		cached_peers_ttl: Duration,
	) -> Self {
		Self {
			policy,
			max_replication_failures,
			cached_peers_ttl,
			peer_cache: Mutex::new(None),
		}
	}

	/// Peer set, served from the cache while it is fresh
	pub async fn get_peers(
		&self,
		master: &dyn MasterClient,
		self_id: &BlockManagerId,
		force_refresh: bool,
	) -> Result<Vec<BlockManagerId>, Error> {
		if !force_refresh {
			let cache = self.peer_cache.lock().unwrap();
			if let Some(cached) = cache.as_ref() {
				if cached.fetched_at.elapsed() < self.cached_peers_ttl {
					return Ok(cached.peers.clone());
				}
			}
		}

		let peers = master.get_peers(self_id).await?;
		*self.peer_cache.lock().unwrap() = Some(CachedPeers {
			peers: peers.clone(),
			fetched_at: Instant::now(),
		});
		Ok(peers)
	}

	/// Replicate `data` until `level.replication - 1` peers hold it,
	/// abandoning after `max_replication_failures` failed peers
	#[allow(clippy::too_many_arguments)]
	pub async fn replicate(
		&self,
		master: &dyn MasterClient,
		transport: &dyn BlockTransferService,
		self_id: &BlockManagerId,
		block_id: &BlockId,
		data: Bytes,
		level: StorageLevel,
		tag: DataTag,
		existing_replicas: HashSet<BlockManagerId>,
	) -> Result<ReplicationOutcome, Error> {
		let num_peers_to_replicate_to = level.replication.saturating_sub(1) as usize;
		let mut outcome = ReplicationOutcome::default();
		if num_peers_to_replicate_to == 0 {
			return Ok(outcome);
		}

		// Peers store their copy without cascading further
		let target_level = level.with_replication(1);

		let start = Instant::now();
		let mut peers_replicated_to: HashSet<BlockManagerId> = HashSet::new();
		let mut peers_failed_to_replicate_to: HashSet<BlockManagerId> = HashSet::new();
		let mut num_failures: u32 = 0;

		let all_peers = self.get_peers(master, self_id, false).await?;
		let mut candidates = self.candidates(
			self_id,
			&all_peers,
			&existing_replicas,
			&peers_replicated_to,
			&peers_failed_to_replicate_to,
			block_id,
			num_peers_to_replicate_to,
		);

		while num_failures <= self.max_replication_failures
			&& !candidates.is_empty()
			&& peers_replicated_to.len() < num_peers_to_replicate_to
		{
			let peer = candidates.remove(0);
			trace!("Trying to replicate {} of {} bytes to {}", block_id, data.len(), peer);
			match transport
				.upload_block_sync(
					&peer.host,
					peer.port,
					&peer.executor_id,
					block_id,
					data.clone(),
					target_level,
					tag.clone(),
				)
				.await
			{
				Ok(()) => {
					debug!("Replicated {} to {}", block_id, peer);
					peers_replicated_to.insert(peer);
				}
				Err(e) => {
					warn!("Failed to replicate {} to {}: {}", block_id, peer, e);
					num_failures += 1;
					peers_failed_to_replicate_to.insert(peer);

					// The peer set may be stale, which is one common
					// cause of upload failures
					let refreshed = self.get_peers(master, self_id, true).await?;
					candidates = self.candidates(
						self_id,
						&refreshed,
						&existing_replicas,
						&peers_replicated_to,
						&peers_failed_to_replicate_to,
						block_id,
						num_peers_to_replicate_to - peers_replicated_to.len(),
					);
				}
			}
		}

		debug!(
			"Replicating {} of {} bytes to {} peer(s) took {} ms",
			block_id,
			data.len(),
			peers_replicated_to.len(),
			start.elapsed().as_millis()
		);
		if peers_replicated_to.len() < num_peers_to_replicate_to {
			warn!(
				"Block {} replicated to only {} peer(s) instead of {} peers",
				block_id,
				peers_replicated_to.len(),
				num_peers_to_replicate_to
			);
		}

		outcome.peers_replicated_to = peers_replicated_to.into_iter().collect();
		outcome.peers_failed_to_replicate_to = peers_failed_to_replicate_to.into_iter().collect();
		Ok(outcome)
	}

	#[allow(clippy::too_many_arguments)]
	fn candidates(
		&self,
		self_id: &BlockManagerId,
		peers: &[BlockManagerId],
		existing_replicas: &HashSet<BlockManagerId>,
		replicated: &HashSet<BlockManagerId>,
		failed: &HashSet<BlockManagerId>,
		block_id: &BlockId,
		num_replicas: usize,
	) -> Vec<BlockManagerId> {
		let filtered: Vec<BlockManagerId> = peers
			.iter()
			.filter(|peer| {
				*peer != self_id
					&& !existing_replicas.contains(peer)
					&& !replicated.contains(peer)
					&& !failed.contains(peer)
			})
			.cloned()
			.collect();
		self.policy
			.prioritize(self_id, &filtered, block_id, num_replicas)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::sync::Arc;

	use crate::testing::{MockMaster, MockTransport};

	fn peer(n: u32) -> BlockManagerId {
		BlockManagerId::new(format!("exec-{}", n), format!("host-{}", n), 7000 + n as u16)
	}

	fn block() -> BlockId {
		BlockId::Rdd {
			rdd_id: 1,
			split_index: 0,
		}
	}

	fn replicator(max_failures: u32) -> Replicator {
		Replicator::new(
			Box::new(RandomReplicationPolicy),
			max_failures,
			Duration::from_secs(60),
		)
	}

	fn level(replication: u8) -> StorageLevel {
		tempest_util::data::MEMORY_ONLY_SER.with_replication(replication)
	}

	#[tokio::test]
	async fn test_replicates_to_target_count() {
		let master = Arc::new(MockMaster::new(vec![peer(1), peer(2), peer(3)]));
		let transport = Arc::new(MockTransport::new());
		let me = peer(0);

		let outcome = replicator(1)
			.replicate(
				&*master,
				&*transport,
				&me,
				&block(),
				Bytes::from_static(b"data"),
				level(3),
				DataTag::of("test"),
				HashSet::new(),
			)
			.await
			.unwrap();

		assert_eq!(outcome.peers_replicated_to.len(), 2);
		assert!(!outcome.peers_replicated_to.contains(&me));
		assert_eq!(transport.uploads().len(), 2);
	}

	#[tokio::test]
	async fn test_failed_peer_is_skipped_and_counted() {
		let master = Arc::new(MockMaster::new(vec![peer(1), peer(2), peer(3)]));
		let transport = Arc::new(MockTransport::new());
		transport.fail_uploads_to("exec-1");
		let me = peer(0);

		let outcome = replicator(1)
			.replicate(
				&*master,
				&*transport,
				&me,
				&block(),
				Bytes::from_static(b"data"),
				level(2),
				DataTag::of("test"),
				HashSet::new(),
			)
			.await
			.unwrap();

		// One replica target; whether peer 1 was ever tried depends on
		// the random ordering, but the outcome never includes it
		assert_eq!(outcome.peers_replicated_to.len(), 1);
		assert!(!outcome.peers_replicated_to.contains(&peer(1)));
	}

	#[tokio::test]
	async fn test_gives_up_after_max_failures() {
		let master = Arc::new(MockMaster::new(vec![peer(1), peer(2), peer(3)]));
		let transport = Arc::new(MockTransport::new());
		transport.fail_uploads_to("exec-1");
		transport.fail_uploads_to("exec-2");
		transport.fail_uploads_to("exec-3");
		let me = peer(0);

		let outcome = replicator(1)
			.replicate(
				&*master,
				&*transport,
				&me,
				&block(),
				Bytes::from_static(b"data"),
				level(3),
				DataTag::of("test"),
				HashSet::new(),
			)
			.await
			.unwrap();

		assert!(outcome.peers_replicated_to.is_empty());
		// num_failures exceeded max_replication_failures = 1: at most 2
		// uploads were attempted
		assert_eq!(transport.uploads().len(), 2);
	}

	#[tokio::test]
	async fn test_existing_replicas_are_excluded() {
		let master = Arc::new(MockMaster::new(vec![peer(1), peer(2), peer(3)]));
		let transport = Arc::new(MockTransport::new());
		let me = peer(0);

		let existing: HashSet<_> = vec![peer(1)].into_iter().collect();
		let outcome = replicator(1)
			.replicate(
				&*master,
				&*transport,
				&me,
				&block(),
				Bytes::from_static(b"data"),
				level(3),
				DataTag::of("test"),
				existing,
			)
			.await
			.unwrap();

		assert_eq!(outcome.peers_replicated_to.len(), 2);
		assert!(!outcome.peers_replicated_to.contains(&peer(1)));
	}

	#[tokio::test]
	async fn test_peer_cache_avoids_master_roundtrips() {
		let master = Arc::new(MockMaster::new(vec![peer(1)]));
		let transport = Arc::new(MockTransport::new());
		let me = peer(0);
		let replicator = replicator(1);

		for _ in 0..3 {
			replicator
				.replicate(
					&*master,
					&*transport,
					&me,
					&block(),
					Bytes::from_static(b"data"),
					level(2),
					DataTag::of("test"),
					HashSet::new(),
				)
				.await
				.unwrap();
		}
		assert_eq!(master.get_peers_calls(), 1);
	}

	#[test]
	fn test_topology_policy_prefers_other_racks() {
		let me = peer(0).with_topology("rack-a");
		let in_rack: Vec<_> = (1..4).map(|n| peer(n).with_topology("rack-a")).collect();
		let off_rack: Vec<_> = (4..7).map(|n| peer(n).with_topology("rack-b")).collect();
		let mut all = in_rack.clone();
		all.extend(off_rack.clone());

		let chosen = TopologyAwareReplicationPolicy.prioritize(&me, &all, &block(), 3);
		assert_eq!(chosen.len(), 3);
		for peer in &chosen {
			assert!(off_rack.contains(peer));
		}
	}

	#[test]
	fn test_policy_factory() {
		assert!(replication_policy_from_config("random").is_ok());
		assert!(replication_policy_from_config("topology").is_ok());
		assert!(replication_policy_from_config("bogus").is_err());
	}
}
