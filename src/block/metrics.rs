use opentelemetry::{global, metrics::*};

/// BlockManagerMetrics references all counters used for metrics
pub struct BlockManagerMetrics {
	pub(crate) bytes_read_local: Counter<u64>,
	pub(crate) bytes_read_remote: Counter<u64>,
	pub(crate) block_read_duration: Histogram<f64>,
	pub(crate) bytes_written: Counter<u64>,
	pub(crate) block_put_duration: Histogram<f64>,

	pub(crate) evicted_counter: Counter<u64>,
	pub(crate) spilled_counter: Counter<u64>,
	pub(crate) removed_counter: Counter<u64>,

	pub(crate) replication_counter: Counter<u64>,
	pub(crate) replication_failure_counter: Counter<u64>,
	pub(crate) fetch_failure_counter: Counter<u64>,
	pub(crate) location_refresh_counter: Counter<u64>,

	pub(crate) corruption_counter: Counter<u64>,
}

impl BlockManagerMetrics {
	pub fn new() -> Self {
		let meter = global::meter("tempest_block/manager");
		Self {
			bytes_read_local: meter
				.u64_counter("block.bytes_read_local")
				.with_description("Number of block bytes served from the local tiers")
				.init(),
			bytes_read_remote: meter
				.u64_counter("block.bytes_read_remote")
				.with_description("Number of block bytes fetched from peers")
				.init(),
			block_read_duration: meter
				.f64_histogram("block.read_duration")
				.with_description("Duration of local block read operations")
				.init(),
			bytes_written: meter
				.u64_counter("block.bytes_written")
				.with_description("Number of block bytes admitted to the local tiers")
				.init(),
			block_put_duration: meter
				.f64_histogram("block.put_duration")
				.with_description("Duration of block put operations")
				.init(),

			evicted_counter: meter
				.u64_counter("block.evicted_counter")
				.with_description("Number of blocks dropped from memory under pressure")
				.init(),
			spilled_counter: meter
				.u64_counter("block.spilled_counter")
				.with_description("Number of evicted blocks persisted to disk")
				.init(),
			removed_counter: meter
				.u64_counter("block.removed_counter")
				.with_description("Number of blocks removed explicitly")
				.init(),

			replication_counter: meter
				.u64_counter("block.replication_counter")
				.with_description("Number of block replicas pushed to peers")
				.init(),
			replication_failure_counter: meter
				.u64_counter("block.replication_failure_counter")
				.with_description("Number of failed replica uploads")
				.init(),
			fetch_failure_counter: meter
				.u64_counter("block.fetch_failure_counter")
				.with_description("Number of failed remote block fetches")
				.init(),
			location_refresh_counter: meter
				.u64_counter("block.location_refresh_counter")
				.with_description("Number of times block locations were re-fetched from the master")
				.init(),

			corruption_counter: meter
				.u64_counter("block.corruption_counter")
				.with_description("Number of blocks that could not be read back locally")
				.init(),
		}
	}
}

impl Default for BlockManagerMetrics {
	fn default() -> Self {
		Self::new()
	}
}
