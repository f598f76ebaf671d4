//! Crate containing the interfaces through which the block storage
//! service talks to the rest of the cluster: the master directory, the
//! block transfer service, the shuffle service, and the RPC endpoint
//! plumbing for directives addressed to this node.

#[macro_use]
extern crate tracing;

pub mod master;
pub mod node;
pub mod shuffle;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Messages that can be exchanged on an RPC endpoint
pub trait Rpc: Serialize + DeserializeOwned + Send + Sync + 'static {
	/// The response produced by the handler of this message type
	type Response: Send;
}

/// Objects that can handle messages addressed to this node.
///
/// The transport itself lives outside this subsystem; it dispatches each
/// inbound message of type `M` to the handler registered under the
/// endpoint's name.
#[async_trait]
pub trait EndpointHandler<M>: Send + Sync
where
	M: Rpc,
{
	async fn handle(self: &Arc<Self>, message: &M, from: node::BlockManagerId) -> M::Response;
}

static ENDPOINT_ID: AtomicU64 = AtomicU64::new(0);

/// Name under which a block manager registers its directive endpoint;
/// each call yields a fresh process-wide monotonic suffix
pub fn block_manager_endpoint_name() -> String {
	format!(
		"BlockManagerEndpoint{}",
		ENDPOINT_ID.fetch_add(1, Ordering::SeqCst)
	)
}
