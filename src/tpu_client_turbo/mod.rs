use {
    crate::engine::{
        backend_tpu_client::{BackendTpuClient, Result},
        cluster_source::ClusterInfoSource,
        leader_tpu_cache::LeaderSockets,
        recent_leaders_slot::TpuClientConfig,
        slot_watcher::SlotEvent,
    },
    solana_rpc_client::nonblocking::rpc_client::RpcClient,
    solana_sdk::{clock::Slot, signature::Signature, transaction::Transaction},
    std::sync::Arc,
    tokio::{net::UdpSocket, sync::mpsc},
};

/// Client which sends transactions directly to the current leader's TPU port over UDP.
/// The client uses RPC to determine the current leader and fetch node contact info
pub struct TpuClient {
    tpu_client: BackendTpuClient,
}

impl TpuClient {
    /// Create a new client that disconnects when dropped. An empty
    /// `websocket_url` tracks the current slot by polling RPC.
    pub async fn new(
        rpc_client: Arc<RpcClient>,
        websocket_url: &str,
        config: TpuClientConfig,
    ) -> Result<Self> {
        Self::new_with_source(rpc_client, websocket_url, config).await
    }

    /// Create a new client on top of any [`ClusterInfoSource`]
    pub async fn new_with_source(
        source: Arc<dyn ClusterInfoSource>,
        websocket_url: &str,
        config: TpuClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            tpu_client: BackendTpuClient::new(source, websocket_url, config).await?,
        })
    }

    /// Create a new client fed with slot events by the caller
    pub async fn new_with_slot_events(
        source: Arc<dyn ClusterInfoSource>,
        slot_events: mpsc::Receiver<SlotEvent>,
        config: TpuClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            tpu_client: BackendTpuClient::new_with_slot_events(source, Some(slot_events), config)
                .await?,
        })
    }

    /// Serialize and send transaction to the upcoming leader TPUs according to fanout size
    pub async fn send_transaction(
        &self,
        transaction: &Transaction,
        repeat_count: usize,
    ) -> Result<Signature> {
        self.tpu_client
            .send_transaction(transaction, repeat_count)
            .await
    }

    /// Send a wire transaction to the upcoming leader TPUs according to fanout size
    /// Returns the last error if all sends fail
    pub async fn send_raw_transaction(
        &self,
        wire_transaction: &[u8],
        repeat_count: usize,
    ) -> Result<()> {
        self.tpu_client
            .send_wire_transaction(wire_transaction, repeat_count)
            .await
    }

    pub async fn send_transaction_through_socket(
        &self,
        transaction: &Transaction,
        repeat_count: usize,
        socket: &UdpSocket,
    ) -> Result<Signature> {
        self.tpu_client
            .send_transaction_through_socket(transaction, repeat_count, socket)
            .await
    }

    pub async fn send_raw_transaction_through_socket(
        &self,
        wire_transaction: &[u8],
        repeat_count: usize,
        socket: &UdpSocket,
    ) {
        self.tpu_client
            .send_wire_transaction_through_socket(wire_transaction, repeat_count, socket)
            .await
    }

    /// TPU addresses the next send would fan out to
    pub fn leader_tpu_sockets(&self) -> LeaderSockets {
        self.tpu_client
            .leader_tpu_service()
            .leader_tpu_sockets(self.tpu_client.fanout_slots())
    }

    pub fn estimated_current_slot(&self) -> Slot {
        self.tpu_client.leader_tpu_service().estimated_current_slot()
    }

    pub fn fanout_slots(&self) -> u64 {
        self.tpu_client.fanout_slots()
    }

    pub async fn shutdown(&mut self) {
        self.tpu_client.shutdown().await
    }
}
