//! Query side of the cluster: who leads which slot, where the leaders can be
//! reached, and which slot the cluster is processing.
use {
    super::backend_tpu_client::Result,
    async_trait::async_trait,
    solana_rpc_client::nonblocking::rpc_client::RpcClient,
    solana_sdk::{
        clock::Slot, commitment_config::CommitmentConfig, epoch_info::EpochInfo, pubkey::Pubkey,
    },
    std::str::FromStr,
};

/// Contact info of a cluster node as far as transaction fan-out cares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterNode {
    pub pubkey: Pubkey,
    /// TPU address in `host:port` form, `None` when the node does not
    /// advertise one.
    pub tpu: Option<String>,
}

/// Abstracts the request/response interface used to build and refresh the
/// leader cache. [`RpcClient`] is the production implementation.
#[async_trait]
pub trait ClusterInfoSource: Send + Sync + 'static {
    async fn get_epoch_info(&self, commitment: CommitmentConfig) -> Result<EpochInfo>;

    async fn get_slot_leaders(&self, start_slot: Slot, limit: u64) -> Result<Vec<Pubkey>>;

    async fn get_cluster_nodes(&self) -> Result<Vec<ClusterNode>>;

    async fn get_slot(&self, commitment: CommitmentConfig) -> Result<Slot>;
}

#[async_trait]
impl ClusterInfoSource for RpcClient {
    async fn get_epoch_info(&self, commitment: CommitmentConfig) -> Result<EpochInfo> {
        Ok(self.get_epoch_info_with_commitment(commitment).await?)
    }

    async fn get_slot_leaders(&self, start_slot: Slot, limit: u64) -> Result<Vec<Pubkey>> {
        Ok(RpcClient::get_slot_leaders(self, start_slot, limit).await?)
    }

    async fn get_cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        let cluster_nodes = RpcClient::get_cluster_nodes(self).await?;
        Ok(cluster_nodes
            .into_iter()
            .filter_map(|contact_info| {
                let pubkey = Pubkey::from_str(&contact_info.pubkey).ok()?;
                Some(ClusterNode {
                    pubkey,
                    tpu: contact_info.tpu.map(|socket| socket.to_string()),
                })
            })
            .collect())
    }

    async fn get_slot(&self, commitment: CommitmentConfig) -> Result<Slot> {
        Ok(self.get_slot_with_commitment(commitment).await?)
    }
}
