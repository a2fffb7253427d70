use {
    super::{
        backend_tpu_client::Result,
        cluster_source::{ClusterInfoSource, ClusterNode},
        recent_leaders_slot::MAX_FANOUT_SLOTS,
    },
    log::*,
    solana_sdk::{clock::Slot, commitment_config::CommitmentConfig, pubkey::Pubkey},
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
    },
};

/// TPU addresses of the upcoming leaders, in schedule order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaderSockets {
    /// Addresses exactly as advertised by the cluster.
    pub addresses: Vec<String>,
    /// The subset of `addresses` that parse as socket addresses.
    pub sockets: Vec<SocketAddr>,
}

impl LeaderSockets {
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Leader schedule for a contiguous window of slots together with the TPU
/// address of every known leader.
pub struct LeaderTpuCache {
    first_slot: Slot,
    leaders: Vec<Pubkey>,
    leader_tpu_map: HashMap<Pubkey, String>,
    slots_in_epoch: Slot,
}

impl LeaderTpuCache {
    pub fn new(
        first_slot: Slot,
        slots_in_epoch: Slot,
        leaders: Vec<Pubkey>,
        cluster_nodes: Vec<ClusterNode>,
    ) -> Self {
        Self {
            first_slot,
            leaders,
            leader_tpu_map: Self::extract_cluster_tpu_sockets(cluster_nodes),
            slots_in_epoch,
        }
    }

    /// Builds the cache anchored at `first_slot`. Any failing query fails the
    /// whole load.
    pub async fn load(source: &dyn ClusterInfoSource, first_slot: Slot) -> Result<Self> {
        let slots_in_epoch = source
            .get_epoch_info(CommitmentConfig::processed())
            .await?
            .slots_in_epoch;
        let leaders = Self::fetch_slot_leaders(source, first_slot, slots_in_epoch).await?;
        let cluster_nodes = source.get_cluster_nodes().await?;
        Ok(Self::new(first_slot, slots_in_epoch, leaders, cluster_nodes))
    }

    pub fn fanout(slots_in_epoch: Slot) -> Slot {
        (2 * MAX_FANOUT_SLOTS).min(slots_in_epoch)
    }

    pub async fn fetch_slot_leaders(
        source: &dyn ClusterInfoSource,
        start_slot: Slot,
        slots_in_epoch: Slot,
    ) -> Result<Vec<Pubkey>> {
        source
            .get_slot_leaders(start_slot, Self::fanout(slots_in_epoch))
            .await
    }

    pub async fn fetch_cluster_tpu_sockets(
        source: &dyn ClusterInfoSource,
    ) -> Result<HashMap<Pubkey, String>> {
        let cluster_nodes = source.get_cluster_nodes().await?;
        Ok(Self::extract_cluster_tpu_sockets(cluster_nodes))
    }

    fn extract_cluster_tpu_sockets(cluster_nodes: Vec<ClusterNode>) -> HashMap<Pubkey, String> {
        cluster_nodes
            .into_iter()
            .filter_map(|node| Some((node.pubkey, node.tpu?)))
            .collect()
    }

    pub fn first_slot(&self) -> Slot {
        self.first_slot
    }

    pub fn slots_in_epoch(&self) -> Slot {
        self.slots_in_epoch
    }

    pub fn leaders(&self) -> &[Pubkey] {
        &self.leaders
    }

    // Last slot that has a cached leader pubkey
    pub fn last_slot(&self) -> Slot {
        self.first_slot
            .saturating_add(self.leaders.len().saturating_sub(1) as u64)
    }

    pub fn get_slot_leader(&self, slot: Slot) -> Option<&Pubkey> {
        if slot >= self.first_slot {
            let index = slot - self.first_slot;
            self.leaders.get(index as usize)
        } else {
            None
        }
    }

    pub fn get_leader_tpu(&self, leader: &Pubkey) -> Option<&str> {
        self.leader_tpu_map.get(leader).map(String::as_str)
    }

    /// Re-anchors the leader window. Callers hold the write guard so the new
    /// anchor and the new schedule become visible together.
    pub fn update_leaders(&mut self, first_slot: Slot, leaders: Vec<Pubkey>) {
        self.first_slot = first_slot;
        self.leaders = leaders;
    }

    pub fn update_cluster_tpu_sockets(&mut self, leader_tpu_map: HashMap<Pubkey, String>) {
        self.leader_tpu_map = leader_tpu_map;
    }

    /// Resolves the TPU addresses of the leaders found in the first
    /// `fanout_slots` positions of the window.
    ///
    /// Each leader is listed once, at its first position. The scan stops after
    /// `fanout_slots` positions whether or not they held distinct leaders, so
    /// consecutive slots of the same leader shrink the result.
    pub fn get_leader_sockets(&self, fanout_slots: u64) -> LeaderSockets {
        let mut leader_sockets = LeaderSockets::default();
        let mut checked_leaders = HashSet::new();
        for leader in self.leaders.iter().take(fanout_slots as usize) {
            let Some(tpu_socket) = self.leader_tpu_map.get(leader) else {
                // The leader is probably delinquent
                trace!("TPU not available for leader {}", leader);
                continue;
            };
            if !checked_leaders.insert(leader) {
                continue;
            }
            match tpu_socket.parse::<SocketAddr>() {
                Ok(socket) => leader_sockets.sockets.push(socket),
                Err(err) => debug!("Unresolvable TPU address {tpu_socket} for {leader}: {err}"),
            }
            leader_sockets.addresses.push(tpu_socket.clone());
        }
        leader_sockets
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::cluster_source::tests::{node, MockClusterInfoSource},
        std::sync::atomic::Ordering,
    };

    fn cache_with(leaders: Vec<Pubkey>, cluster_nodes: Vec<ClusterNode>) -> LeaderTpuCache {
        LeaderTpuCache::new(1_000, 432_000, leaders, cluster_nodes)
    }

    #[test]
    fn test_repeated_leader_counts_scanned_slots() {
        let a = node(Some("10.0.0.1:8003"));
        let b = node(Some("10.0.0.2:8003"));
        let cache = cache_with(vec![a.pubkey, a.pubkey, b.pubkey], vec![a.clone(), b.clone()]);

        let sockets = cache.get_leader_sockets(3);
        assert_eq!(sockets.addresses, vec!["10.0.0.1:8003", "10.0.0.2:8003"]);
        assert_eq!(
            sockets.sockets,
            vec![
                "10.0.0.1:8003".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:8003".parse().unwrap()
            ]
        );

        // Two positions scanned, both belong to `a`.
        assert_eq!(cache.get_leader_sockets(2).addresses, vec!["10.0.0.1:8003"]);
    }

    #[test]
    fn test_leaders_without_tpu_are_skipped() {
        let a = node(None);
        let b = node(Some("10.0.0.2:8003"));
        let unknown = Pubkey::new_unique();
        let cache = cache_with(vec![unknown, a.pubkey, b.pubkey], vec![a, b]);

        assert_eq!(cache.get_leader_sockets(3).addresses, vec!["10.0.0.2:8003"]);
        assert!(cache.get_leader_sockets(2).is_empty());
    }

    #[test]
    fn test_unparsable_address_is_kept_in_raw_form_only() {
        let a = node(Some("validator.example:8003"));
        let cache = cache_with(vec![a.pubkey], vec![a]);

        let sockets = cache.get_leader_sockets(4);
        assert_eq!(sockets.addresses, vec!["validator.example:8003"]);
        assert!(sockets.sockets.is_empty());
    }

    #[test]
    fn test_slot_window_bounds() {
        let a = node(Some("10.0.0.1:8003"));
        let b = node(Some("10.0.0.2:8003"));
        let mut cache = cache_with(vec![a.pubkey, b.pubkey], vec![a.clone(), b.clone()]);

        assert_eq!(cache.last_slot(), 1_001);
        assert_eq!(cache.get_slot_leader(999), None);
        assert_eq!(cache.get_slot_leader(1_001), Some(&b.pubkey));
        assert_eq!(cache.get_slot_leader(1_002), None);

        cache.update_leaders(2_000, vec![b.pubkey; 3]);
        assert_eq!(cache.first_slot(), 2_000);
        assert_eq!(cache.last_slot(), 2_002);
        assert_eq!(cache.get_slot_leader(2_000), Some(&b.pubkey));
    }

    #[test]
    fn test_last_slot_saturates() {
        let a = node(Some("10.0.0.1:8003"));
        let cache = LeaderTpuCache::new(Slot::MAX - 1, 432_000, vec![a.pubkey; 4], vec![a.clone()]);
        assert_eq!(cache.last_slot(), Slot::MAX);
        assert_eq!(cache.get_slot_leader(Slot::MAX), Some(&a.pubkey));
    }

    #[test]
    fn test_fanout_window_length() {
        assert_eq!(LeaderTpuCache::fanout(432_000), 2 * MAX_FANOUT_SLOTS);
        assert_eq!(LeaderTpuCache::fanout(32), 32);
    }

    #[tokio::test]
    async fn test_load_fetches_window_and_topology() {
        let nodes = vec![node(Some("10.0.0.1:8003")), node(None)];
        let source = MockClusterInfoSource::new(500, 64, nodes.clone());

        let cache = LeaderTpuCache::load(&source, 500).await.unwrap();
        assert_eq!(cache.first_slot(), 500);
        assert_eq!(cache.slots_in_epoch(), 64);
        assert_eq!(cache.leaders().len(), 64);
        assert_eq!(cache.last_slot(), 563);
        assert_eq!(
            source.slot_leaders_requests.lock().unwrap().as_slice(),
            &[(500, 64)]
        );
        assert_eq!(cache.get_leader_tpu(&nodes[0].pubkey), Some("10.0.0.1:8003"));
        assert_eq!(cache.get_leader_tpu(&nodes[1].pubkey), None);
    }

    #[tokio::test]
    async fn test_load_fails_when_a_query_fails() {
        let source = MockClusterInfoSource::new(500, 432_000, vec![node(None)]);
        source.fail_cluster_nodes.store(true, Ordering::Relaxed);
        assert!(LeaderTpuCache::load(&source, 500).await.is_err());

        source.fail_cluster_nodes.store(false, Ordering::Relaxed);
        source.fail_slot_leaders.store(true, Ordering::Relaxed);
        assert!(LeaderTpuCache::load(&source, 500).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_slot_leaders_uses_capped_window() {
        let source = MockClusterInfoSource::new(0, 432_000, vec![node(None)]);
        let leaders = LeaderTpuCache::fetch_slot_leaders(&source, 7, 432_000)
            .await
            .unwrap();
        assert_eq!(leaders.len() as u64, 2 * MAX_FANOUT_SLOTS);
    }
}
