use {
    super::{
        backend_tpu_client::Result,
        cluster_source::ClusterInfoSource,
        leader_tpu_cache::{LeaderSockets, LeaderTpuCache},
        recent_leaders_slot::{RecentLeaderSlots, TpuClientConfig},
        slot_watcher::{run_slot_watcher, websocket_slot_event_stream, SlotEvent},
    },
    log::*,
    solana_sdk::{clock::Slot, commitment_config::CommitmentConfig},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
    tokio::{
        sync::mpsc,
        task::JoinHandle,
        time::{sleep, Duration, Instant},
    },
};

/// Service that tracks upcoming leaders and maintains an up-to-date mapping
/// of leader id to TPU socket address.
pub struct LeaderTpuService {
    recent_slots: RecentLeaderSlots,
    leader_tpu_cache: Arc<RwLock<LeaderTpuCache>>,
    t_leader_tpu_service: Option<JoinHandle<Result<()>>>,
    t_slot_event_stream: Option<JoinHandle<Result<()>>>,
}

impl LeaderTpuService {
    /// Loads the leader cache and starts the background refresher. An empty
    /// `websocket_url`, or one that cannot be reached, leaves slot tracking to
    /// `getSlot` polling.
    pub async fn new(
        source: Arc<dyn ClusterInfoSource>,
        websocket_url: &str,
        config: &TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (slot_events, t_slot_event_stream) = if websocket_url.is_empty() {
            (None, None)
        } else {
            match websocket_slot_event_stream(websocket_url, exit.clone()).await {
                Ok((slot_events, handle)) => (Some(slot_events), Some(handle)),
                Err(err) => {
                    warn!(
                        "Failed to subscribe to slot updates at {}, polling getSlot instead: {}",
                        websocket_url, err
                    );
                    (None, None)
                }
            }
        };

        let mut service = Self::with_slot_events(source, slot_events, config, exit).await?;
        service.t_slot_event_stream = t_slot_event_stream;
        Ok(service)
    }

    /// Same as [`LeaderTpuService::new`] with slot events supplied by the
    /// caller instead of a websocket subscription.
    pub async fn with_slot_events(
        source: Arc<dyn ClusterInfoSource>,
        slot_events: Option<mpsc::Receiver<SlotEvent>>,
        config: &TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) -> Result<Self> {
        let start_slot = source.get_slot(CommitmentConfig::processed()).await?;

        let recent_slots = RecentLeaderSlots::with_max_skip_distance(config.max_slot_skip_distance);
        recent_slots.record_slot(start_slot);

        let leader_tpu_cache = Arc::new(RwLock::new(
            LeaderTpuCache::load(source.as_ref(), start_slot).await?,
        ));
        info!(
            "Leader TPU cache loaded at slot {} for fanout of {} slots",
            start_slot,
            config.clamped_fanout_slots()
        );

        let t_leader_tpu_service = Some({
            let recent_slots = recent_slots.clone();
            let leader_tpu_cache = leader_tpu_cache.clone();
            tokio::spawn(Self::run(
                source,
                recent_slots,
                leader_tpu_cache,
                slot_events,
                config.clone(),
                exit,
            ))
        });

        Ok(LeaderTpuService {
            recent_slots,
            leader_tpu_cache,
            t_leader_tpu_service,
            t_slot_event_stream: None,
        })
    }

    /// Waits for the background tasks. Only returns once the exit flag shared
    /// at construction has been raised.
    pub async fn join(&mut self) {
        for t_handle in [
            self.t_leader_tpu_service.take(),
            self.t_slot_event_stream.take(),
        ]
        .into_iter()
        .flatten()
        {
            match t_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("Leader TPU service task failed: {}", err),
                Err(err) => warn!("Leader TPU service task panicked: {}", err),
            }
        }
    }

    pub fn estimated_current_slot(&self) -> Slot {
        self.recent_slots.estimated_current_slot()
    }

    pub fn recent_slots(&self) -> &RecentLeaderSlots {
        &self.recent_slots
    }

    pub fn leader_tpu_sockets(&self, fanout_slots: u64) -> LeaderSockets {
        self.leader_tpu_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get_leader_sockets(fanout_slots)
    }

    /// `(first_slot, last_slot)` of the cached leader window.
    pub fn leader_window(&self) -> (Slot, Slot) {
        let leader_tpu_cache = self
            .leader_tpu_cache
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (leader_tpu_cache.first_slot(), leader_tpu_cache.last_slot())
    }

    async fn run(
        source: Arc<dyn ClusterInfoSource>,
        recent_slots: RecentLeaderSlots,
        leader_tpu_cache: Arc<RwLock<LeaderTpuCache>>,
        slot_events: Option<mpsc::Receiver<SlotEvent>>,
        config: TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) -> Result<()> {
        tokio::try_join!(
            run_slot_watcher(
                source.clone(),
                recent_slots.clone(),
                slot_events,
                config.slot_poll_interval,
                exit.clone(),
            ),
            Self::run_cache_refresher(source, recent_slots, leader_tpu_cache, config, exit),
        )?;

        Ok(())
    }

    async fn run_cache_refresher(
        source: Arc<dyn ClusterInfoSource>,
        recent_slots: RecentLeaderSlots,
        leader_tpu_cache: Arc<RwLock<LeaderTpuCache>>,
        config: TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) -> Result<()> {
        let fanout_slots = config.clamped_fanout_slots();
        let mut last_cluster_refresh = Instant::now();
        let mut sleep_interval = config.refresh_interval;

        while !exit.load(Ordering::Relaxed) {
            if last_cluster_refresh.elapsed() > config.cluster_refresh_interval {
                match LeaderTpuCache::fetch_cluster_tpu_sockets(source.as_ref()).await {
                    Ok(leader_tpu_map) => {
                        leader_tpu_cache
                            .write()
                            .unwrap_or_else(PoisonError::into_inner)
                            .update_cluster_tpu_sockets(leader_tpu_map);
                        last_cluster_refresh = Instant::now();
                    }
                    Err(err) => {
                        warn!("Failed to fetch cluster tpu sockets: {}", err);
                        sleep_interval = config.retry_interval;
                        sleep(sleep_interval).await;
                        continue;
                    }
                }
            }

            sleep(sleep_interval).await;
            sleep_interval = config.refresh_interval;

            let estimated_current_slot = recent_slots.estimated_current_slot();
            let (last_slot, slots_in_epoch) = {
                let leader_tpu_cache = leader_tpu_cache
                    .read()
                    .unwrap_or_else(PoisonError::into_inner);
                (leader_tpu_cache.last_slot(), leader_tpu_cache.slots_in_epoch())
            };
            if estimated_current_slot < last_slot.saturating_sub(fanout_slots) {
                continue;
            }

            match LeaderTpuCache::fetch_slot_leaders(
                source.as_ref(),
                estimated_current_slot,
                slots_in_epoch,
            )
            .await
            {
                Ok(slot_leaders) => {
                    debug!(
                        "Leader window moved to [{}, {}]",
                        estimated_current_slot,
                        estimated_current_slot + slot_leaders.len().saturating_sub(1) as u64
                    );
                    leader_tpu_cache
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .update_leaders(estimated_current_slot, slot_leaders);
                }
                Err(err) => {
                    warn!(
                        "Failed to fetch slot leaders (current estimated slot: {}): {}",
                        estimated_current_slot, err
                    );
                    sleep_interval = config.retry_interval;
                }
            }
        }

        Ok(())
    }
}
