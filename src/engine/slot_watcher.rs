//! Feeds [`RecentLeaderSlots`] with the slots the cluster is working on.
//!
//! The preferred input is the websocket `slotsUpdatesSubscribe` stream. When
//! no websocket endpoint is configured, the connection cannot be established,
//! or the stream ends, the watcher falls back to polling `getSlot`.
use {
    super::{
        backend_tpu_client::Result, cluster_source::ClusterInfoSource,
        recent_leaders_slot::RecentLeaderSlots,
    },
    futures_util::stream::StreamExt,
    log::*,
    solana_pubsub_client::nonblocking::pubsub_client::PubsubClient,
    solana_rpc_client_api::response::SlotUpdate,
    solana_sdk::{clock::Slot, commitment_config::CommitmentConfig},
    std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    tokio::{
        sync::mpsc,
        task::JoinHandle,
        time::{sleep, timeout, Duration},
    },
};

// Notifications are an unbounded stream, polling them would block forever
// and the exit flag would never be checked. Must stay below the slot time.
const SLOT_UPDATE_TIMEOUT: Duration = Duration::from_millis(10);

const SLOT_EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    /// A full slot was received by the connected node, its leader no longer
    /// accepts transactions.
    Completed(Slot),
    /// The first shred of the slot arrived, its leader is probably still
    /// accepting transactions.
    FirstShredReceived(Slot),
}

impl SlotEvent {
    /// The slot worth targeting after this event.
    pub fn current_slot(&self) -> Slot {
        match self {
            SlotEvent::Completed(slot) => slot.saturating_add(1),
            SlotEvent::FirstShredReceived(slot) => *slot,
        }
    }
}

pub fn map_slot_update(update: SlotUpdate) -> Option<SlotEvent> {
    match update {
        SlotUpdate::Completed { slot, .. } => Some(SlotEvent::Completed(slot)),
        SlotUpdate::FirstShredReceived { slot, .. } => Some(SlotEvent::FirstShredReceived(slot)),
        _ => None,
    }
}

/// Connects to `websocket_url` and forwards slot events into a channel until
/// the subscription ends, the receiver is dropped or `exit` is raised.
///
/// Only the connection is established before returning. A failed
/// subscription shows up as a closed channel.
pub async fn websocket_slot_event_stream(
    websocket_url: &str,
    exit: Arc<AtomicBool>,
) -> Result<(mpsc::Receiver<SlotEvent>, JoinHandle<Result<()>>)> {
    let pubsub_client = PubsubClient::new(websocket_url).await?;
    let (sender, receiver) = mpsc::channel(SLOT_EVENT_CHANNEL_SIZE);

    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        let (mut notifications, unsubscribe) = pubsub_client.slot_updates_subscribe().await?;

        while !exit.load(Ordering::Relaxed) && !sender.is_closed() {
            match timeout(SLOT_UPDATE_TIMEOUT, notifications.next()).await {
                Ok(Some(update)) => {
                    let Some(event) = map_slot_update(update) else {
                        continue;
                    };
                    if sender.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Slot update subscription closed");
                    break;
                }
                Err(_) => continue,
            }
        }

        // `notifications` requires a valid reference to `pubsub_client`, so `notifications` must be
        // dropped before moving `pubsub_client` via `shutdown()`.
        drop(notifications);
        unsubscribe().await;
        pubsub_client.shutdown().await?;
        Ok(())
    });

    Ok((receiver, handle))
}

/// Records slots from `slot_events` until the channel closes, then keeps the
/// estimate moving by polling `getSlot` every `poll_interval`.
pub(crate) async fn run_slot_watcher(
    source: Arc<dyn ClusterInfoSource>,
    recent_slots: RecentLeaderSlots,
    slot_events: Option<mpsc::Receiver<SlotEvent>>,
    poll_interval: Duration,
    exit: Arc<AtomicBool>,
) -> Result<()> {
    if let Some(mut slot_events) = slot_events {
        while !exit.load(Ordering::Relaxed) {
            match timeout(SLOT_UPDATE_TIMEOUT, slot_events.recv()).await {
                Ok(Some(event)) => recent_slots.record_slot(event.current_slot()),
                Ok(None) => {
                    warn!("Slot update stream ended, falling back to slot polling");
                    break;
                }
                Err(_) => continue,
            }
        }
    }

    while !exit.load(Ordering::Relaxed) {
        match source.get_slot(CommitmentConfig::processed()).await {
            Ok(slot) => recent_slots.record_slot(slot),
            Err(err) => debug!("Failed to poll current slot: {}", err),
        }
        sleep(poll_interval).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::cluster_source::tests::{node, MockClusterInfoSource},
        std::time::Instant,
    };

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_slot_update_mapping() {
        let completed = SlotUpdate::Completed {
            slot: 41,
            timestamp: 0,
        };
        let first_shred = SlotUpdate::FirstShredReceived {
            slot: 42,
            timestamp: 0,
        };
        let root = SlotUpdate::Root {
            slot: 40,
            timestamp: 0,
        };

        assert_eq!(map_slot_update(completed).map(|e| e.current_slot()), Some(42));
        assert_eq!(map_slot_update(first_shred).map(|e| e.current_slot()), Some(42));
        assert_eq!(map_slot_update(root), None);
    }

    #[tokio::test]
    async fn test_records_events_then_falls_back_to_polling() {
        let source = Arc::new(MockClusterInfoSource::new(90, 432_000, vec![node(None)]));
        let recent_slots = RecentLeaderSlots::default();
        let exit = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::channel(8);

        let handle = tokio::spawn(run_slot_watcher(
            source.clone(),
            recent_slots.clone(),
            Some(receiver),
            Duration::from_millis(5),
            exit.clone(),
        ));

        sender.send(SlotEvent::Completed(10)).await.unwrap();
        sender.send(SlotEvent::FirstShredReceived(12)).await.unwrap();
        wait_for(|| recent_slots.len() == 2).await;
        assert_eq!(recent_slots.snapshot(), vec![11, 12]);

        drop(sender);
        wait_for(|| recent_slots.snapshot().contains(&90)).await;

        exit.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_polls_without_stream_and_survives_errors() {
        let source = Arc::new(MockClusterInfoSource::new(7, 432_000, vec![node(None)]));
        source.fail_slot.store(true, Ordering::Relaxed);
        let recent_slots = RecentLeaderSlots::default();
        let exit = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(run_slot_watcher(
            source.clone(),
            recent_slots.clone(),
            None,
            Duration::from_millis(5),
            exit.clone(),
        ));

        sleep(Duration::from_millis(30)).await;
        assert!(recent_slots.is_empty());

        source.fail_slot.store(false, Ordering::Relaxed);
        wait_for(|| recent_slots.estimated_current_slot() == 7).await;

        exit.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }
}
