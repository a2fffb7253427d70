use {
    solana_sdk::clock::{Slot, DEFAULT_MS_PER_SLOT},
    std::{
        collections::VecDeque,
        sync::{Arc, PoisonError, RwLock},
        time::Duration,
    },
};

/// Default number of slots used to build TPU socket fanout set
pub const DEFAULT_FANOUT_SLOTS: u64 = 12;

/// Maximum number of slots used to build TPU socket fanout set
pub const MAX_FANOUT_SLOTS: u64 = 100;

// 48 chosen because it's unlikely that 12 leaders in a row will miss their slots
pub const MAX_SLOT_SKIP_DISTANCE: u64 = 48;

// 12 recent slots should be large enough to avoid a misbehaving
// validator from affecting the median recent slot
pub const RECENT_LEADER_SLOTS_CAPACITY: usize = 12;

/// Tick of the leader cache refresher when nothing went wrong.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(1000);

/// Tick of the leader cache refresher after a failed RPC call.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Cluster TPU ports are refreshed every 5min in case validators restart with
/// new port configuration or new validators come online.
pub const DEFAULT_CLUSTER_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Config params for `TpuClient`
#[derive(Clone, Debug)]
pub struct TpuClientConfig {
    /// The range of upcoming slots to include when determining which
    /// leaders to send transactions to (min: 1, max: `MAX_FANOUT_SLOTS`)
    pub fanout_slots: u64,
    /// Upper bound on how far the highest recent slot may run ahead of the
    /// median before it is discarded as bogus.
    pub max_slot_skip_distance: u64,
    /// How often `getSlot` is polled when no slot update stream is available.
    pub slot_poll_interval: Duration,
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
    pub cluster_refresh_interval: Duration,
}

impl Default for TpuClientConfig {
    fn default() -> Self {
        Self {
            fanout_slots: DEFAULT_FANOUT_SLOTS,
            max_slot_skip_distance: MAX_SLOT_SKIP_DISTANCE,
            slot_poll_interval: Duration::from_millis(DEFAULT_MS_PER_SLOT),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            cluster_refresh_interval: DEFAULT_CLUSTER_REFRESH_INTERVAL,
        }
    }
}

impl TpuClientConfig {
    pub fn clamped_fanout_slots(&self) -> u64 {
        self.fanout_slots.clamp(1, MAX_FANOUT_SLOTS)
    }
}

/// Window of the most recently observed slots, in arrival order.
///
/// Cloning the handle shares the window, so the slot watcher can record into
/// it while the refresher and senders read estimates.
#[derive(Clone, Debug)]
pub struct RecentLeaderSlots {
    slots: Arc<RwLock<VecDeque<Slot>>>,
    max_slot_skip_distance: u64,
}

impl Default for RecentLeaderSlots {
    fn default() -> Self {
        Self::with_max_skip_distance(MAX_SLOT_SKIP_DISTANCE)
    }
}

impl RecentLeaderSlots {
    pub fn new(current_slot: Slot) -> Self {
        let recent_slots = Self::default();
        recent_slots.record_slot(current_slot);
        recent_slots
    }

    pub fn with_max_skip_distance(max_slot_skip_distance: u64) -> Self {
        Self {
            slots: Arc::new(RwLock::new(VecDeque::with_capacity(
                RECENT_LEADER_SLOTS_CAPACITY,
            ))),
            max_slot_skip_distance,
        }
    }

    pub fn record_slot(&self, current_slot: Slot) {
        let mut recent_slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        recent_slots.push_back(current_slot);
        while recent_slots.len() > RECENT_LEADER_SLOTS_CAPACITY {
            recent_slots.pop_front();
        }
    }

    /// Retained samples, oldest first.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Estimate the current slot from recent slot notifications. Returns 0
    // until the first slot has been recorded.
    pub fn estimated_current_slot(&self) -> Slot {
        let mut recent_slots = self.snapshot();
        if recent_slots.is_empty() {
            return 0;
        }
        recent_slots.sort_unstable();

        // Validators can broadcast invalid blocks that are far in the future
        // so check if the current slot is in line with the recent progression.
        let max_index = recent_slots.len() - 1;
        let median_index = max_index / 2;
        let median_recent_slot = recent_slots[median_index];
        let expected_current_slot =
            median_recent_slot.saturating_add((max_index - median_index) as u64);
        let max_reasonable_current_slot =
            expected_current_slot.saturating_add(self.max_slot_skip_distance);

        // Return the highest slot that doesn't exceed what we believe is a
        // reasonable slot.
        recent_slots
            .into_iter()
            .rev()
            .find(|slot| *slot <= max_reasonable_current_slot)
            .unwrap_or(0)
    }
}
