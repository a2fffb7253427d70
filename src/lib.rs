//! Sends transactions straight to the TPU ports of the upcoming leaders.
//!
//! [`TpuClient`] keeps a cache of the leader schedule ahead of the estimated
//! current slot and fans every submission out to the leaders of the next
//! few slots over UDP.
pub mod config;
pub mod engine;
pub mod tpu_client_turbo;

pub use {
    engine::{
        backend_tpu_client::{Result, TpuSenderError},
        cluster_source::{ClusterInfoSource, ClusterNode},
        leader_tpu_cache::LeaderSockets,
        recent_leaders_slot::{TpuClientConfig, DEFAULT_FANOUT_SLOTS, MAX_FANOUT_SLOTS},
    },
    tpu_client_turbo::TpuClient,
};
